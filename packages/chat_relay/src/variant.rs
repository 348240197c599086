//! Chat variants: personas that differ only in prompt, gate and upload support.

use anyhow::{Result, bail};
use serde::Serialize;
use std::sync::Arc;

use crate::config::{FileConfig, VariantConfig};
use crate::gate::Gate;

#[derive(Debug)]
pub struct Variant {
    pub name: String,
    pub title: String,
    pub system_prompt: String,
    pub accepts_attachments: bool,
    pub gate: Option<Gate>,
}

impl Variant {
    pub fn from_config(config: &VariantConfig) -> Self {
        Self {
            name: config.name.clone(),
            title: if config.title.is_empty() {
                config.name.clone()
            } else {
                config.title.clone()
            },
            system_prompt: config.system_prompt.clone(),
            accepts_attachments: config.accepts_attachments,
            gate: config.gate.as_ref().map(Gate::new),
        }
    }
}

/// Public description of a variant, served by `GET /api/variants`.
#[derive(Debug, Clone, Serialize)]
pub struct VariantDescriptor {
    pub name: String,
    pub title: String,
    pub accepts_attachments: bool,
    pub gated: bool,
    pub default: bool,
}

#[derive(Debug)]
pub struct VariantRegistry {
    variants: Vec<Arc<Variant>>,
    default_index: usize,
}

impl VariantRegistry {
    pub fn new(variants: Vec<Variant>, default_name: &str) -> Result<Self> {
        let Some(default_index) = variants.iter().position(|v| v.name == default_name) else {
            bail!("default variant {} is not configured", default_name);
        };
        Ok(Self {
            variants: variants.into_iter().map(Arc::new).collect(),
            default_index,
        })
    }

    pub fn from_config(config: &FileConfig) -> Result<Self> {
        Self::new(
            config.variants.iter().map(Variant::from_config).collect(),
            &config.default_variant,
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<Variant>> {
        self.variants.iter().find(|v| v.name == name).cloned()
    }

    pub fn default_variant(&self) -> Arc<Variant> {
        self.variants[self.default_index].clone()
    }

    pub fn descriptors(&self) -> Vec<VariantDescriptor> {
        self.variants
            .iter()
            .enumerate()
            .map(|(i, v)| VariantDescriptor {
                name: v.name.clone(),
                title: v.title.clone(),
                accepts_attachments: v.accepts_attachments,
                gated: v.gate.is_some(),
                default: i == self.default_index,
            })
            .collect()
    }
}
