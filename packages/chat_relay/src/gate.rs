//! Topic gate: keyword admission for restricted variants.

use crate::config::GateConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gate {
    /// Lowercased, trimmed, non-empty.
    keywords: Vec<String>,
    refusal: String,
}

impl Gate {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            keywords: config
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            refusal: config.refusal.clone(),
        }
    }

    /// True when the message mentions at least one keyword (case-insensitive substring).
    pub fn admits(&self, message: &str) -> bool {
        let message = message.to_lowercase();
        self.keywords.iter().any(|k| message.contains(k.as_str()))
    }

    pub fn refusal(&self) -> &str {
        &self.refusal
    }
}
