use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   relay.toml:      [provider]
//                    model = "gpt-4o"
//
//   env var:         RELAY_PROVIDER__MODEL=gpt-4o   (double underscore = nesting)
//
//   (single underscore stays within field names: RELAY_RELAY__REQUEST_TIMEOUT_SECS)
//
// Arrays are replaced, not merged: a `[[variants]]` table in relay.toml
// replaces the built-in variant list entirely.

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileConfig {
    /// Variant served by `POST /api/chat`.
    #[serde(default = "default_variant_name")]
    pub default_variant: String,
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub provider: ProviderFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub history: HistoryFileConfig,
    #[serde(default = "default_variants")]
    pub variants: Vec<VariantConfig>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            default_variant: default_variant_name(),
            server: ServerFileConfig::default(),
            provider: ProviderFileConfig::default(),
            relay: RelayFileConfig::default(),
            history: HistoryFileConfig::default(),
            variants: default_variants(),
        }
    }
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Attach a permissive CORS layer.
    #[serde(default = "default_true")]
    pub cors: bool,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors: true,
        }
    }
}

/// Which upstream produces fragments.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions API
    Openai,
    /// Streams the user's message back; no network access
    Echo,
}

/// Upstream model settings (lives under `[provider]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderFileConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Falls back to `OPENAI_API_KEY` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Pause between echo fragments.
    #[serde(default)]
    pub echo_delay_ms: u64,
}

impl Default for ProviderFileConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            echo_delay_ms: 0,
        }
    }
}

impl ProviderFileConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()))
    }
}

/// Relay tunables (lives under `[relay]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    /// Upper bound on one turn, from opening the upstream to the terminator (0 = none).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Events buffered between the relay task and the HTTP body.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: usize,
    #[serde(default = "default_max_attachments")]
    pub max_attachments: usize,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            channel_capacity: default_channel_capacity(),
            max_attachment_bytes: default_max_attachment_bytes(),
            max_attachments: default_max_attachments(),
        }
    }
}

/// Session memory (lives under `[history]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryFileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Turns kept per session (0 = unbounded).
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Idle time after which a session is forgotten (0 = never).
    #[serde(default = "default_history_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for HistoryFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_turns: default_max_turns(),
            ttl_secs: default_history_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// One chat persona (an entry of `[[variants]]`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VariantConfig {
    pub name: String,
    #[serde(default)]
    pub title: String,
    pub system_prompt: String,
    #[serde(default)]
    pub accepts_attachments: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateConfig>,
}

/// Topic restriction: messages must mention one of `keywords`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GateConfig {
    pub keywords: Vec<String>,
    pub refusal: String,
}

fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_provider_kind() -> ProviderKind {
    ProviderKind::Openai
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_channel_capacity() -> usize {
    1
}
fn default_max_attachment_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_max_attachments() -> usize {
    8
}
fn default_max_turns() -> usize {
    50
}
fn default_history_ttl_secs() -> u64 {
    86400
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_variant_name() -> String {
    "advisor".to_string()
}

/// The personas shipped out of the box.
pub fn default_variants() -> Vec<VariantConfig> {
    vec![
        VariantConfig {
            name: "advisor".into(),
            title: "Advisor".into(),
            system_prompt: "You are a wise and supportive assistant who combines warmth and \
                professionalism to provide thoughtful, empathetic guidance while maintaining \
                appropriate boundaries and encouraging positive outcomes."
                .into(),
            accepts_attachments: true,
            gate: None,
        },
        VariantConfig {
            name: "dating".into(),
            title: "Dating Coach".into(),
            system_prompt: "You are an encouraging dating coach. Give practical, respectful \
                advice on meeting people, first dates, conversation and building healthy \
                relationships. Keep answers warm, honest and concise."
                .into(),
            accepts_attachments: false,
            gate: None,
        },
        VariantConfig {
            name: "travel".into(),
            title: "Travel Planner".into(),
            system_prompt: "You are an expert travel planner. Build clear day-by-day \
                itineraries in Markdown with headings, suggested times, transport tips and \
                budget notes. Use any attached documents as extra context."
                .into(),
            accepts_attachments: true,
            gate: Some(GateConfig {
                keywords: [
                    "travel",
                    "trip",
                    "vacation",
                    "holiday",
                    "itinerary",
                    "flight",
                    "hotel",
                    "destination",
                    "visit",
                    "tour",
                    "journey",
                    "sightseeing",
                    "backpack",
                    "cruise",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
                refusal: "I'm sorry, but I can only help with travel planning. Tell me where \
                    you'd like to go and for how long, and I'll put together an itinerary."
                    .into(),
            }),
        },
        VariantConfig {
            name: "astrology".into(),
            title: "Astrology Reader".into(),
            system_prompt: "You are a friendly astrology reader. Offer playful, positive \
                readings based on the user's sign or birth details, and remind them that \
                astrology is for reflection and entertainment."
                .into(),
            accepts_attachments: false,
            gate: None,
        },
    ]
}

/// Build a figment that layers: defaults → relay.toml → RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_SERVER__PORT=8080`  →  `server.port = 8080`
///   `RELAY_HISTORY__ENABLED=false`  →  `history.enabled = false`
pub fn load_config(path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("RELAY_").split("__"))
}

impl FileConfig {
    /// Load and validate the layered configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let config: FileConfig = load_config(path)
            .extract()
            .map_err(|e| anyhow!("invalid configuration in {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.variants.is_empty() {
            bail!("at least one variant must be configured");
        }

        let mut seen = HashSet::new();
        for variant in &self.variants {
            if variant.name.trim().is_empty() {
                bail!("variant names must not be empty");
            }
            if !seen.insert(variant.name.as_str()) {
                bail!("duplicate variant name: {}", variant.name);
            }
            if let Some(gate) = &variant.gate {
                if gate.keywords.iter().all(|k| k.trim().is_empty()) {
                    bail!("variant {} has a gate with no keywords", variant.name);
                }
                if gate.refusal.is_empty() {
                    bail!("variant {} has a gate with an empty refusal", variant.name);
                }
            }
        }

        if !seen.contains(self.default_variant.as_str()) {
            bail!("default variant {} is not configured", self.default_variant);
        }
        if self.relay.channel_capacity == 0 {
            bail!("relay.channel_capacity must be at least 1");
        }
        Ok(())
    }
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Ceilings applied while reading a turn's uploads.
#[derive(Clone, Copy, Debug)]
pub struct AttachmentLimits {
    pub max_attachment_bytes: usize,
    pub max_attachments: usize,
}

impl AttachmentLimits {
    /// Request body ceiling: every upload at full size plus room for text fields.
    pub fn max_request_bytes(&self) -> usize {
        self.max_attachment_bytes
            .saturating_mul(self.max_attachments)
            .saturating_add(1024 * 1024)
    }
}

/// Relay behaviour (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// None = no deadline
    pub request_timeout: Option<Duration>,
    pub channel_capacity: usize,
    pub limits: AttachmentLimits,
}

impl RelayConfig {
    pub fn from_file(fc: &RelayFileConfig) -> Self {
        Self {
            request_timeout: if fc.request_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.request_timeout_secs))
            },
            channel_capacity: fc.channel_capacity.max(1),
            limits: AttachmentLimits {
                max_attachment_bytes: fc.max_attachment_bytes,
                max_attachments: fc.max_attachments,
            },
        }
    }
}

/// Session memory (runtime view).
#[derive(Clone, Debug)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub max_turns: Option<usize>,
    pub ttl: Option<Duration>,
    pub sweep_interval: Duration,
}

impl HistoryConfig {
    pub fn from_file(fc: &HistoryFileConfig) -> Self {
        Self {
            enabled: fc.enabled,
            max_turns: (fc.max_turns > 0).then_some(fc.max_turns),
            ttl: (fc.ttl_secs > 0).then(|| Duration::from_secs(fc.ttl_secs)),
            sweep_interval: Duration::from_secs(fc.sweep_interval_secs.max(1)),
        }
    }
}
