pub mod chat;
pub mod health;
pub mod variants;

// Re-export all handlers for easy route registration
pub use chat::{chat_handler, variant_chat_handler};
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use variants::list_variants;
