use async_trait::async_trait;
use std::sync::Arc;

pub mod models;
pub mod openai_vision;
pub mod registry;
pub mod types;
pub use types::*;

/// A multimodal provider (OpenAI-compatible endpoint, local server, ...).
#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// Run one text-generation request and return the full response text.
    /// An empty string is a valid (if unhelpful) answer.
    async fn generate_text(&self, model: &str, messages: &[ChatMessage])
        -> Result<String, AiError>;

    /// Provider name for logging/display
    fn name(&self) -> &str;
}

/// Looks providers up by the id stored in the vision settings.
pub trait ProviderRegistry: Send + Sync {
    fn resolve(&self, provider_id: &str) -> Option<Arc<dyn VisionProvider>>;
}
