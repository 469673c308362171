pub mod anthropic;
pub mod client;
pub mod factory;
pub mod openai;

use async_trait::async_trait;
use courier_core::types::{BrainReply, ChatMessage};
use courier_core::Result;

/// A model-serving backend used for the brain or cerebellum role.
///
/// Implementations must report transport failures, timeouts, rate limiting and
/// server errors as [`courier_core::Error::BackendUnavailable`] so the health
/// gate can react; any other failure is a plain provider error.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<BrainReply>;

    /// Identity of the physical backend. Roles that resolve to the same
    /// endpoint share one health probe.
    fn endpoint(&self) -> String;

    /// Cheapest request that proves the backend answers.
    async fn probe(&self) -> Result<()> {
        self.chat(&[ChatMessage::user("ping")]).await.map(|_| ())
    }
}

pub use anthropic::AnthropicProvider;
pub use factory::{
    create_brain_provider, create_cerebellum_provider, create_provider, infer_kind_from_model,
};
pub use openai::OpenAIProvider;
