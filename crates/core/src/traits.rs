use crate::error::GenerationError;
use crate::models::SearchResult;
use crate::session::ChatMessage;
use async_trait::async_trait;

/// The text-generation service that turns a question and its retrieved
/// context into prose. `history` holds the earlier turns of the session,
/// oldest first, and excludes `question`.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(
        &self,
        history: &[ChatMessage],
        question: &str,
        context: &[SearchResult],
    ) -> Result<String, GenerationError>;
}
