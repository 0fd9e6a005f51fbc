use crate::embeddings::Embedder;
use crate::models::SearchResult;
use crate::orchestrator::RetrievalManager;
use crate::traits::AnswerGenerator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

pub const NO_CONTEXT_ANSWER: &str =
    "I couldn't find any relevant information in the documents to answer your question.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// Conversation history owned by the caller. Nothing is shared between
/// sessions; dropping one forgets its turns.
#[derive(Debug, Clone, Default)]
pub struct ChatSession {
    messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SearchResult>,
    /// Set when retrieval failed and the answer was produced without context.
    pub notice: Option<String>,
}

/// Search results plus the reason they are empty when the search failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieved {
    pub results: Vec<SearchResult>,
    pub notice: Option<String>,
}

/// Runs a search that never fails: an error becomes an empty result with a
/// notice for the user.
pub fn retrieve<E: Embedder>(
    manager: &mut RetrievalManager<E>,
    question: &str,
    k: usize,
) -> Retrieved {
    match manager.query(question, k) {
        Ok(results) => Retrieved {
            results,
            notice: None,
        },
        Err(retrieval_error) => {
            warn!(question, error = %retrieval_error, "retrieval failed, continuing without context");
            Retrieved {
                results: Vec::new(),
                notice: Some(format!("Document search failed: {retrieval_error}")),
            }
        }
    }
}

/// Retrieves context for `question`, asks `generator` for an answer and
/// records both turns in `session`.
///
/// Never fails: a retrieval error degrades to an empty context with a
/// notice, and a generation error becomes the answer text.
pub async fn ask<E, G>(
    manager: &mut RetrievalManager<E>,
    generator: &G,
    session: &mut ChatSession,
    question: &str,
    k: usize,
) -> Answer
where
    E: Embedder,
    G: AnswerGenerator + ?Sized,
{
    let Retrieved { results: sources, notice } = retrieve(manager, question, k);

    let text = if sources.is_empty() {
        info!(question, "no relevant context found");
        NO_CONTEXT_ANSWER.to_string()
    } else {
        match generator
            .generate(session.messages(), question, &sources)
            .await
        {
            Ok(text) => text,
            Err(generation_error) => {
                error!(question, error = %generation_error, "answer generation failed");
                format!("I encountered an error while generating the response: {generation_error}")
            }
        }
    };

    session.push(Role::User, question);
    session.push(Role::Assistant, text.clone());

    Answer {
        text,
        sources,
        notice,
    }
}
