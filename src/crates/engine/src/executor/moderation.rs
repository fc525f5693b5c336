//! Content moderation of relayed output.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModerationError {
    /// The text must not be delivered.
    #[error("content blocked: {0}")]
    Blocked(String),

    /// The check itself could not be completed.
    #[error("moderation check failed: {0}")]
    CheckFailed(String),
}

/// Judges accumulated generated text.
#[async_trait]
pub trait Moderation: Send + Sync {
    async fn check(&self, text: &str) -> Result<(), ModerationError>;
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Moderation for AllowAll {
    async fn check(&self, _text: &str) -> Result<(), ModerationError> {
        Ok(())
    }
}

/// Blocks text containing any configured phrase, ignoring case.
#[derive(Debug, Clone, Default)]
pub struct KeywordModeration {
    blocked: Vec<String>,
}

impl KeywordModeration {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            blocked: phrases
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

#[async_trait]
impl Moderation for KeywordModeration {
    async fn check(&self, text: &str) -> Result<(), ModerationError> {
        let lowered = text.to_lowercase();
        match self.blocked.iter().find(|phrase| lowered.contains(phrase.as_str())) {
            Some(phrase) => Err(ModerationError::Blocked(format!("matched {:?}", phrase))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAll.check("anything").await.is_ok());
    }

    #[tokio::test]
    async fn test_keyword_blocks_case_insensitive() {
        let moderation = KeywordModeration::new(["Forbidden Topic", "  "]);
        assert!(!moderation.is_empty());

        assert!(moderation.check("a harmless answer").await.is_ok());
        assert!(matches!(
            moderation.check("about the FORBIDDEN topic").await,
            Err(ModerationError::Blocked(_))
        ));
    }
}
