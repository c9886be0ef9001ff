use regex::Regex;
use thiserror::Error;

/// Words censored in every deployment; `chat.extra_blocked_words` adds to them
const BUILTIN_BLOCKED_WORDS: &[&str] = &[
    "fuck", "fucking", "shit", "bitch", "bastard", "asshole", "dick", "cunt", "damn", "crap",
    "piss", "slut", "whore", "motherfucker", "bullshit",
];

/// Content filtering error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentFilterError {
    #[error("Message exceeds maximum length of {max_length} characters")]
    MessageTooLong { max_length: usize },

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Blocked word list cannot be compiled: {0}")]
    InvalidWordList(String),
}

impl From<ContentFilterError> for crate::Error {
    fn from(err: ContentFilterError) -> Self {
        match err {
            ContentFilterError::InvalidWordList(reason) => Self::Internal(reason),
            other => Self::validation("content", other.to_string()),
        }
    }
}

/// Validates chat input and censors blocked words
#[derive(Debug, Clone)]
pub struct ContentFilter {
    /// Maximum message length in characters
    pub max_length: usize,

    /// Whole-word, case-insensitive alternation of every blocked word
    blocked: Regex,
}

impl ContentFilter {
    pub fn new(max_length: usize, extra_words: &[String]) -> Result<Self, ContentFilterError> {
        let mut words: Vec<String> = BUILTIN_BLOCKED_WORDS
            .iter()
            .map(|w| (*w).to_string())
            .chain(
                extra_words
                    .iter()
                    .map(|w| w.trim().to_lowercase())
                    .filter(|w| !w.is_empty()),
            )
            .collect();
        words.sort();
        words.dedup();
        // longest first so "motherfucker" wins over "fuck"
        words.sort_by_key(|w| std::cmp::Reverse(w.chars().count()));

        let alternation = words
            .iter()
            .map(|w| regex::escape(w))
            .collect::<Vec<_>>()
            .join("|");
        let blocked = Regex::new(&format!(r"(?i)\b(?:{alternation})\b"))
            .map_err(|e| ContentFilterError::InvalidWordList(e.to_string()))?;

        Ok(Self {
            max_length,
            blocked,
        })
    }

    /// Trim and check a message; returns the trimmed text
    pub fn validate<'a>(&self, message: &'a str) -> Result<&'a str, ContentFilterError> {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Err(ContentFilterError::EmptyMessage);
        }
        if trimmed.chars().count() > self.max_length {
            return Err(ContentFilterError::MessageTooLong {
                max_length: self.max_length,
            });
        }
        Ok(trimmed)
    }

    #[must_use]
    pub fn contains_blocked(&self, message: &str) -> bool {
        self.blocked.is_match(message)
    }

    /// Censored copy of `message` if it contains a blocked word.
    /// Each match is replaced by as many `*` as it has characters.
    #[must_use]
    pub fn censor(&self, message: &str) -> Option<String> {
        if !self.contains_blocked(message) {
            return None;
        }
        let cleaned = self
            .blocked
            .replace_all(message, |caps: &regex::Captures<'_>| {
                "*".repeat(caps[0].chars().count())
            });
        Some(cleaned.into_owned())
    }
}
