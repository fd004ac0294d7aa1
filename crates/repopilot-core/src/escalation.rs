//! Ask-user escalation messages
//!
//! Error text from a failed step is matched against a fixed set of
//! substring categories. Each category has a ready-to-display message;
//! anything unmatched gets the generic one.

use serde::{Deserialize, Serialize};

/// Message shown when the replanner judges confidence too low to retry
pub const CLARIFICATION_MESSAGE: &str = "I'm not confident I understood the question. \
Could you say which repository you mean and what you want to know about it?";

/// Category of a step failure as seen by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskUserCategory {
    NotFound,
    Permission,
    RateLimit,
    Timeout,
    Generic,
}

impl AskUserCategory {
    /// Substrings that select each category, checked in order
    const PATTERNS: [(AskUserCategory, &'static [&'static str]); 4] = [
        (Self::NotFound, &["not found", "404", "does not exist", "no such"]),
        (
            Self::Permission,
            &["permission", "forbidden", "403", "unauthorized", "401", "access denied"],
        ),
        (Self::RateLimit, &["rate limit", "ratelimit", "rate-limit", "429", "too many requests"]),
        (Self::Timeout, &["timeout", "timed out", "deadline"]),
    ];

    /// Classify raw error text
    pub fn classify(error: &str) -> Self {
        let lower = error.to_lowercase();
        Self::PATTERNS
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
            .map(|(category, _)| *category)
            .unwrap_or(Self::Generic)
    }

    /// User-facing message for this category
    pub fn message(&self, step_id: &str) -> String {
        match self {
            Self::NotFound => {
                "I couldn't find that repository. Please check the owner/name spelling \
                 (for example `owner/repo`) and try again."
                    .to_string()
            }
            Self::Permission => {
                "I don't have permission to read that repository. It may be private; \
                 please share a public repository or check the access settings."
                    .to_string()
            }
            Self::RateLimit => {
                "The GitHub API rate limit has been reached. Please wait a few minutes \
                 and ask again."
                    .to_string()
            }
            Self::Timeout => {
                "The analysis took too long to finish. Try again in a moment, or narrow \
                 the question down."
                    .to_string()
            }
            Self::Generic => format!(
                "Something went wrong while running '{}'. Could you rephrase the request \
                 or add a bit more detail?",
                step_id
            ),
        }
    }
}

impl std::fmt::Display for AskUserCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Permission => write!(f, "permission"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Timeout => write!(f, "timeout"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// Build the ask-user message for a failed step
pub fn ask_user_message(step_id: &str, error: &str) -> String {
    AskUserCategory::classify(error).message(step_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_categories() {
        assert_eq!(AskUserCategory::classify("HTTP 404 Not Found"), AskUserCategory::NotFound);
        assert_eq!(AskUserCategory::classify("403 Forbidden"), AskUserCategory::Permission);
        assert_eq!(
            AskUserCategory::classify("API rate limit exceeded for 1.2.3.4"),
            AskUserCategory::RateLimit
        );
        assert_eq!(
            AskUserCategory::classify("Step 'compare' timed out after 30 seconds"),
            AskUserCategory::Timeout
        );
        assert_eq!(AskUserCategory::classify("segfault"), AskUserCategory::Generic);
    }

    #[test]
    fn test_classify_is_case_insensitive() {
        assert_eq!(AskUserCategory::classify("RATE LIMIT"), AskUserCategory::RateLimit);
    }

    #[test]
    fn test_messages_are_distinct() {
        let messages: std::collections::HashSet<String> = [
            AskUserCategory::NotFound,
            AskUserCategory::Permission,
            AskUserCategory::RateLimit,
            AskUserCategory::Timeout,
            AskUserCategory::Generic,
        ]
        .iter()
        .map(|c| c.message("step"))
        .collect();
        assert_eq!(messages.len(), 5);
    }

    #[test]
    fn test_rate_limit_message_wording() {
        let msg = ask_user_message("fetch_repo_b", "GitHub API rate limit exceeded");
        assert!(msg.contains("rate limit"));
    }

    #[test]
    fn test_generic_message_names_step() {
        assert!(ask_user_message("compare", "weird").contains("'compare'"));
    }
}
