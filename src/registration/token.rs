//! Correlation tokens.
//!
//! A token is `uat-<entity prefix>-<base36 millis>-<base36 random>`: no
//! whitespace, lower-case ASCII only, so it survives being embedded in a run
//! title and found again with a plain substring search.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const TOKEN_PREFIX: &str = "uat";
const ENTITY_PREFIX_LEN: usize = 8;
const RANDOM_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `text` embeds this token verbatim.
    pub fn is_in(&self, text: &str) -> bool {
        !self.0.is_empty() && text.contains(&self.0)
    }
}

impl std::fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Mint a fresh token for `entity_id` at the current time.
pub fn generate(entity_id: &str) -> CorrelationToken {
    generate_at(entity_id, Utc::now())
}

/// Mint a token with an explicit timestamp; the random suffix still varies.
pub fn generate_at(entity_id: &str, now: DateTime<Utc>) -> CorrelationToken {
    let prefix: String = entity_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(ENTITY_PREFIX_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    let prefix = if prefix.is_empty() { "x".to_string() } else { prefix };

    let millis = u128::try_from(now.timestamp_millis()).unwrap_or_default();
    let random = to_base36(uuid::Uuid::new_v4().as_u128());
    let random = &random[..random.len().min(RANDOM_LEN)];

    CorrelationToken(format!(
        "{}-{}-{}-{}",
        TOKEN_PREFIX,
        prefix,
        to_base36(millis),
        random
    ))
}

/// Lower-case base-36 rendering.
pub fn to_base36(mut value: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_token_embeds_entity_prefix() {
        let token = generate("4f2a9c1e-77b0-4d2b-9a51-0c3e8d6f1a22");
        assert!(token.as_str().starts_with("uat-4f2a9c1e-"));
    }

    #[test]
    fn test_token_has_no_whitespace() {
        let token = generate("my api with spaces");
        assert!(!token.as_str().chars().any(char::is_whitespace));
        assert!(token.as_str().starts_with("uat-myapiwit-"));
    }

    #[test]
    fn test_token_has_four_segments() {
        let token = generate("abc");
        assert_eq!(token.as_str().split('-').count(), 4);
    }

    #[test]
    fn test_empty_entity_id_still_produces_token() {
        let token = generate("");
        assert!(token.as_str().starts_with("uat-x-"));
    }

    #[test]
    fn test_ten_thousand_tokens_are_distinct() {
        let tokens: HashSet<_> = (0..10_000).map(|_| generate("same-entity")).collect();
        assert_eq!(tokens.len(), 10_000);
    }

    #[test]
    fn test_same_timestamp_still_distinct() {
        let now = Utc::now();
        let a = generate_at("entity", now);
        let b = generate_at("entity", now);
        assert_ne!(a, b);
    }

    #[test]
    fn test_is_in_matches_substring() {
        let token = CorrelationToken::from("uat-abc-1-2");
        assert!(token.is_in("UAT registration uat-abc-1-2 (PizzaAPI 1.0)"));
        assert!(!token.is_in("UAT registration uat-abc-1-3"));
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }
}
