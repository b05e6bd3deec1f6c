//! Shared helpers for the cascade crate.

/// Serde helpers for `Duration` serialized as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Same as [`duration_ms`] for `Option<Duration>`.
pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

/// Match a stage id against a simple glob pattern.
///
/// `*` matches any run of characters, `?` matches exactly one. Anything else
/// is literal, so `section.*` matches `section.overview` but not `sections`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_from(&pattern, &text)
}

fn glob_match_from(pattern: &[char], text: &[char]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some('*'), _) => {
            glob_match_from(&pattern[1..], text)
                || (!text.is_empty() && glob_match_from(pattern, &text[1..]))
        }
        (Some('?'), Some(_)) => glob_match_from(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match_from(&pattern[1..], &text[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[test]
    fn test_glob_exact() {
        assert!(glob_match("score", "score"));
        assert!(!glob_match("score", "scores"));
    }

    #[test]
    fn test_glob_star() {
        assert!(glob_match("section.*", "section.overview"));
        assert!(glob_match("section.*", "section."));
        assert!(!glob_match("section.*", "sections"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*.risks", "section.risks"));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(glob_match("stage?", "stage4"));
        assert!(!glob_match("stage?", "stage"));
    }

    #[derive(Serialize, Deserialize)]
    struct Timed {
        #[serde(with = "duration_ms")]
        took: Duration,
        #[serde(with = "option_duration_ms")]
        limit: Option<Duration>,
    }

    #[test]
    fn test_duration_serialized_as_millis() {
        let json = serde_json::to_value(Timed {
            took: Duration::from_millis(1250),
            limit: None,
        })
        .unwrap();
        assert_eq!(json["took"], 1250);
        assert!(json["limit"].is_null());

        let parsed: Timed = serde_json::from_str(r#"{"took": 5, "limit": 30000}"#).unwrap();
        assert_eq!(parsed.took, Duration::from_millis(5));
        assert_eq!(parsed.limit, Some(Duration::from_secs(30)));
    }
}
