//! Classification of a single SSE data payload.
//!
//! Chat-completions streams send one JSON object per event, each carrying an
//! incremental fragment in `choices[0].delta.content`, and finish with the
//! literal `[DONE]`.

use serde::Deserialize;

/// Literal payload marking the end of streamed content.
pub const DONE_SENTINEL: &str = "[DONE]";

/// What a raw `data:` payload means for the reply being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// End-of-content sentinel. Carries nothing; the stream closes next.
    Done,
    /// A non-empty content fragment.
    Delta(String),
    /// A well-formed chunk without content (role headers, finish markers).
    Empty,
    /// Not a chat-completion chunk. Skipped, never fatal.
    Malformed(String),
}

impl StreamFrame {
    /// Classifies a raw payload.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == DONE_SENTINEL {
            return StreamFrame::Done;
        }

        let chunk: ChunkPayload = match serde_json::from_str(raw) {
            Ok(chunk) => chunk,
            Err(e) => return StreamFrame::Malformed(e.to_string()),
        };

        let Some(choice) = chunk.choices.into_iter().next() else {
            return StreamFrame::Malformed("chunk has no choices".to_string());
        };

        match choice.delta.and_then(|d| d.content) {
            Some(content) if !content.is_empty() => StreamFrame::Delta(content),
            _ => StreamFrame::Empty,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_sentinel_is_recognised() {
        assert_eq!(StreamFrame::parse("[DONE]"), StreamFrame::Done);
        assert_eq!(StreamFrame::parse(" [DONE]\n"), StreamFrame::Done);
    }

    #[test]
    fn content_delta_is_extracted() {
        let raw = r#"{"id":"1","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        assert_eq!(StreamFrame::parse(raw), StreamFrame::Delta("Hi".to_string()));
    }

    #[test]
    fn whitespace_fragment_is_content() {
        let raw = r#"{"choices":[{"delta":{"content":" "}}]}"#;
        assert_eq!(StreamFrame::parse(raw), StreamFrame::Delta(" ".to_string()));
    }

    #[test]
    fn role_only_delta_is_empty() {
        let raw = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(StreamFrame::parse(raw), StreamFrame::Empty);
    }

    #[test]
    fn empty_or_null_content_is_empty() {
        assert_eq!(
            StreamFrame::parse(r#"{"choices":[{"delta":{"content":""}}]}"#),
            StreamFrame::Empty
        );
        assert_eq!(
            StreamFrame::parse(r#"{"choices":[{"delta":{"content":null}}]}"#),
            StreamFrame::Empty
        );
    }

    #[test]
    fn missing_delta_is_empty() {
        let raw = r#"{"choices":[{"finish_reason":"stop"}]}"#;
        assert_eq!(StreamFrame::parse(raw), StreamFrame::Empty);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(StreamFrame::parse("{not json"), StreamFrame::Malformed(_)));
        assert!(matches!(StreamFrame::parse(""), StreamFrame::Malformed(_)));
    }

    #[test]
    fn no_choices_is_malformed() {
        assert!(matches!(
            StreamFrame::parse(r#"{"choices":[]}"#),
            StreamFrame::Malformed(_)
        ));
        assert!(matches!(
            StreamFrame::parse(r#"{"error":{"message":"x"}}"#),
            StreamFrame::Malformed(_)
        ));
    }

    #[test]
    fn wrong_content_type_is_malformed() {
        let raw = r#"{"choices":[{"delta":{"content":42}}]}"#;
        assert!(matches!(StreamFrame::parse(raw), StreamFrame::Malformed(_)));
    }
}
