//! Role-tagged prompt translation for chat backends.
//!
//! The rest of the runtime treats every backend as text completion; only the
//! driver knows about chat framing. Prompts destined for a chat endpoint may
//! embed `<lmql:ROLE/>` tags, which this module parses into an ordered list
//! of role/content segments.

use serde_json::{json, Value};

const TAG_OPEN: &str = "<lmql:";
const TAG_CLOSE: &str = "/>";

/// The author role of one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn parse(tag: &str) -> Option<Role> {
        match tag {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// One contiguous run of text under a single role.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub role: Role,
    pub text: String,
}

/// Split a prompt on `<lmql:ROLE/>` tags.
///
/// Text before the first tag belongs to the user role. An unknown role tag
/// logs a warning and falls back to user. Consecutive text between two tags
/// forms exactly one segment.
pub fn tagged_segments(prompt: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut role = None;
    let mut offset = 0;

    let mut search = 0;
    while let Some(start) = prompt[search..].find(TAG_OPEN) {
        let start = search + start;
        let tag_body_start = start + TAG_OPEN.len();
        let Some(end) = prompt[tag_body_start..].find(TAG_CLOSE) else {
            break;
        };
        let tag = &prompt[tag_body_start..tag_body_start + end];
        let tag_end = tag_body_start + end + TAG_CLOSE.len();

        if start > offset {
            segments.push(Segment {
                role: role.unwrap_or(Role::User),
                text: prompt[offset..start].to_string(),
            });
        }
        role = match Role::parse(tag) {
            Some(r) => Some(r),
            None => {
                tracing::warn!(
                    tag,
                    "unknown role tag in chat prompt, falling back to user"
                );
                Some(Role::User)
            }
        };
        offset = tag_end;
        search = tag_end;
    }

    segments.push(Segment {
        role: role.unwrap_or(Role::User),
        text: prompt[offset..].to_string(),
    });
    segments
}

/// Serialize segments back into the tagged prompt form. Left-inverse of
/// [`tagged_segments`] for prompts that start with a tag.
pub fn serialize_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| format!("{TAG_OPEN}{}{TAG_CLOSE}{}", s.role.as_str(), s.text))
        .collect()
}

/// The ordered `{role, content}` message list for a chat provider call.
pub fn to_messages(prompt: &str) -> Vec<Value> {
    tagged_segments(prompt)
        .into_iter()
        .map(|s| json!({ "role": s.role.as_str(), "content": s.text }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_prompt_is_user() {
        let segments = tagged_segments("just some text");
        assert_eq!(
            segments,
            vec![Segment {
                role: Role::User,
                text: "just some text".into()
            }]
        );
    }

    #[test]
    fn test_system_user_split() {
        let segments = tagged_segments("<lmql:system/>S<lmql:user/>U");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].role, Role::System);
        assert_eq!(segments[0].text, "S");
        assert_eq!(segments[1].role, Role::User);
        assert_eq!(segments[1].text, "U");
    }

    #[test]
    fn test_leading_text_before_tag() {
        let segments = tagged_segments("hello<lmql:assistant/>world");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].role, Role::User);
        assert_eq!(segments[0].text, "hello");
        assert_eq!(segments[1].role, Role::Assistant);
        assert_eq!(segments[1].text, "world");
    }

    #[test]
    fn test_unknown_tag_falls_back_to_user() {
        let segments = tagged_segments("<lmql:wizard/>abracadabra");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].role, Role::User);
        assert_eq!(segments[0].text, "abracadabra");
    }

    #[test]
    fn test_to_messages_shape() {
        let messages = to_messages("<lmql:system/>S<lmql:user/>U");
        assert_eq!(
            messages,
            vec![
                json!({"role": "system", "content": "S"}),
                json!({"role": "user", "content": "U"}),
            ]
        );
    }

    #[test]
    fn test_serialize_is_left_inverse() {
        let prompt = "<lmql:system/>You are terse.<lmql:user/>Hi!<lmql:assistant/>Hello.";
        let segments = tagged_segments(prompt);
        assert_eq!(serialize_segments(&segments), prompt);
    }

    #[test]
    fn test_empty_segment_between_tags_preserved() {
        let segments = tagged_segments("<lmql:system/><lmql:user/>U");
        // the empty system run is dropped, the user run survives
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].role, Role::User);
        assert_eq!(segments[0].text, "U");
    }
}
