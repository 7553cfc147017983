//! Cross-frame message shapes exchanged with the embedding parent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// `type` of the outbound snapshot message.
pub const SNAPSHOT_MESSAGE_TYPE: &str = "truthseo:snapshot";
/// `type` of the inbound navigate message.
pub const NAVIGATE_MESSAGE_TYPE: &str = "truthseo:navigate";

/// Well-formed messages of the snapshot protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FrameMessage {
    /// Serialized document sent to the parent.
    #[serde(rename = "truthseo:snapshot")]
    Snapshot {
        /// Document markup, transformed when the profile sanitizes.
        html: String,
    },
    /// Route change requested by the parent.
    #[serde(rename = "truthseo:navigate")]
    Navigate {
        /// Path (and optional query) to show.
        #[serde(rename = "targetPath")]
        target_path: String,
    },
}

/// An inbound navigate message as it arrived, before the target is validated.
///
/// Any payload whose `type` is `truthseo:navigate` counts as a navigate request; the route only
/// changes when `targetPath` is a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigateRequest {
    /// `targetPath` when it was a JSON string.
    pub target_path: Option<String>,
}

impl NavigateRequest {
    /// Recognizes a navigate request in an arbitrary message payload.
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.get("type").and_then(Value::as_str) != Some(NAVIGATE_MESSAGE_TYPE) {
            return None;
        }
        Some(Self {
            target_path: value
                .get("targetPath")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Origin restriction applied when posting to the parent frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetOrigin {
    /// `*`: any embedding origin receives the message.
    #[default]
    Any,
    /// Only a parent with exactly this serialized origin receives the message.
    Exact(String),
}

impl TargetOrigin {
    /// Whether a parent at `origin` receives messages posted with this restriction.
    pub fn admits(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == origin,
        }
    }

    /// True for the wildcard.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Any)
    }
}

impl fmt::Display for TargetOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(origin) => f.write_str(origin),
        }
    }
}

impl FromStr for TargetOrigin {
    type Err = url::ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed == "*" {
            return Ok(Self::Any);
        }
        let url = Url::parse(trimmed)?;
        Ok(Self::Exact(url.origin().ascii_serialization()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn snapshot_serializes_with_protocol_tag() {
        let message = FrameMessage::Snapshot {
            html: "<html></html>".into(),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "truthseo:snapshot", "html": "<html></html>"})
        );
    }

    #[test]
    fn navigate_uses_camel_case_target() {
        let parsed: FrameMessage =
            serde_json::from_value(json!({"type": "truthseo:navigate", "targetPath": "/about"}))
                .unwrap();
        assert_eq!(
            parsed,
            FrameMessage::Navigate {
                target_path: "/about".into()
            }
        );
    }

    #[test]
    fn navigate_request_tolerates_missing_or_odd_targets() {
        assert_eq!(
            NavigateRequest::from_value(&json!({"type": "truthseo:navigate", "targetPath": 7})),
            Some(NavigateRequest { target_path: None })
        );
        assert_eq!(
            NavigateRequest::from_value(&json!({"type": "truthseo:navigate"})),
            Some(NavigateRequest { target_path: None })
        );
        assert_eq!(NavigateRequest::from_value(&json!({"type": "other"})), None);
        assert_eq!(NavigateRequest::from_value(&json!("truthseo:navigate")), None);
    }

    #[test]
    fn target_origin_parses_wildcard_and_urls() {
        assert_eq!("*".parse::<TargetOrigin>().unwrap(), TargetOrigin::Any);
        assert_eq!(
            "https://crawler.example.com/some/path".parse::<TargetOrigin>().unwrap(),
            TargetOrigin::Exact("https://crawler.example.com".into())
        );
        assert!("not a url".parse::<TargetOrigin>().is_err());
    }

    #[test]
    fn exact_origin_admits_only_itself() {
        let origin = TargetOrigin::Exact("https://a.example".into());
        assert!(origin.admits("https://a.example"));
        assert!(!origin.admits("https://b.example"));
        assert!(TargetOrigin::Any.admits("https://b.example"));
    }
}
