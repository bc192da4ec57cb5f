//! Resumable page token for multi-phase enumerations.
//!
//! A cursor is a stack of frames. The top frame names the sub-query being
//! paged and its offset. An empty stack means the enumeration is complete
//! and is never encoded: it is reported as "no token".
//!
//! Tokens are `{"v":1,"frames":[...]}` in URL-safe unpadded base64. The
//! empty string decodes to the start cursor. Anything else that does not
//! decode cleanly is rejected rather than restarted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::resource::ResourceType;
use crate::{ServiceNowError, ServiceNowResult};

const TOKEN_VERSION: u32 = 1;

/// One level of a traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub resource_type: ResourceType,
    pub resource_id: String,
    #[serde(default)]
    pub offset: u64,
}

impl Frame {
    #[must_use]
    pub fn new(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
            offset: 0,
        }
    }

    #[must_use]
    pub fn at(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

#[derive(Serialize, Deserialize)]
struct EncodedCursor {
    v: u32,
    frames: Vec<Frame>,
}

/// Immutable traversal stack. Every transition returns a new cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCursor {
    frames: Vec<Frame>,
}

impl PageCursor {
    /// Start cursor with no frames.
    #[must_use]
    pub fn start() -> Self {
        Self::default()
    }

    /// Cursor holding a single frame.
    #[must_use]
    pub fn single(frame: Frame) -> Self {
        Self {
            frames: vec![frame],
        }
    }

    #[must_use]
    pub fn push(&self, frame: Frame) -> Self {
        let mut frames = self.frames.clone();
        frames.push(frame);
        Self { frames }
    }

    /// Returns the cursor without its top frame, and that frame.
    #[must_use]
    pub fn pop(&self) -> (Self, Option<Frame>) {
        let mut frames = self.frames.clone();
        let top = frames.pop();
        (Self { frames }, top)
    }

    #[must_use]
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Replaces the top frame's offset.
    #[must_use]
    pub fn advance(&self, offset: u64) -> Self {
        let mut frames = self.frames.clone();
        if let Some(top) = frames.last_mut() {
            top.offset = offset;
        }
        Self { frames }
    }

    /// Frames from bottom to top.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Encodes the cursor, or `None` when the traversal is complete.
    pub fn encode(&self) -> ServiceNowResult<Option<String>> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        let json = serde_json::to_vec(&EncodedCursor {
            v: TOKEN_VERSION,
            frames: self.frames.clone(),
        })?;
        Ok(Some(URL_SAFE_NO_PAD.encode(json)))
    }

    /// Decodes a token. The empty string is the start cursor.
    pub fn decode(token: &str) -> ServiceNowResult<Self> {
        if token.is_empty() {
            return Ok(Self::start());
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| ServiceNowError::InvalidCursor(format!("not base64: {e}")))?;
        let decoded: EncodedCursor = serde_json::from_slice(&bytes)
            .map_err(|e| ServiceNowError::InvalidCursor(format!("malformed token: {e}")))?;

        if decoded.v != TOKEN_VERSION {
            return Err(ServiceNowError::InvalidCursor(format!(
                "unsupported token version {}",
                decoded.v
            )));
        }
        if decoded.frames.is_empty() {
            return Err(ServiceNowError::InvalidCursor(
                "token has no frames".into(),
            ));
        }

        Ok(Self {
            frames: decoded.frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_token_is_start() {
        let cursor = PageCursor::decode("").unwrap();
        assert!(cursor.is_empty());
        assert_eq!(cursor.encode().unwrap(), None);
    }

    #[test]
    fn test_stack_transitions_are_immutable() {
        let start = PageCursor::single(Frame::new(ResourceType::Role, "r1"));
        let (rest, role) = start.pop();
        assert_eq!(role.unwrap().resource_id, "r1");
        assert_eq!(start.depth(), 1);

        let expanded = rest
            .push(Frame::new(ResourceType::Group, "r1"))
            .push(Frame::new(ResourceType::User, "r1"));
        assert_eq!(expanded.top().unwrap().resource_type, ResourceType::User);

        let advanced = expanded.advance(50);
        assert_eq!(advanced.top().unwrap().offset, 50);
        assert_eq!(expanded.top().unwrap().offset, 0);
    }

    #[test]
    fn test_token_survives_encoding() {
        let cursor = PageCursor::single(Frame::new(ResourceType::Group, "r1"))
            .push(Frame::new(ResourceType::User, "r1").at(100));
        let token = cursor.encode().unwrap().unwrap();
        assert!(!token.contains('='));
        assert_eq!(PageCursor::decode(&token).unwrap(), cursor);
    }

    #[test]
    fn test_garbage_is_rejected() {
        for token in ["%%%", "bm90IGpzb24", "e30"] {
            let err = PageCursor::decode(token).unwrap_err();
            assert!(matches!(err, ServiceNowError::InvalidCursor(_)), "{token}");
        }
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let token = URL_SAFE_NO_PAD
            .encode(br#"{"v":2,"frames":[{"resource_type":"role","resource_id":"r1"}]}"#);
        let err = PageCursor::decode(&token).unwrap_err();
        assert!(err.to_string().contains("version 2"));
    }

    #[test]
    fn test_unknown_resource_type_is_rejected() {
        let token = URL_SAFE_NO_PAD
            .encode(br#"{"v":1,"frames":[{"resource_type":"app","resource_id":"r1"}]}"#);
        assert!(PageCursor::decode(&token).is_err());
    }

    #[test]
    fn test_empty_frame_list_is_rejected() {
        let token = URL_SAFE_NO_PAD.encode(br#"{"v":1,"frames":[]}"#);
        let err = PageCursor::decode(&token).unwrap_err();
        assert!(err.to_string().contains("no frames"));
    }
}
