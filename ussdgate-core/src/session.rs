// ABOUTME: Session key identifying every HTTP turn of one USSD conversation.
// ABOUTME: Built from the canonical sender path and the provider's session identifier.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for one USSD session: `<sender path>-<provider session id>`.
///
/// The sender path is the numeric path of a strict tel URN, so it never
/// contains the separator and two distinct (sender, session) pairs cannot
/// produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(sender: &str, session_id: &str) -> Self {
        Self(format!("{}-{}", sender, session_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_is_deterministic() {
        let a = SessionKey::new("250788383383", "sess-1");
        let b = SessionKey::new("250788383383", "sess-1");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "250788383383-sess-1");
    }

    #[test]
    fn test_session_key_differs_per_sender_and_session() {
        let base = SessionKey::new("250788383383", "1");
        assert_ne!(base, SessionKey::new("250788383384", "1"));
        assert_ne!(base, SessionKey::new("250788383383", "2"));
    }
}
