use serde::{Deserialize, Serialize};
use std::fmt;

/// Label shown for senders whose profile could not be resolved.
pub const ANONYMOUS_NAME: &str = "Anonymous User";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl Profile {
    pub fn new(
        user_id: UserId,
        display_name: impl Into<String>,
        avatar_ref: Option<String>,
    ) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar_ref,
        }
    }

    /// Stand-in used when enrichment fails, so the message still renders.
    pub fn placeholder(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: ANONYMOUS_NAME.to_string(),
            avatar_ref: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.display_name == ANONYMOUS_NAME && self.avatar_ref.is_none()
    }

    /// Glyph for avatar-less senders.
    pub fn initial(&self) -> char {
        self.display_name
            .chars()
            .next()
            .and_then(|c| c.to_uppercase().next())
            .unwrap_or('U')
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.user_id)
    }
}
