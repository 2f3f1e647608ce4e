//! Role-tagged chat messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The speaker of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
    Assistant,
    Undefined,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::System => "system",
            Role::Assistant => "assistant",
            Role::Undefined => "undefined",
        };
        f.write_str(s)
    }
}

/// An immutable piece of chat text.
///
/// The role is fixed by the constructor used; a message with a different role
/// or content is a different message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: String,
}

impl Message {
    /// Creates a message without a role.
    pub fn new(content: impl Into<String>) -> Self {
        Self::with_role(Role::Undefined, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Returns a new message with the same role and the given content.
    pub fn rewritten(&self, content: impl Into<String>) -> Self {
        Self::with_role(self.role, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_fix_the_role() {
        assert_eq!(Message::new("a").role(), Role::Undefined);
        assert_eq!(Message::user("a").role(), Role::User);
        assert_eq!(Message::system("a").role(), Role::System);
        assert_eq!(Message::assistant("a").role(), Role::Assistant);
    }

    #[test]
    fn rewritten_keeps_role() {
        let msg = Message::system("before");
        let next = msg.rewritten("after");
        assert_eq!(next.role(), Role::System);
        assert_eq!(next.content(), "after");
        assert_eq!(msg.content(), "before");
    }

    #[test]
    fn serializes_as_role_and_content() {
        let json = serde_json::to_value(Message::new("Hello")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"role": "undefined", "content": "Hello"})
        );
    }

    #[test]
    fn role_display() {
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }
}
