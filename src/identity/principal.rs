use serde::{Deserialize, Serialize};

/// Authenticated principal issued by the identity provider. Immutable for a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Identity {
    pub id: String,
    pub email: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self { id: id.into(), email: email.into() }
    }
}
