use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authenticated identity of whoever opens a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity(pub String);

impl CallerIdentity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self(subject.into())
    }

    pub fn anonymous() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_anonymous() {
            f.write_str("anonymous")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutpostRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Resolves outpost identities to their records.
#[async_trait]
pub trait OutpostDirectory: Send + Sync {
    async fn lookup(&self, outpost_id: &str) -> Option<OutpostRecord>;
}

/// Yes/no decision on whether a caller may view an outpost.
#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn is_authorized(&self, caller: &CallerIdentity, outpost_id: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub outpost_id: String,
    pub caller: CallerIdentity,
    pub channel_id: String,
}
