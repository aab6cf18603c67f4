use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a tenant.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of tenant IDs with other string identifiers. The value is opaque
/// to the relay; it only has to be non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unique identifier for a persisted message.
///
/// Backed by a UUIDv7, so ids created later compare greater. This is what
/// lets a message id double as a pagination cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Persistent tenant record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,

    /// Desired number of concurrent handler slots.
    pub concurrency: usize,

    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(id: TenantId, concurrency: usize) -> Self {
        Self {
            id,
            concurrency,
            created_at: Utc::now(),
        }
    }
}

/// A message durably persisted by a pipeline handler.
///
/// Immutable once stored; the relay only ever lists messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub tenant_id: TenantId,

    /// Opaque payload bytes as delivered by the broker.
    pub payload: Vec<u8>,

    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with a freshly allocated id.
    pub fn new(tenant_id: TenantId, payload: impl Into<Vec<u8>>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            tenant_id,
            payload: payload.into(),
            created_at,
        }
    }
}

/// One page of a cursor-paginated message listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub messages: Vec<Message>,

    /// Id of the last message in a full page; `None` once the data is exhausted.
    pub next_cursor: Option<MessageId>,
}
