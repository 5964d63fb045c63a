//! Cluster event envelope and payloads.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::CacheOperation;

/// Which datacenters a notification reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DcNotify {
    AllDcs,
    LocalDcOnly,
    AllButLocalDc,
}

impl DcNotify {
    /// Whether a node in `target_site` is reached from `sender_site`.
    pub fn reaches(&self, sender_site: Option<&str>, target_site: Option<&str>) -> bool {
        match self {
            Self::AllDcs => true,
            Self::LocalDcOnly => sender_site == target_site,
            Self::AllButLocalDc => sender_site != target_site,
        }
    }
}

/// Discriminant of [`ClusterEventPayload`], used for listener subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterEventType {
    RemoveUserSession,
    RemoveAllUserSessions,
    RealmRemoved,
    ClientRemoved,
    RemoveAllLoginFailures,
    SessionChanged,
    TaskCompleted,
}

impl ClusterEventType {
    /// Logical event key used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoveUserSession => "remove_user_session",
            Self::RemoveAllUserSessions => "remove_all_user_sessions",
            Self::RealmRemoved => "realm_removed",
            Self::ClientRemoved => "client_removed",
            Self::RemoveAllLoginFailures => "remove_all_login_failures",
            Self::SessionChanged => "session_changed",
            Self::TaskCompleted => "task_completed",
        }
    }
}

impl std::fmt::Display for ClusterEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session cache change shipped to other datacenters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionChange {
    pub cache_name: String,
    pub key: String,
    pub operation: CacheOperation,
    /// Entity version after the change.
    pub version: u64,
    /// Serialized entity. Absent for removals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<serde_json::Value>,
    /// Set when the originating write was retried, so receivers must apply
    /// it even if they do not own the key.
    #[serde(default)]
    pub command_retried: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEventPayload {
    RemoveUserSession {
        user_session_id: String,
    },
    RemoveAllUserSessions,
    RealmRemoved,
    ClientRemoved {
        client_id: String,
    },
    RemoveAllLoginFailures,
    SessionChanged(SessionChange),
    TaskCompleted {
        task_key: String,
        success: bool,
    },
}

impl ClusterEventPayload {
    pub fn event_type(&self) -> ClusterEventType {
        match self {
            Self::RemoveUserSession { .. } => ClusterEventType::RemoveUserSession,
            Self::RemoveAllUserSessions => ClusterEventType::RemoveAllUserSessions,
            Self::RealmRemoved => ClusterEventType::RealmRemoved,
            Self::ClientRemoved { .. } => ClusterEventType::ClientRemoved,
            Self::RemoveAllLoginFailures => ClusterEventType::RemoveAllLoginFailures,
            Self::SessionChanged(_) => ClusterEventType::SessionChanged,
            Self::TaskCompleted { .. } => ClusterEventType::TaskCompleted,
        }
    }
}

/// What travels between nodes.
///
/// `node_id` and `site_id` record the origin. Only the origin node re-sends a
/// resend-eligible event to the other datacenters, and the re-sent copy is
/// never eligible again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEventEnvelope {
    pub id: Uuid,
    /// Realm the event belongs to. `None` for cluster-internal events.
    pub realm_id: Option<String>,
    pub event_key: String,
    pub node_id: Option<String>,
    pub site_id: Option<String>,
    pub resend: bool,
    pub payload: ClusterEventPayload,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ClusterEventEnvelope {
    pub fn new(
        realm_id: Option<String>,
        payload: ClusterEventPayload,
        node_id: Option<String>,
        site_id: Option<String>,
        resend: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            realm_id,
            event_key: payload.event_type().as_str().to_string(),
            node_id,
            site_id,
            resend,
            payload,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn event_type(&self) -> ClusterEventType {
        self.payload.event_type()
    }

    /// The copy forwarded to other datacenters.
    pub fn resent_copy(&self) -> Self {
        Self {
            resend: false,
            ..self.clone()
        }
    }
}
