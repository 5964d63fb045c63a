//! Session entities stored in the session caches.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::CrossDcMessageStatus;

/// Kind of session entity; decides cache name and default cross-DC policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    UserSession,
    ClientSession,
    AuthenticationSession,
    LoginFailure,
}

impl EntityKind {
    pub fn cache_name(&self) -> &'static str {
        match self {
            Self::UserSession => "sessions",
            Self::ClientSession => "clientSessions",
            Self::AuthenticationSession => "authenticationSessions",
            Self::LoginFailure => "loginFailures",
        }
    }

    /// Propagation used when a task does not decide otherwise.
    pub fn default_cross_dc(&self) -> CrossDcMessageStatus {
        match self {
            Self::UserSession | Self::ClientSession | Self::LoginFailure => {
                CrossDcMessageStatus::Sync
            }
            Self::AuthenticationSession => CrossDcMessageStatus::Async,
        }
    }
}

/// An entity that lives in a session cache.
pub trait SessionEntity:
    Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: EntityKind;

    /// Cache key.
    fn key(&self) -> String;

    fn realm_id(&self) -> &str;

    /// User session this entity belongs to, if any.
    fn user_session_id(&self) -> Option<&str> {
        None
    }

    /// Client this entity belongs to, if any.
    fn client_id(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserSessionState {
    LoggedIn,
    LoggingOut,
    LoggedOut,
    LoggedOutUnconfirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSessionEntity {
    pub id: String,
    pub realm_id: String,
    pub user_id: String,
    pub login_username: String,
    pub ip_address: Option<String>,
    pub auth_method: Option<String>,
    pub remember_me: bool,
    pub started: i64,
    pub last_session_refresh: i64,
    pub broker_session_id: Option<String>,
    pub broker_user_id: Option<String>,
    pub state: Option<UserSessionState>,
    #[serde(default)]
    pub notes: HashMap<String, String>,
    /// Client id to client session id.
    #[serde(default)]
    pub authenticated_client_sessions: HashMap<String, Uuid>,
}

impl UserSessionEntity {
    pub fn new(
        id: impl Into<String>,
        realm_id: impl Into<String>,
        user_id: impl Into<String>,
        login_username: impl Into<String>,
        started: i64,
    ) -> Self {
        Self {
            id: id.into(),
            realm_id: realm_id.into(),
            user_id: user_id.into(),
            login_username: login_username.into(),
            ip_address: None,
            auth_method: None,
            remember_me: false,
            started,
            last_session_refresh: started,
            broker_session_id: None,
            broker_user_id: None,
            state: Some(UserSessionState::LoggedIn),
            notes: HashMap::new(),
            authenticated_client_sessions: HashMap::new(),
        }
    }
}

impl SessionEntity for UserSessionEntity {
    const KIND: EntityKind = EntityKind::UserSession;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn realm_id(&self) -> &str {
        &self.realm_id
    }

    fn user_session_id(&self) -> Option<&str> {
        Some(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedClientSessionEntity {
    pub id: Uuid,
    pub realm_id: String,
    pub client_id: String,
    pub user_session_id: String,
    pub timestamp: i64,
    pub auth_method: Option<String>,
    pub redirect_uri: Option<String>,
    pub action: Option<String>,
    pub current_refresh_token: Option<String>,
    pub current_refresh_token_use_count: i32,
    #[serde(default)]
    pub notes: HashMap<String, String>,
}

impl AuthenticatedClientSessionEntity {
    pub fn new(
        realm_id: impl Into<String>,
        client_id: impl Into<String>,
        user_session_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            realm_id: realm_id.into(),
            client_id: client_id.into(),
            user_session_id: user_session_id.into(),
            timestamp,
            auth_method: None,
            redirect_uri: None,
            action: None,
            current_refresh_token: None,
            current_refresh_token_use_count: 0,
            notes: HashMap::new(),
        }
    }
}

impl SessionEntity for AuthenticatedClientSessionEntity {
    const KIND: EntityKind = EntityKind::ClientSession;

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn realm_id(&self) -> &str {
        &self.realm_id
    }

    fn user_session_id(&self) -> Option<&str> {
        Some(&self.user_session_id)
    }

    fn client_id(&self) -> Option<&str> {
        Some(&self.client_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSessionEntity {
    /// Tab id within the root authentication session.
    pub id: String,
    pub root_session_id: String,
    pub realm_id: String,
    pub client_id: String,
    pub timestamp: i64,
    pub auth_user_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub action: Option<String>,
    #[serde(default)]
    pub execution_status: HashMap<String, String>,
    #[serde(default)]
    pub client_notes: HashMap<String, String>,
    #[serde(default)]
    pub auth_notes: HashMap<String, String>,
    #[serde(default)]
    pub required_actions: Vec<String>,
}

impl AuthenticationSessionEntity {
    pub fn new(
        root_session_id: impl Into<String>,
        id: impl Into<String>,
        realm_id: impl Into<String>,
        client_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            root_session_id: root_session_id.into(),
            realm_id: realm_id.into(),
            client_id: client_id.into(),
            timestamp,
            auth_user_id: None,
            redirect_uri: None,
            action: None,
            execution_status: HashMap::new(),
            client_notes: HashMap::new(),
            auth_notes: HashMap::new(),
            required_actions: Vec::new(),
        }
    }
}

impl SessionEntity for AuthenticationSessionEntity {
    const KIND: EntityKind = EntityKind::AuthenticationSession;

    fn key(&self) -> String {
        format!("{}.{}", self.root_session_id, self.id)
    }

    fn realm_id(&self) -> &str {
        &self.realm_id
    }

    fn client_id(&self) -> Option<&str> {
        Some(&self.client_id)
    }
}

/// Brute-force detection counters for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginFailureEntity {
    pub realm_id: String,
    pub user_id: String,
    /// Seconds since epoch before which logins are refused.
    pub failed_login_not_before: i64,
    pub num_failures: u32,
    pub num_temporary_lockouts: u32,
    /// Milliseconds since epoch of the last failure.
    pub last_failure: i64,
    pub last_ip_failure: Option<String>,
}

impl LoginFailureEntity {
    pub fn new(realm_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            realm_id: realm_id.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Cache key for a realm/user pair.
    pub fn key_for(realm_id: &str, user_id: &str) -> String {
        format!("{realm_id}:{user_id}")
    }

    pub fn increment_failures(&mut self) {
        self.num_failures += 1;
    }

    pub fn increment_temporary_lockouts(&mut self) {
        self.num_temporary_lockouts += 1;
    }

    pub fn clear_failures(&mut self) {
        self.failed_login_not_before = 0;
        self.num_failures = 0;
        self.num_temporary_lockouts = 0;
        self.last_failure = 0;
        self.last_ip_failure = None;
    }
}

impl SessionEntity for LoginFailureEntity {
    const KIND: EntityKind = EntityKind::LoginFailure;

    fn key(&self) -> String {
        Self::key_for(&self.realm_id, &self.user_id)
    }

    fn realm_id(&self) -> &str {
        &self.realm_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_failure_counters() {
        let mut failure = LoginFailureEntity::new("realm-1", "user-1");
        failure.increment_failures();
        failure.increment_failures();
        failure.increment_temporary_lockouts();
        failure.last_ip_failure = Some("10.0.0.9".into());
        failure.failed_login_not_before = 1_700_000_000;
        assert_eq!(failure.num_failures, 2);
        assert_eq!(failure.key(), "realm-1:user-1");

        failure.clear_failures();
        assert_eq!(failure.num_failures, 0);
        assert_eq!(failure.num_temporary_lockouts, 0);
        assert_eq!(failure.failed_login_not_before, 0);
        assert!(failure.last_ip_failure.is_none());
        assert_eq!(failure.user_id, "user-1");
    }

    #[test]
    fn test_default_cross_dc_policy() {
        assert_eq!(
            EntityKind::LoginFailure.default_cross_dc(),
            CrossDcMessageStatus::Sync
        );
        assert_eq!(
            EntityKind::AuthenticationSession.default_cross_dc(),
            CrossDcMessageStatus::Async
        );
    }

    #[test]
    fn test_client_session_links() {
        let client = AuthenticatedClientSessionEntity::new("realm-1", "app", "us-1", 100);
        assert_eq!(client.user_session_id(), Some("us-1"));
        assert_eq!(client.client_id(), Some("app"));
        assert_eq!(client.key(), client.id.to_string());
    }

    #[test]
    fn test_user_session_json_shape() {
        let session = UserSessionEntity::new("us-1", "realm-1", "user-1", "alice", 100);
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["realmId"], "realm-1");
        assert_eq!(json["state"], "LOGGED_IN");
        let back: UserSessionEntity = serde_json::from_value(json).unwrap();
        assert_eq!(back, session);
    }
}
