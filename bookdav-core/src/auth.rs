use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use url::Url;

/// Credentials for a Nextcloud-style account: server, login and the
/// app-scoped password produced by the login flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextcloudAuth {
    pub server: Url,
    pub login_name: String,
    pub app_password: String,
    /// Opaque state left over from the login-flow exchange, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Persisted credential bundle identifying one backend account.
///
/// Two states are the same account iff server and login match; the secret
/// never takes part in equality. Replaced wholesale on re-login.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthState {
    Nextcloud(NextcloudAuth),
}

impl AuthState {
    pub fn nextcloud(
        server: Url,
        login_name: impl Into<String>,
        app_password: impl Into<String>,
    ) -> Self {
        AuthState::Nextcloud(NextcloudAuth {
            server,
            login_name: login_name.into(),
            app_password: app_password.into(),
            state: None,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn server(&self) -> &Url {
        match self {
            AuthState::Nextcloud(auth) => &auth.server,
        }
    }

    pub fn login_name(&self) -> &str {
        match self {
            AuthState::Nextcloud(auth) => &auth.login_name,
        }
    }

    /// `Authorization` header value shared by every request of a session.
    pub(crate) fn authorization_header(&self) -> String {
        match self {
            AuthState::Nextcloud(auth) => {
                let credentials = format!("{}:{}", auth.login_name, auth.app_password);
                format!("Basic {}", BASE64.encode(credentials))
            }
        }
    }
}

impl PartialEq for AuthState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AuthState::Nextcloud(a), AuthState::Nextcloud(b)) => {
                a.server == b.server && a.login_name == b.login_name
            }
        }
    }
}

impl Eq for AuthState {}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Url {
        Url::parse("https://cloud.example.com").unwrap()
    }

    #[test]
    fn equality_ignores_the_secret() {
        let a = AuthState::nextcloud(server(), "alice", "wonder");
        let b = AuthState::nextcloud(server(), "alice", "other");
        assert_eq!(a, b);

        let c = AuthState::nextcloud(server(), "bob", "wonder");
        assert_ne!(a, c);

        let d = AuthState::nextcloud(Url::parse("https://elsewhere.example").unwrap(), "alice", "wonder");
        assert_ne!(a, d);
    }

    #[test]
    fn persisted_json_uses_wire_field_names() {
        let auth = AuthState::nextcloud(server(), "alice", "wonder");
        let json = auth.to_json().unwrap();
        assert!(json.contains("\"server\""));
        assert!(json.contains("\"loginName\":\"alice\""));
        assert!(json.contains("\"appPassword\":\"wonder\""));
        assert!(!json.contains("\"state\""));
    }

    #[test]
    fn round_trips_through_json() {
        let json = r#"{"server":"https://cloud.example.com/","loginName":"alice","appPassword":"wonder"}"#;
        let auth = AuthState::from_json(json).unwrap();
        assert_eq!(auth.login_name(), "alice");
        assert_eq!(auth.server().as_str(), "https://cloud.example.com/");
        assert_eq!(auth, AuthState::nextcloud(server(), "alice", "anything"));
    }

    #[test]
    fn basic_header_encodes_login_and_password() {
        let auth = AuthState::nextcloud(server(), "alice", "wonder");
        assert_eq!(auth.authorization_header(), "Basic YWxpY2U6d29uZGVy");
    }
}
