use serde::Deserialize;

/// The token pair held by one execution context.
///
/// `access_token` is present exactly when the user counts as logged in.
/// A refresh token without an access token only exists while a refresh is
/// in flight; a failed refresh clears both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

impl From<TokenPair> for Session {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: Some(pair.access),
            refresh_token: Some(pair.refresh),
        }
    }
}

/// Both tokens from a successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Result of a successful refresh. The server may rotate the refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshGrant {
    pub access: String,
    pub refresh: Option<String>,
}

/// Token endpoint response body. Either field may be missing from a
/// misbehaving server, so both are optional here and checked afterwards.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub refresh: Option<String>,
}

fn non_empty(token: Option<String>) -> Option<String> {
    token.filter(|t| !t.trim().is_empty())
}

impl TokenResponse {
    pub fn into_pair(self) -> Option<TokenPair> {
        Some(TokenPair {
            access: non_empty(self.access)?,
            refresh: non_empty(self.refresh)?,
        })
    }

    pub fn into_grant(self) -> Option<RefreshGrant> {
        Some(RefreshGrant {
            access: non_empty(self.access)?,
            refresh: non_empty(self.refresh),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticated_follows_access_token() {
        let mut session = Session::default();
        assert!(!session.is_authenticated());
        assert!(session.is_empty());

        session.refresh_token = Some("R1".to_string());
        assert!(!session.is_authenticated());
        assert!(!session.is_empty());

        session.access_token = Some("A1".to_string());
        assert!(session.is_authenticated());
    }

    #[test]
    fn test_login_response_requires_both_tokens() {
        let full: TokenResponse = serde_json::from_str(r#"{"access":"A1","refresh":"R1"}"#).unwrap();
        assert_eq!(
            full.into_pair(),
            Some(TokenPair {
                access: "A1".to_string(),
                refresh: "R1".to_string()
            })
        );

        let missing: TokenResponse = serde_json::from_str(r#"{"access":"A1"}"#).unwrap();
        assert_eq!(missing.into_pair(), None);

        let blank: TokenResponse = serde_json::from_str(r#"{"access":"","refresh":"R1"}"#).unwrap();
        assert_eq!(blank.into_pair(), None);
    }

    #[test]
    fn test_refresh_response_rotation_is_optional() {
        let plain: TokenResponse = serde_json::from_str(r#"{"access":"A2"}"#).unwrap();
        assert_eq!(plain.into_grant().unwrap().refresh, None);

        let rotated: TokenResponse = serde_json::from_str(r#"{"access":"A2","refresh":"R2"}"#).unwrap();
        assert_eq!(rotated.into_grant().unwrap().refresh.as_deref(), Some("R2"));

        let empty: TokenResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.into_grant().is_none());
    }
}
