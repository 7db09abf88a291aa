use crate::storage::users::normalize_email;
use std::fmt;

/// Canonical storage key of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Per-client state carried between requests (a cookie jar, in HTTP terms)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    /// Token previously handed to the client
    pub session_token: Option<String>,
    /// Email of the signed-in account, if any
    pub authenticated_email: Option<String>,
}

impl ClientContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            session_token: Some(token.into()),
            authenticated_email: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated_email
            .as_deref()
            .map(|email| !email.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Maps a client context onto a canonical session key
#[derive(Debug, Default, Clone)]
pub struct SessionResolver;

impl SessionResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the key for this client, persisting it in the context
    ///
    /// Authenticated clients always map to their normalized email, whatever
    /// token arrived. Anonymous clients keep their token, or get a new UUID.
    pub fn resolve(&self, context: &mut ClientContext) -> SessionKey {
        if let Some(email) = context.authenticated_email.as_deref() {
            let email = normalize_email(email);
            if !email.is_empty() {
                context.session_token = Some(email.clone());
                return SessionKey::new(email);
            }
        }

        if let Some(token) = context.session_token.as_deref() {
            if !token.trim().is_empty() {
                return SessionKey::new(token);
            }
        }

        let token = uuid::Uuid::new_v4().to_string();
        context.session_token = Some(token.clone());
        SessionKey::new(token)
    }
}
