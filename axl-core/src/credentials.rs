//! Credentials capability injected into node connections.

use std::fmt;

use crate::error::Result;

/// Access credentials presented to a node when a connection is opened
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    #[must_use]
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Source of [`Credentials`], consulted each time a node connection is opened
pub trait CredentialsProvider: Send + Sync {
    /// # Errors
    /// Returns [`crate::AxlError::Credentials`] when no credentials are available.
    fn credentials(&self) -> Result<Credentials>;
}

impl<F> CredentialsProvider for F
where
    F: Fn() -> Result<Credentials> + Send + Sync,
{
    fn credentials(&self) -> Result<Credentials> {
        self()
    }
}

/// Provider that always hands out the same credentials
#[derive(Debug, Clone)]
pub struct StaticCredentialsProvider {
    credentials: Credentials,
}

impl StaticCredentialsProvider {
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn credentials(&self) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}
