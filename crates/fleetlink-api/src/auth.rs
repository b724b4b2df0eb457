use secrecy::{ExposeSecret, SecretString};

/// Credentials for a password-protected device.
///
/// Legacy devices take them as HTTP basic auth on every request; RPC
/// devices accept the same pair on the `/rpc` endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Attach these credentials to a request as HTTP basic auth.
    pub(crate) fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.basic_auth(&self.username, Some(self.password.expose_secret()))
    }
}
