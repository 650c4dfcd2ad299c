use std::fmt;

use crate::scram::{ScramClient, ScramMechanism};

/// SASL identity presented after the TLS handshake. Loaded once at startup
/// and never mutated.
#[derive(Clone)]
pub struct Credential {
    username: String,
    password: String,
    mechanism: ScramMechanism,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

impl Credential {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: ScramMechanism,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            mechanism,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn mechanism(&self) -> ScramMechanism {
        self.mechanism
    }

    /// A fresh handshake for one connection attempt.
    pub fn scram_client(&self) -> ScramClient {
        ScramClient::new(self.mechanism, &self.username, &self.password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let credential = Credential::new("user1", "hunter2", ScramMechanism::Sha512);
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("user1"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_scram_client_uses_mechanism() {
        let credential = Credential::new("user1", "user1", ScramMechanism::Sha256);
        assert_eq!(credential.scram_client().mechanism(), ScramMechanism::Sha256);
    }
}
