//! SCRAM client (RFC 5802) used for SASL authentication against the brokers.
//!
//! The exchange is driven message by message by the transport, so the client
//! is an explicit state machine: each call to [`ScramClient::step`] consumes
//! the latest server message and returns the next client message.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// Kafka brokers refuse to store SCRAM credentials with fewer iterations.
pub const MIN_ITERATIONS: u32 = 4096;

const NONCE_BYTES: usize = 24;
const GS2_HEADER: &str = "n,,";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("step called in state {0:?}")]
    OutOfOrder(ScramState),
    #[error("malformed server message: {0}")]
    Malformed(String),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("iteration count {0} is below the minimum of {MIN_ITERATIONS}")]
    TooFewIterations(u32),
    #[error("server rejected authentication: {0}")]
    Rejected(String),
    #[error("server signature did not verify")]
    InvalidServerSignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScramMechanism {
    Sha256,
    #[default]
    Sha512,
}

impl ScramMechanism {
    /// SASL mechanism name as brokers and librdkafka spell it.
    pub fn name(&self) -> &'static str {
        match self {
            ScramMechanism::Sha256 => "SCRAM-SHA-256",
            ScramMechanism::Sha512 => "SCRAM-SHA-512",
        }
    }

    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramMechanism::Sha256 => Sha256::digest(data).to_vec(),
            ScramMechanism::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    pub fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            ScramMechanism::Sha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
                    .expect("HMAC accepts keys of any length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            ScramMechanism::Sha512 => {
                let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(key)
                    .expect("HMAC accepts keys of any length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Hi(password, salt, i) from RFC 5802, which is PBKDF2 with this HMAC.
    pub fn salted_password(&self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        match self {
            ScramMechanism::Sha256 => {
                let mut out = [0u8; 32];
                pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
                out.to_vec()
            }
            ScramMechanism::Sha512 => {
                let mut out = [0u8; 64];
                pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut out);
                out.to_vec()
            }
        }
    }
}

impl fmt::Display for ScramMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Externally visible position in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramState {
    Initial,
    AwaitingServerFirst,
    AwaitingServerFinal,
    Complete,
    Failed,
}

enum Stage {
    Initial,
    AwaitingServerFirst {
        client_first_bare: String,
    },
    AwaitingServerFinal {
        server_key: Vec<u8>,
        auth_message: String,
    },
    Complete,
    Failed,
}

pub struct ScramClient {
    mechanism: ScramMechanism,
    username: String,
    password: String,
    client_nonce: String,
    stage: Stage,
}

impl fmt::Debug for ScramClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScramClient")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("state", &self.state())
            .finish()
    }
}

impl ScramClient {
    pub fn new(
        mechanism: ScramMechanism,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let mut nonce = [0u8; NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self::with_nonce(mechanism, username, password, STANDARD.encode(nonce))
    }

    /// Fixed nonce, for reproducing known exchanges.
    pub fn with_nonce(
        mechanism: ScramMechanism,
        username: impl Into<String>,
        password: impl Into<String>,
        client_nonce: impl Into<String>,
    ) -> Self {
        Self {
            mechanism,
            username: username.into(),
            password: password.into(),
            client_nonce: client_nonce.into(),
            stage: Stage::Initial,
        }
    }

    pub fn mechanism(&self) -> ScramMechanism {
        self.mechanism
    }

    pub fn state(&self) -> ScramState {
        match self.stage {
            Stage::Initial => ScramState::Initial,
            Stage::AwaitingServerFirst { .. } => ScramState::AwaitingServerFirst,
            Stage::AwaitingServerFinal { .. } => ScramState::AwaitingServerFinal,
            Stage::Complete => ScramState::Complete,
            Stage::Failed => ScramState::Failed,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.stage, Stage::Complete)
    }

    /// Advance the handshake with the latest server message. The challenge is
    /// ignored on the first step, which produces the client-first message.
    /// The final step verifies the server signature and returns an empty
    /// response. Any error leaves the client in [`ScramState::Failed`].
    pub fn step(&mut self, challenge: &str) -> Result<String, ScramError> {
        let stage = std::mem::replace(&mut self.stage, Stage::Failed);
        let (next, response) = match stage {
            Stage::Initial => self.client_first(),
            Stage::AwaitingServerFirst { client_first_bare } => {
                self.client_final(&client_first_bare, challenge)?
            }
            Stage::AwaitingServerFinal {
                server_key,
                auth_message,
            } => self.verify_server_final(&server_key, &auth_message, challenge)?,
            Stage::Complete => {
                self.stage = Stage::Complete;
                return Err(ScramError::OutOfOrder(ScramState::Complete));
            }
            Stage::Failed => return Err(ScramError::OutOfOrder(ScramState::Failed)),
        };
        self.stage = next;
        Ok(response)
    }

    fn client_first(&self) -> (Stage, String) {
        let client_first_bare = format!(
            "n={},r={}",
            escape_username(&self.username),
            self.client_nonce
        );
        let message = format!("{GS2_HEADER}{client_first_bare}");
        (Stage::AwaitingServerFirst { client_first_bare }, message)
    }

    fn client_final(
        &self,
        client_first_bare: &str,
        server_first: &str,
    ) -> Result<(Stage, String), ScramError> {
        let attributes = parse_attributes(server_first)?;
        if let Some(reason) = attribute(&attributes, 'e') {
            return Err(ScramError::Rejected(reason.to_string()));
        }
        if attribute(&attributes, 'm').is_some() {
            return Err(ScramError::Malformed(
                "mandatory extension not supported".to_string(),
            ));
        }

        let nonce = required(&attributes, 'r')?;
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }
        let salt = STANDARD
            .decode(required(&attributes, 's')?)
            .map_err(|e| ScramError::Malformed(format!("salt is not base64: {e}")))?;
        let iterations: u32 = required(&attributes, 'i')?
            .parse()
            .map_err(|e| ScramError::Malformed(format!("bad iteration count: {e}")))?;
        if iterations < MIN_ITERATIONS {
            return Err(ScramError::TooFewIterations(iterations));
        }

        let mechanism = self.mechanism;
        let salted = mechanism.salted_password(self.password.as_bytes(), &salt, iterations);
        let client_key = mechanism.hmac(&salted, b"Client Key");
        let stored_key = mechanism.hash(&client_key);

        let without_proof = format!("c={},r={}", STANDARD.encode(GS2_HEADER), nonce);
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

        let client_signature = mechanism.hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();
        let server_key = mechanism.hmac(&salted, b"Server Key");

        let message = format!("{without_proof},p={}", STANDARD.encode(proof));
        Ok((
            Stage::AwaitingServerFinal {
                server_key,
                auth_message,
            },
            message,
        ))
    }

    fn verify_server_final(
        &self,
        server_key: &[u8],
        auth_message: &str,
        server_final: &str,
    ) -> Result<(Stage, String), ScramError> {
        let attributes = parse_attributes(server_final)?;
        if let Some(reason) = attribute(&attributes, 'e') {
            return Err(ScramError::Rejected(reason.to_string()));
        }
        let signature = STANDARD
            .decode(required(&attributes, 'v')?)
            .map_err(|e| ScramError::Malformed(format!("signature is not base64: {e}")))?;

        let verified = match self.mechanism {
            ScramMechanism::Sha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(server_key)
                    .expect("HMAC accepts keys of any length");
                mac.update(auth_message.as_bytes());
                mac.verify_slice(&signature).is_ok()
            }
            ScramMechanism::Sha512 => {
                let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(server_key)
                    .expect("HMAC accepts keys of any length");
                mac.update(auth_message.as_bytes());
                mac.verify_slice(&signature).is_ok()
            }
        };
        if !verified {
            return Err(ScramError::InvalidServerSignature);
        }
        Ok((Stage::Complete, String::new()))
    }
}

/// RFC 5802 saslname escaping.
pub fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

/// Split a SCRAM message into its `k=v` attributes. Values may contain `=`.
pub fn parse_attributes(message: &str) -> Result<Vec<(char, &str)>, ScramError> {
    message
        .split(',')
        .map(|part| {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| ScramError::Malformed(format!("attribute without value: {part}")))?;
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(k), None) => Ok((k, value)),
                _ => Err(ScramError::Malformed(format!("bad attribute name: {key}"))),
            }
        })
        .collect()
}

fn attribute<'a>(attributes: &[(char, &'a str)], key: char) -> Option<&'a str> {
    attributes.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn required<'a>(attributes: &[(char, &'a str)], key: char) -> Result<&'a str, ScramError> {
    attribute(attributes, key)
        .ok_or_else(|| ScramError::Malformed(format!("missing attribute '{key}'")))
}
