//! Signed control-plane requests.
//!
//! The Authorization header carries `base64(timestamp || signature)`: the
//! first ten bytes are the decimal Unix timestamp, the rest is an Ed25519
//! signature over those ten bytes. The server accepts a request when any
//! key from its authorized-keys file verifies the signature and the
//! timestamp is younger than [`MAX_SIGNATURE_AGE`].

use crate::error::ControlError;
use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Signatures older than this are rejected.
pub const MAX_SIGNATURE_AGE: Duration = Duration::from_secs(30);

const TIMESTAMP_LEN: usize = 10;
const PUBLIC_KEY_LEN: usize = 32;
const SECRET_KEY_LEN: usize = 32;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Verifies control-plane request signatures against a set of
/// authorized public keys.
pub struct RequestVerifier {
    keys: Vec<VerifyingKey>,
}

impl RequestVerifier {
    /// Load an authorized-keys file: one base64 Ed25519 public key per
    /// line, blank lines skipped.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("error while reading authorized keys file {}", path.display()))?;
        let mut keys = Vec::new();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let raw = BASE64
                .decode(line)
                .context("error while parsing authorized key")?;
            let raw: [u8; PUBLIC_KEY_LEN] = raw
                .try_into()
                .map_err(|_| anyhow::anyhow!("authorized key is not {PUBLIC_KEY_LEN} bytes"))?;
            keys.push(VerifyingKey::from_bytes(&raw).context("error while parsing authorized key")?);
        }
        if keys.is_empty() {
            anyhow::bail!(
                "no valid keys found in authorized keys file {}",
                path.display()
            );
        }
        Ok(Self { keys })
    }

    pub fn from_keys(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    /// Check an Authorization header value.
    pub fn verify(&self, authorization: &str) -> Result<(), ControlError> {
        self.verify_at(authorization, now_unix())
    }

    fn verify_at(&self, authorization: &str, now: i64) -> Result<(), ControlError> {
        let raw = BASE64
            .decode(authorization)
            .map_err(|_| ControlError::Unauthorized)?;
        if raw.len() <= TIMESTAMP_LEN {
            return Err(ControlError::Unauthorized);
        }
        let (timestamp_bytes, signature_bytes) = raw.split_at(TIMESTAMP_LEN);

        let timestamp: i64 = std::str::from_utf8(timestamp_bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(ControlError::Unauthorized)?;
        if now - timestamp >= MAX_SIGNATURE_AGE.as_secs() as i64 {
            return Err(ControlError::Unauthorized);
        }

        let signature =
            Signature::from_slice(signature_bytes).map_err(|_| ControlError::Unauthorized)?;
        if self
            .keys
            .iter()
            .any(|key| key.verify(timestamp_bytes, &signature).is_ok())
        {
            Ok(())
        } else {
            Err(ControlError::Unauthorized)
        }
    }
}

/// Signs control-plane requests on behalf of the CLI client.
pub struct RequestSigner {
    key: SigningKey,
}

impl RequestSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Load a signing key file: a single base64 Ed25519 seed.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("error while reading key file {}", path.display()))?;
        let raw = BASE64
            .decode(data.trim())
            .context("error while parsing signing key")?;
        let raw: [u8; SECRET_KEY_LEN] = raw
            .try_into()
            .map_err(|_| anyhow::anyhow!("signing key is not {SECRET_KEY_LEN} bytes"))?;
        Ok(Self::new(SigningKey::from_bytes(&raw)))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Produce an Authorization header value for the current time.
    pub fn authorization(&self) -> String {
        self.authorization_at(now_unix())
    }

    fn authorization_at(&self, now: i64) -> String {
        let timestamp = format!("{now:010}");
        let signature = self.key.sign(timestamp.as_bytes());
        let mut raw = Vec::with_capacity(TIMESTAMP_LEN + signature.to_bytes().len());
        raw.extend_from_slice(timestamp.as_bytes());
        raw.extend_from_slice(&signature.to_bytes());
        BASE64.encode(raw)
    }
}
