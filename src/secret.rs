//! # Secret Management
//!
//! A swap is bound by a 32-byte secret and its SHA-256 hashlock. The hashlock
//! goes on both chains; revealing the secret on one chain authorizes the claim
//! on the other.
//!
//! The hashlock is never trusted on its own: every claim path recomputes
//! `SHA256(secret)` through [`verify`] and refuses to continue on mismatch.

use crate::error::{SwapError, SwapResult};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of both the secret and the hashlock
pub const SECRET_SIZE: usize = 32;

/// 32-byte swap secret (the hashlock preimage)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Secret([u8; SECRET_SIZE]);

/// SHA-256 digest of a [`Secret`]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hashlock([u8; SECRET_SIZE]);

impl Secret {
    pub fn from_bytes(bytes: [u8; SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a secret from a slice, rejecting anything that is not 32 bytes
    pub fn from_slice(bytes: &[u8]) -> SwapResult<Self> {
        let array: [u8; SECRET_SIZE] = bytes.try_into().map_err(|_| {
            SwapError::crypto(format!(
                "Secret must be {} bytes, got {}",
                SECRET_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Hashlock {
    pub fn from_bytes(bytes: [u8; SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> SwapResult<Self> {
        let array: [u8; SECRET_SIZE] = bytes.try_into().map_err(|_| {
            SwapError::crypto(format!(
                "Hashlock must be {} bytes, got {}",
                SECRET_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Generate a new secret from the thread-local CSPRNG
pub fn generate_secret() -> Secret {
    let mut bytes = [0u8; SECRET_SIZE];
    rand::rng().fill_bytes(&mut bytes);
    Secret(bytes)
}

/// Compute the hashlock of a secret
pub fn hash(secret: &Secret) -> Hashlock {
    let mut hasher = Sha256::new();
    hasher.update(secret.0);
    Hashlock(hasher.finalize().into())
}

/// Recompute the hashlock and compare it with the expected one.
///
/// Returns [`SwapError::SecretMismatch`] naming both hashes when they differ.
/// Callers must not construct any transaction after a failure.
pub fn verify(secret: &Secret, hashlock: &Hashlock) -> SwapResult<()> {
    let computed = hash(secret);
    if &computed != hashlock {
        return Err(SwapError::SecretMismatch {
            expected: hashlock.to_hex(),
            computed: computed.to_hex(),
        });
    }
    Ok(())
}

/// Boolean form of [`verify`]
pub fn matches(secret: &Secret, hashlock: &Hashlock) -> bool {
    verify(secret, hashlock).is_ok()
}

fn decode_hex32(value: &str, what: &str) -> SwapResult<[u8; SECRET_SIZE]> {
    let trimmed = value.trim().trim_start_matches("0x");
    let bytes = hex::decode(trimmed)
        .map_err(|e| SwapError::crypto(format!("Invalid {} hex: {}", what, e)))?;
    bytes.as_slice().try_into().map_err(|_| {
        SwapError::crypto(format!(
            "{} must be {} bytes, got {}",
            what,
            SECRET_SIZE,
            bytes.len()
        ))
    })
}

impl FromStr for Secret {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_hex32(s, "secret")?))
    }
}

impl FromStr for Hashlock {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_hex32(s, "hashlock")?))
    }
}

// Secrets are never printed through Debug; logs go through `to_hex` explicitly.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(..)")
    }
}

impl fmt::Debug for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashlock({})", self.to_hex())
    }
}

impl fmt::Display for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for Hashlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hashlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}
