//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides the serde helpers used where a
//! secret has to cross the worker boundary in clear text.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
use serde::{Deserialize, Deserializer, Serializer};

/// Serialize a secret by exposing it. Only for envelopes sent to a worker.
pub fn serialize_exposed<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(secret.expose_secret())
}

pub fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

pub fn clone_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}
