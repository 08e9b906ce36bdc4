//! Interpolated secure-string templates.
//!
//! A template like `Bearer ${token}` is kept as its literal parts and its
//! interpolated parts so that redaction can decide what to hide without
//! re-parsing the string.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawSecureString")]
pub struct SecureString {
    literal_parts: Vec<String>,
    interpolated_parts: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSecureString {
    literal_parts: Vec<String>,
    interpolated_parts: Vec<String>,
}

impl TryFrom<RawSecureString> for SecureString {
    type Error = Error;

    fn try_from(raw: RawSecureString) -> Result<Self> {
        Self::new(raw.literal_parts, raw.interpolated_parts)
    }
}

impl SecureString {
    /// Requires exactly one more literal part than interpolated parts.
    pub fn new(literal_parts: Vec<String>, interpolated_parts: Vec<String>) -> Result<Self> {
        if literal_parts.len() != interpolated_parts.len() + 1 {
            return Err(Error::Validation(format!(
                "secure string needs {} literal parts for {} interpolated parts, got {}",
                interpolated_parts.len() + 1,
                interpolated_parts.len(),
                literal_parts.len()
            )));
        }
        Ok(Self {
            literal_parts,
            interpolated_parts,
        })
    }

    /// A template with no interpolation.
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            literal_parts: vec![text.into()],
            interpolated_parts: Vec::new(),
        }
    }

    pub fn literal_parts(&self) -> &[String] {
        &self.literal_parts
    }

    pub fn interpolated_parts(&self) -> &[String] {
        &self.interpolated_parts
    }

    /// Alternate literal and interpolated parts, starting and ending with a
    /// literal.
    pub fn reassemble(&self) -> String {
        let mut out = String::new();
        for (i, literal) in self.literal_parts.iter().enumerate() {
            out.push_str(literal);
            if let Some(value) = self.interpolated_parts.get(i) {
                out.push_str(value);
            }
        }
        out
    }
}
