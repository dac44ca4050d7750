use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

const REDACTED: &str = "[REDACTED]";

/// Configuration string whose value must not leak through logs or dumps.
///
/// `Debug`, `Display` and `Serialize` all yield `[REDACTED]`; deserializing
/// reads the plain value. The buffer is zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct OpaqueString(String);

impl OpaqueString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Read-only access to the underlying value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Clone for OpaqueString {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<&str> for OpaqueString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for OpaqueString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for OpaqueString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for OpaqueString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for OpaqueString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for OpaqueString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn formatting_is_redacted() {
        let s = OpaqueString::new("hunter2");
        assert_eq!(format!("{s:?}"), "[REDACTED]");
        assert_eq!(format!("{s}"), "[REDACTED]");
    }

    #[test]
    fn serialize_redacts_and_deserialize_reads_plain() {
        let s: OpaqueString = serde_json::from_str("\"bearer abc\"").unwrap();
        assert_eq!(s.expose(), "bearer abc");
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"[REDACTED]\"");
    }

    #[test]
    fn zeroize_clears_buffer() {
        let mut s = OpaqueString::new("sensitive");
        s.zeroize();
        assert!(s.expose().is_empty());
    }
}
