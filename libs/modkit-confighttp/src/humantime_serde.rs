//! Serde adapters writing `Duration` values in humantime form (`"90s"`).
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Foo {
//!     #[serde(default, with = "crate::humantime_serde::option")]
//!     timeout: Option<Duration>,
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer, de};

/// Adapter for `Option<Duration>`; `null` and a missing field both map to `None`.
pub mod option {
    use super::{Deserialize, Deserializer, Duration, Serializer, de, parse};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|raw| parse(&raw).map_err(de::Error::custom))
            .transpose()
    }
}

fn parse(raw: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(raw.trim())
}

pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&humantime::format_duration(*value).to_string())
}

pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(d)?;
    parse(&raw).map_err(de::Error::custom)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Timeouts {
        #[serde(with = "super")]
        idle: Duration,
        #[serde(default, with = "super::option")]
        read: Option<Duration>,
    }

    #[test]
    fn parses_humantime_values() {
        let t: Timeouts = serde_json::from_str(r#"{"idle":"1m 30s","read":"250ms"}"#).unwrap();
        assert_eq!(t.idle, Duration::from_secs(90));
        assert_eq!(t.read, Some(Duration::from_millis(250)));
    }

    #[test]
    fn missing_optional_is_none() {
        let t: Timeouts = serde_json::from_str(r#"{"idle":"5s"}"#).unwrap();
        assert_eq!(t.read, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<Timeouts>(r#"{"idle":"soon"}"#).is_err());
    }

    #[test]
    fn serializes_back_to_text() {
        let t = Timeouts {
            idle: Duration::from_secs(90),
            read: None,
        };
        assert_eq!(
            serde_json::to_string(&t).unwrap(),
            r#"{"idle":"1m 30s","read":null}"#
        );
    }
}
