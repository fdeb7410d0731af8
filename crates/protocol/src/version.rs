//! Client/server version negotiation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtocolError;

/// Version this client announces in `hello`.
pub const CLIENT_VERSION: Version = Version { major: 1, minor: 0 };

/// A `(major, minor)` protocol version.
///
/// Ordering compares major first, then minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// True when `self` is numerically newer than `other`.
    pub fn is_newer_than(&self, other: &Version) -> bool {
        self > other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = ProtocolError;

    /// Accepts `"1"`, `"1.2"`, `"v1.2.3"`; components past minor are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        let mut parts = digits.split('.');

        let parse = |part: Option<&str>| -> Result<Option<u32>, ProtocolError> {
            match part {
                None => Ok(None),
                Some(p) => p
                    .parse::<u32>()
                    .map(Some)
                    .map_err(|_| ProtocolError::InvalidVersion(s.to_string())),
            }
        };

        let major = parse(parts.next())?.ok_or_else(|| ProtocolError::InvalidVersion(s.to_string()))?;
        let minor = parse(parts.next())?.unwrap_or(0);
        Ok(Self { major, minor })
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Older servers report a bare number.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        let text = match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text,
            Raw::Number(number) => number.to_string(),
        };
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Reads a version, yielding `None` for one this client cannot parse.
///
/// A server version is only ever advisory, so an odd one must not fail the
/// message carrying it.
pub fn deserialize_lenient<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Version>, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(Version::deserialize(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versions() {
        assert_eq!("1.0".parse::<Version>().unwrap(), Version::new(1, 0));
        assert_eq!("13".parse::<Version>().unwrap(), Version::new(13, 0));
        assert_eq!("v2.3.9".parse::<Version>().unwrap(), Version::new(2, 3));
        assert!("".parse::<Version>().is_err());
        assert!("one.two".parse::<Version>().is_err());
    }

    #[test]
    fn test_ordering_is_numeric() {
        assert!(Version::new(1, 10).is_newer_than(&Version::new(1, 9)));
        assert!(Version::new(2, 0).is_newer_than(&Version::new(1, 99)));
        assert!(!Version::new(1, 0).is_newer_than(&Version::new(1, 0)));
        assert!(!Version::new(0, 9).is_newer_than(&CLIENT_VERSION));
    }

    #[test]
    fn test_deserialize_string_or_number() {
        let v: Version = serde_json::from_str(r#""1.2""#).unwrap();
        assert_eq!(v, Version::new(1, 2));

        let v: Version = serde_json::from_str("13").unwrap();
        assert_eq!(v, Version::new(13, 0));

        let v: Version = serde_json::from_str("1.5").unwrap();
        assert_eq!(v, Version::new(1, 5));
    }

    #[test]
    fn test_lenient_accepts_unreadable_versions() {
        #[derive(Deserialize)]
        struct Reply {
            #[serde(default, deserialize_with = "deserialize_lenient")]
            version: Option<Version>,
        }

        let reply: Reply = serde_json::from_str(r#"{"version": "beta"}"#).unwrap();
        assert_eq!(reply.version, None);
        let reply: Reply = serde_json::from_str(r#"{"version": null}"#).unwrap();
        assert_eq!(reply.version, None);
        let reply: Reply = serde_json::from_str("{}").unwrap();
        assert_eq!(reply.version, None);
        let reply: Reply = serde_json::from_str(r#"{"version": "2.1"}"#).unwrap();
        assert_eq!(reply.version, Some(Version::new(2, 1)));
    }

    #[test]
    fn test_serialize_as_string() {
        assert_eq!(serde_json::to_string(&CLIENT_VERSION).unwrap(), r#""1.0""#);
    }
}
