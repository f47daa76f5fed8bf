use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Characters the store refuses inside a path segment.
const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty path segment in '{0}'")]
    EmptySegment(String),

    #[error("invalid character {ch:?} in path segment '{segment}'")]
    InvalidCharacter { segment: String, ch: char },
}

/// A location in the store's node tree, e.g. `chirps/-Nabc123`.
///
/// The root is the path with no segments. Paths are validated on
/// construction so everything downstream can treat them as well-formed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a `/`-separated path. Leading and trailing slashes are ignored.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let segments = trimmed
            .split('/')
            .map(|segment| validate_segment(segment, raw).map(str::to_string))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { segments })
    }

    /// Navigate to a descendant. `child` may itself contain several segments.
    pub fn child(&self, child: &str) -> Result<Self, PathError> {
        let rel = Self::parse(child)?;
        let mut segments = self.segments.clone();
        segments.extend(rel.segments);
        Ok(Self { segments })
    }

    /// Navigate exactly one level down. `key` must be a single segment.
    pub fn child_key(&self, key: &str) -> Result<Self, PathError> {
        if key.contains('/') {
            return Err(PathError::InvalidCharacter {
                segment: key.to_string(),
                ch: '/',
            });
        }
        let key = validate_segment(key, key)?;
        let mut segments = self.segments.clone();
        segments.push(key.to_string());
        Ok(Self { segments })
    }

    /// Last segment, `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True when `self` is `other` or one of its ancestors.
    pub fn contains(&self, other: &Path) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// True when a write at one path can change the value observed at the other.
    pub fn overlaps(&self, other: &Path) -> bool {
        self.contains(other) || other.contains(self)
    }
}

fn validate_segment<'a>(segment: &'a str, raw: &str) -> Result<&'a str, PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment(raw.to_string()));
    }
    if let Some(ch) = segment
        .chars()
        .find(|c| FORBIDDEN.contains(c) || c.is_control())
    {
        return Err(PathError::InvalidCharacter {
            segment: segment.to_string(),
            ch,
        });
    }
    Ok(segment)
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        f.write_str(&self.segments.join("/"))
    }
}

impl std::str::FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.segments.join("/"))
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_navigate() {
        let root = Path::root();
        assert!(root.is_root());
        assert_eq!(root.to_string(), "/");

        let chirps = root.child("chirps").unwrap();
        let one = chirps.child("abc/likes").unwrap();
        assert_eq!(one.to_string(), "chirps/abc/likes");
        assert_eq!(one.key(), Some("likes"));
        assert_eq!(chirps.child_key("abc").unwrap().to_string(), "chirps/abc");
        assert_eq!(Path::parse("/chirps/").unwrap(), chirps);
    }

    #[test]
    fn rejects_bad_segments() {
        assert!(matches!(
            Path::parse("users//x"),
            Err(PathError::EmptySegment(_))
        ));
        assert!(matches!(
            Path::parse("users/a.b"),
            Err(PathError::InvalidCharacter { ch: '.', .. })
        ));
        assert!(Path::root().child("a$").is_err());
    }

    #[test]
    fn child_key_is_exactly_one_segment() {
        let chirps = Path::parse("chirps").unwrap();
        assert!(matches!(chirps.child_key(""), Err(PathError::EmptySegment(_))));
        assert!(matches!(
            chirps.child_key("/"),
            Err(PathError::InvalidCharacter { ch: '/', .. })
        ));
        assert!(matches!(
            chirps.child_key("a/b"),
            Err(PathError::InvalidCharacter { ch: '/', .. })
        ));
        assert!(chirps.child_key("a.b").is_err());
    }

    #[test]
    fn overlap_is_ancestry_in_either_direction() {
        let chirps = Path::parse("chirps").unwrap();
        let one = Path::parse("chirps/abc").unwrap();
        let pad = Path::parse("chirppad").unwrap();

        assert!(chirps.contains(&one));
        assert!(!one.contains(&chirps));
        assert!(one.overlaps(&chirps));
        assert!(!pad.overlaps(&chirps));
        assert!(Path::root().overlaps(&pad));
    }
}
