//! Content addressing for fact subjects.
//!
//! Subjects (post references such as `alice/status/1`, profile references such
//! as `alice`) are never used as storage keys directly: they are hashed with
//! BLAKE3 and the 64-char lowercase hex digest is the key.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Purpose;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectHash(String);

impl SubjectHash {
    pub fn of(subject: &str) -> Self {
        Self(blake3::hash(subject.as_bytes()).to_hex().to_string())
    }

    /// Wrap an already-computed hex digest (e.g. read back from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Profile portion of a post subject: everything up to the first `/`.
/// A subject without a separator is already a profile reference.
pub fn profile_of(subject: &str) -> &str {
    match subject.find('/') {
        Some(i) => &subject[..i],
        None => subject,
    }
}

/// Subject a fact of `purpose` is keyed under. Follower counts belong to the
/// profile, so a post subject collapses to its profile portion.
pub fn fact_subject(purpose: Purpose, subject: &str) -> &str {
    match purpose {
        Purpose::PostText => subject,
        Purpose::FollowerCount => profile_of(subject),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex() {
        let a = SubjectHash::of("alice/status/1");
        let b = SubjectHash::of("alice/status/1");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, SubjectHash::of("alice/status/2"));
    }

    #[test]
    fn profile_stops_at_first_separator() {
        assert_eq!(profile_of("alice/status/1"), "alice");
        assert_eq!(profile_of("alice"), "alice");
        assert_eq!(profile_of("/status/1"), "");
    }

    #[test]
    fn follower_facts_key_on_profile() {
        assert_eq!(fact_subject(Purpose::FollowerCount, "bob/status/7"), "bob");
        assert_eq!(fact_subject(Purpose::FollowerCount, "bob"), "bob");
        assert_eq!(fact_subject(Purpose::PostText, "bob/status/7"), "bob/status/7");
    }
}
