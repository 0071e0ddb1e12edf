//! Destination hostname policy.
//!
//! An [`AllowList`] holds hostname suffixes fixed at startup. Matching is a
//! plain byte suffix comparison: there is no dot-boundary check, so an
//! entry of `example.com` also admits `evilexample.com`. Operators who need
//! a strict boundary should configure suffixes with a leading dot
//! (`.example.com`).

use std::fmt;

/// Ordered, immutable set of permitted hostname suffixes.
///
/// An empty list permits every hostname (open relay mode).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    suffixes: Vec<String>,
}

impl AllowList {
    /// Build a list from suffixes.
    pub fn new<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            suffixes: suffixes.into_iter().map(Into::into).collect(),
        }
    }

    /// A list that permits every hostname.
    pub fn open() -> Self {
        Self::default()
    }

    /// Parse a comma-separated list, as given on the command line.
    ///
    /// An empty string yields an open list. Entries are used verbatim.
    pub fn from_comma_separated(list: &str) -> Self {
        if list.is_empty() {
            return Self::open();
        }
        Self::new(list.split(','))
    }

    /// Whether every hostname is permitted.
    pub fn is_open(&self) -> bool {
        self.suffixes.is_empty()
    }

    /// Check whether `hostname` may be proxied.
    pub fn allowed(&self, hostname: &str) -> bool {
        self.is_open()
            || self
                .suffixes
                .iter()
                .any(|suffix| hostname.ends_with(suffix.as_str()))
    }
}

impl fmt::Display for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open() {
            write!(f, "<all hostnames>")
        } else {
            write!(f, "{}", self.suffixes.join(","))
        }
    }
}
