//! Package references: `(name, version | channel)` pairs and the
//! numeric-aware version ordering they sort by.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::errors::{HermitError, HermitResult};

/// A package version: a dotted tuple compared component-wise.
///
/// Components are compared numerically when both sides parse as integers and
/// lexically otherwise. A tuple that is a strict prefix of another sorts
/// before it (`1.2` < `1.2.0`), so "highest version" always prefers the more
/// specific tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    raw: String,
    components: Vec<String>,
}

impl Version {
    /// Parse a version from its string form. Components are separated by any
    /// of `.`, `-` or `_` (`1.2.3-beta` has four components).
    pub fn new(raw: impl Into<String>) -> Version {
        let raw = raw.into();
        let components = raw
            .split(['.', '-', '_'])
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string())
            .collect();
        Version { raw, components }
    }

    /// The version as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `self`, treated as a partial version, is a component-wise
    /// prefix of `other` (`1.20` is a prefix of `1.20.1` and of itself).
    pub fn is_prefix_of(&self, other: &Version) -> bool {
        if self.components.len() > other.components.len() {
            return false;
        }
        self.components
            .iter()
            .zip(&other.components)
            .all(|(a, b)| compare_components(a, b) == Ordering::Equal)
    }
}

fn compare_components(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.components.iter().zip(&other.components) {
            match compare_components(a, b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.components.len().cmp(&other.components.len())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A `(name, version | channel)` pair identifying a package instance.
///
/// Serialized as `name-1.2.3` or `name@stable`. A reference with neither
/// version nor channel is *partial* and only occurs as selector input; every
/// resolved package carries a full reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// package name
    pub name: String,
    /// concrete version, if this is a versioned reference
    pub version: Option<Version>,
    /// channel name, if this is a channel reference
    pub channel: Option<String>,
}

impl Reference {
    /// A versioned reference
    pub fn versioned(name: impl Into<String>, version: Version) -> Reference {
        Reference { name: name.into(), version: Some(version), channel: None }
    }

    /// A channel reference
    pub fn channeled(name: impl Into<String>, channel: impl Into<String>) -> Reference {
        Reference { name: name.into(), version: None, channel: Some(channel.into()) }
    }

    /// A partial, name-only reference
    pub fn name_only(name: impl Into<String>) -> Reference {
        Reference { name: name.into(), version: None, channel: None }
    }

    /// Whether this reference names a channel
    pub fn is_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// Whether this reference has neither version nor channel
    pub fn is_partial(&self) -> bool {
        self.version.is_none() && self.channel.is_none()
    }

    /// Whether `self`, treated as a partial reference, matches `other`.
    /// Version prefixes match component-wise; channels must be equal.
    pub fn matches(&self, other: &Reference) -> bool {
        if self.name != other.name {
            return false;
        }
        if let Some(channel) = &self.channel {
            return other.channel.as_deref() == Some(channel.as_str());
        }
        match (&self.version, &other.version) {
            (Some(prefix), Some(version)) => prefix.is_prefix_of(version),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// The canonical string form, used as the DB key and in link names
    pub fn string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.version, &self.channel) {
            (Some(version), _) => write!(f, "{}-{}", self.name, version),
            (None, Some(channel)) => write!(f, "{}@{}", self.name, channel),
            (None, None) => f.write_str(&self.name),
        }
    }
}

impl FromStr for Reference {
    type Err = HermitError;

    /// Parse `name`, `name-1.2.3` or `name@channel`. The version begins at
    /// the first `-`-separated field starting with a digit, so hyphenated
    /// names like `protoc-gen-go-1.28.0` parse correctly.
    fn from_str(s: &str) -> HermitResult<Reference> {
        if s.is_empty() || s.starts_with('@') || s.starts_with('-') {
            return Err(HermitError::InvalidReference { value: s.to_string() });
        }
        if let Some((name, channel)) = s.split_once('@') {
            if channel.is_empty() {
                return Err(HermitError::InvalidReference { value: s.to_string() });
            }
            return Ok(Reference::channeled(name, channel));
        }
        let fields: Vec<&str> = s.split('-').collect();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 && field.starts_with(|c: char| c.is_ascii_digit()) {
                let name = fields[..i].join("-");
                let version = Version::new(fields[i..].join("-"));
                return Ok(Reference::versioned(name, version));
            }
        }
        Ok(Reference::name_only(s))
    }
}
