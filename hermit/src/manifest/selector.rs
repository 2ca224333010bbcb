//! Selectors pick packages out of the catalog: exact references, bare names,
//! version prefixes, and name globs.

use std::fmt;
use std::str::FromStr;

use crate::errors::{HermitError, HermitResult};
use crate::manifest::reference::Reference;

/// A pattern for picking a package from the catalog
#[derive(Debug, Clone)]
pub enum Selector {
    /// Matches exactly one reference
    Exact(Reference),
    /// Matches every reference of a package name
    Name(String),
    /// Matches references whose version starts with a partial version
    Prefix(Reference),
    /// Matches package names against a glob pattern
    Glob {
        /// the compiled pattern
        pattern: glob::Pattern,
        /// the pattern as the user wrote it
        raw: String,
    },
}

impl Selector {
    /// An exact selector for a fully-resolved reference
    pub fn exact(reference: Reference) -> Selector {
        Selector::Exact(reference)
    }

    /// Whether this selector matches the given reference
    pub fn matches(&self, reference: &Reference) -> bool {
        match self {
            Selector::Exact(exact) => exact == reference,
            Selector::Name(name) => name == &reference.name,
            Selector::Prefix(prefix) => prefix.matches(reference),
            Selector::Glob { pattern, .. } => pattern.matches(&reference.name),
        }
    }

    /// The package name this selector targets. For globs this is the raw
    /// pattern, usable only for display.
    pub fn name(&self) -> &str {
        match self {
            Selector::Exact(r) | Selector::Prefix(r) => &r.name,
            Selector::Name(name) => name,
            Selector::Glob { raw, .. } => raw,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Exact(r) | Selector::Prefix(r) => write!(f, "{r}"),
            Selector::Name(name) => f.write_str(name),
            Selector::Glob { raw, .. } => f.write_str(raw),
        }
    }
}

impl FromStr for Selector {
    type Err = HermitError;

    /// Parse a user-supplied selector:
    ///
    /// - anything containing glob metacharacters is a [`Selector::Glob`]
    /// - `name@channel` is a [`Selector::Exact`]
    /// - `name-1.2` is a [`Selector::Prefix`] (a full version is just a
    ///   prefix that happens to match exactly one reference)
    /// - a bare `name` is a [`Selector::Name`]
    fn from_str(s: &str) -> HermitResult<Selector> {
        if s.contains(['*', '?', '[']) {
            let pattern = glob::Pattern::new(s)
                .map_err(|err| HermitError::msg(format!("invalid glob {s:?}: {err}")))?;
            return Ok(Selector::Glob { pattern, raw: s.to_string() });
        }
        let reference: Reference = s.parse()?;
        if reference.channel.is_some() {
            Ok(Selector::Exact(reference))
        } else if reference.version.is_some() {
            Ok(Selector::Prefix(reference))
        } else {
            Ok(Selector::Name(reference.name))
        }
    }
}
