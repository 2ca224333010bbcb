//! Reversible operations over sets of environment variables.
//!
//! Activation applies a sequence of [`Op`]s to the process environment;
//! deactivation replays the exact inverse. Prior values are preserved in
//! synthesized `_HERMIT_OLD_<name>_<fingerprint>` side-keys so that nested
//! activations compose. The op sequence itself crosses the process boundary as
//! a compact JSON blob (see [`marshal_ops`]) stored in `HERMIT_ENV_OPS` by the
//! shell.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{HermitError, HermitResult};
use crate::{vars, SortedMap, SortedSet};

/// A set of environment variables
pub type Envars = SortedMap<String, String>;

/// Prefix of the synthesized side-keys that preserve shadowed values
pub const OLD_VAR_PREFIX: &str = "_HERMIT_OLD_";

/// A single reversible mutation of an environment.
///
/// Serializes with a one-letter tag per variant so the whole activation
/// sequence fits comfortably in an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Append a `:`-separated element, deduplicating existing occurrences
    #[serde(rename = "a")]
    Append {
        /// variable name
        #[serde(rename = "n")]
        name: String,
        /// element to append
        #[serde(rename = "v")]
        value: String,
    },
    /// Prepend a `:`-separated element, deduplicating existing occurrences
    #[serde(rename = "p")]
    Prepend {
        /// variable name
        #[serde(rename = "n")]
        name: String,
        /// element to prepend
        #[serde(rename = "v")]
        value: String,
    },
    /// Prepend a literal prefix iff the value doesn't already start with it
    #[serde(rename = "x")]
    Prefix {
        /// variable name
        #[serde(rename = "n")]
        name: String,
        /// the prefix string
        #[serde(rename = "v")]
        prefix: String,
    },
    /// Set a variable, preserving any shadowed value in a side-key
    #[serde(rename = "s")]
    Set {
        /// variable name
        #[serde(rename = "n")]
        name: String,
        /// new value
        #[serde(rename = "v")]
        value: String,
    },
    /// Delete a variable, preserving any prior value in a side-key
    #[serde(rename = "u")]
    Unset {
        /// variable name
        #[serde(rename = "n")]
        name: String,
    },
    /// Unconditional set; revert unconditionally unsets (no side-key)
    #[serde(rename = "f")]
    Force {
        /// variable name
        #[serde(rename = "n")]
        name: String,
        /// new value
        #[serde(rename = "v")]
        value: String,
    },
}

impl Op {
    /// The name of the variable this op touches
    pub fn name(&self) -> &str {
        match self {
            Op::Append { name, .. }
            | Op::Prepend { name, .. }
            | Op::Prefix { name, .. }
            | Op::Set { name, .. }
            | Op::Unset { name }
            | Op::Force { name, .. } => name,
        }
    }

    /// One-letter variant tag, part of the side-key fingerprint
    fn tag(&self) -> &'static str {
        match self {
            Op::Append { .. } => "a",
            Op::Prepend { .. } => "p",
            Op::Prefix { .. } => "x",
            Op::Set { .. } => "s",
            Op::Unset { .. } => "u",
            Op::Force { .. } => "f",
        }
    }

    fn value(&self) -> &str {
        match self {
            Op::Append { value, .. }
            | Op::Prepend { value, .. }
            | Op::Set { value, .. }
            | Op::Force { value, .. } => value,
            Op::Prefix { prefix, .. } => prefix,
            Op::Unset { .. } => "",
        }
    }

    /// Deterministic fingerprint of this op within an environment root.
    ///
    /// Computed over the raw (pre-expansion) fields so that the marshalled op
    /// yields the same side-key in the deactivating process.
    fn fingerprint(&self, root: &str) -> String {
        let mut hasher = Sha256::new();
        for part in [root, self.tag(), self.name(), self.value()] {
            hasher.update(part.as_bytes());
            hasher.update([0]);
        }
        hex::encode(&hasher.finalize()[..4])
    }

    fn marker(&self, root: &str) -> String {
        format!("{OLD_VAR_PREFIX}{}_{}", self.name(), self.fingerprint(root))
    }
}

/// The result of applying a sequence of [`Op`]s to an initial environment.
#[derive(Debug, Clone)]
pub struct Transform {
    root: String,
    vars: Envars,
    changed: SortedSet<String>,
}

impl Transform {
    /// Start a transform from an initial environment. `root` is the absolute
    /// path of the environment being activated; it namespaces the side-keys.
    pub fn new(root: impl Into<String>, initial: Envars) -> Transform {
        Transform { root: root.into(), vars: initial, changed: SortedSet::new() }
    }

    /// Current value of a variable
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|s| s.as_str())
    }

    fn set(&mut self, name: &str, value: String) {
        self.changed.insert(name.to_string());
        self.vars.insert(name.to_string(), value);
    }

    fn unset(&mut self, name: &str) {
        self.changed.insert(name.to_string());
        self.vars.remove(name);
    }

    /// Expand `${VAR}` references in `value` against the current state
    pub fn expand(&self, value: &str) -> String {
        vars::expand(value, |name| self.get(name).map(|v| v.to_string()))
    }

    /// Apply a single op
    pub fn apply(&mut self, op: &Op) {
        let root = self.root.clone();
        match op {
            Op::Set { name, value } => {
                let value = self.expand(value);
                if let Some(old) = self.get(name).map(|v| v.to_string()) {
                    self.set(&op.marker(&root), old);
                }
                self.set(name, value);
            }
            Op::Unset { name } => {
                if let Some(old) = self.get(name).map(|v| v.to_string()) {
                    self.set(&op.marker(&root), old);
                    self.unset(name);
                }
            }
            Op::Append { name, value } => {
                let value = self.expand(value);
                let mut parts = self.split(name, &value);
                parts.push(value);
                self.set(name, parts.join(":"));
            }
            Op::Prepend { name, value } => {
                let value = self.expand(value);
                let mut parts = self.split(name, &value);
                parts.insert(0, value.clone());
                self.set(name, parts.join(":"));
            }
            Op::Prefix { name, prefix } => {
                let prefix = self.expand(prefix);
                let current = self.get(name).unwrap_or("").to_string();
                if !current.starts_with(&prefix) {
                    self.set(name, format!("{prefix}{current}"));
                }
            }
            Op::Force { name, value } => {
                let value = self.expand(value);
                self.set(name, value);
            }
        }
    }

    /// Revert a single op. Reverting an op against the transform produced by
    /// applying it restores the original mapping.
    pub fn revert(&mut self, op: &Op) {
        let root = self.root.clone();
        match op {
            Op::Set { name, value } => {
                let value = self.expand(value);
                let marker = op.marker(&root);
                let saved = self.get(&marker).map(|v| v.to_string());
                match saved {
                    Some(old) => {
                        // If the user has since overwritten the variable, drop
                        // only the marker.
                        if self.get(name) == Some(value.as_str()) {
                            self.set(name, old);
                        }
                        self.unset(&marker);
                    }
                    None => {
                        if self.get(name) == Some(value.as_str()) {
                            self.unset(name);
                        }
                    }
                }
            }
            Op::Unset { name } => {
                let marker = op.marker(&root);
                if let Some(old) = self.get(&marker).map(|v| v.to_string()) {
                    self.set(name, old);
                    self.unset(&marker);
                }
            }
            Op::Append { name, value } | Op::Prepend { name, value } => {
                let value = self.expand(value);
                let parts = self.split(name, &value);
                if parts.is_empty() {
                    self.unset(name);
                } else {
                    self.set(name, parts.join(":"));
                }
            }
            Op::Prefix { name, prefix } => {
                let prefix = self.expand(prefix);
                if let Some(current) = self.get(name).map(|v| v.to_string()) {
                    if let Some(stripped) = current.strip_prefix(&prefix) {
                        if stripped.is_empty() {
                            self.unset(name);
                        } else {
                            self.set(name, stripped.to_string());
                        }
                    }
                }
            }
            Op::Force { name, .. } => {
                self.unset(name);
            }
        }
    }

    /// Apply a sequence of ops in order
    pub fn apply_all(&mut self, ops: &[Op]) {
        for op in ops {
            self.apply(op);
        }
    }

    /// Revert a sequence of ops, in reverse order
    pub fn revert_all(&mut self, ops: &[Op]) {
        for op in ops.iter().rev() {
            self.revert(op);
        }
    }

    /// The `:`-separated elements of a variable, minus occurrences of `value`
    fn split(&self, name: &str, value: &str) -> Vec<String> {
        self.get(name)
            .unwrap_or("")
            .split(':')
            .filter(|p| !p.is_empty() && *p != value)
            .map(|p| p.to_string())
            .collect()
    }

    /// The full environment after all applied ops
    pub fn combined(&self) -> Envars {
        self.vars.clone()
    }

    /// Only the variables this transform changed. Side-keys are included iff
    /// `include_revert_markers` is set. Deleted variables are simply absent.
    pub fn changed(&self, include_revert_markers: bool) -> Envars {
        self.changed
            .iter()
            .filter(|name| include_revert_markers || !name.starts_with(OLD_VAR_PREFIX))
            .filter_map(|name| self.vars.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    /// Names this transform changed, including those it deleted
    pub fn changed_names(&self) -> impl Iterator<Item = &str> {
        self.changed.iter().map(|s| s.as_str())
    }
}

/// Parse `KEY=VALUE` lines into an [`Envars`] map. The string syntax is
/// sh-compatible, and also the format returned by `env`. A key occurring more
/// than once keeps its final occurrence.
pub fn parse_envars<S: AsRef<str>>(env: &[S]) -> HermitResult<Envars> {
    let mut parsed = Envars::new();
    for line in env {
        let line = line.as_ref();
        let Some((key, value)) = line.split_once('=') else {
            return Err(HermitError::EnvParse { line: line.to_owned() });
        };
        parsed.insert(key.to_string(), value.to_string());
    }
    Ok(parsed)
}

/// Turn raw `(KEY, VALUE)` pairs into a best-guess op list:
///
/// - a value beginning with `${KEY}:` or `$KEY:` becomes an [`Op::Append`]
/// - a value ending with `:${KEY}` or `:$KEY` becomes an [`Op::Prepend`]
/// - an empty value becomes an [`Op::Unset`]
/// - anything else becomes an [`Op::Set`]
pub fn infer<'a>(env: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<Op> {
    let mut ops = Vec::new();
    for (name, value) in env {
        let long_ref = format!("${{{name}}}");
        let short_ref = format!("${name}");
        let op = if value.is_empty() {
            Op::Unset { name: name.to_string() }
        } else if let Some(rest) = value
            .strip_prefix(&format!("{long_ref}:"))
            .or_else(|| value.strip_prefix(&format!("{short_ref}:")))
        {
            Op::Append { name: name.to_string(), value: rest.to_string() }
        } else if let Some(rest) = value
            .strip_suffix(&format!(":{long_ref}"))
            .or_else(|| value.strip_suffix(&format!(":{short_ref}")))
        {
            Op::Prepend { name: name.to_string(), value: rest.to_string() }
        } else {
            Op::Set { name: name.to_string(), value: value.to_string() }
        };
        ops.push(op);
    }
    ops
}

/// Serialize ops to the compact JSON wire form stored in `HERMIT_ENV_OPS`
pub fn marshal_ops(ops: &[Op]) -> HermitResult<String> {
    Ok(serde_json::to_string(ops)?)
}

/// The inverse of [`marshal_ops`]
pub fn unmarshal_ops(blob: &str) -> HermitResult<Vec<Op>> {
    Ok(serde_json::from_str(blob)?)
}
