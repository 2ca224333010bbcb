//! The crate-wide error type.
//!
//! Everything user-facing funnels into [`HermitError`]; context (which
//! package, which source, which operation) lives in the variant fields rather
//! than in stringly-typed wrapping.

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

/// An alias for the common Result type for this crate
pub type HermitResult<T> = std::result::Result<T, HermitError>;

/// Errors hermit can have
#[derive(Debug, Error, Diagnostic)]
pub enum HermitError {
    /// random i/o error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// random http client error
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// random URL parse error
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    /// random json error (op wire format, DB)
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// random camino conversion error
    #[error(transparent)]
    FromPathBufError(#[from] camino::FromPathBufError),

    /// A manifest failed to parse as HCL
    #[error("failed to parse manifest {path}")]
    ManifestParse {
        /// path of the offending manifest
        path: Utf8PathBuf,
        /// the underlying HCL error
        #[source]
        cause: Box<hcl::Error>,
    },

    /// A manifest parsed but violated the schema
    #[error("invalid manifest {path}: {message}")]
    ManifestValidation {
        /// path of the offending manifest
        path: Utf8PathBuf,
        /// what was wrong with it
        message: String,
    },

    /// A selector found no matching package
    #[error("no package matches {selector}")]
    #[diagnostic(help("run 'hermit search' to list available packages"))]
    UnknownPackage {
        /// the selector as the user wrote it
        selector: String,
    },

    /// A package resolved but has no source on the target platform
    #[error("{reference} has no source for {platform}")]
    NoSource {
        /// the resolved reference
        reference: String,
        /// the platform we tried to resolve for
        platform: String,
    },

    /// An install was attempted on a platform the manifest excludes
    #[error("{reference} is not supported on {platform}")]
    UnsupportedPlatform {
        /// the resolved reference
        reference: String,
        /// the unsupported platform
        platform: String,
    },

    /// Two installed packages want the same binary symlink
    #[error("binary {binary} from {wanted} conflicts with installed package {owner}")]
    #[diagnostic(help("uninstall the conflicting package first"))]
    BinaryConflict {
        /// name of the contested binary
        binary: String,
        /// the package being installed
        wanted: String,
        /// the package that already owns the binary
        owner: String,
    },

    /// A virtual dependency is satisfied by several uninstalled packages
    #[error("multiple packages provide {virtual_name}: {}", providers.join(", "))]
    #[diagnostic(help("install one of the providers explicitly to choose"))]
    MultipleProviders {
        /// the virtual capability name
        virtual_name: String,
        /// the candidate providers
        providers: Vec<String>,
    },

    /// A downloaded artifact's SHA-256 did not match the manifest
    #[error("checksum mismatch for {uri}")]
    #[diagnostic(help("expected {expected}, got {actual}; the upstream artifact may have changed"))]
    ChecksumMismatch {
        /// the source URI
        uri: String,
        /// digest(s) the manifest declares
        expected: String,
        /// digest of the downloaded bytes
        actual: String,
    },

    /// All mirrors and retries were exhausted
    #[error("failed to download {uri}: {last_error}")]
    DownloadFailed {
        /// the primary URI
        uri: String,
        /// the last error observed across mirrors/retries
        last_error: String,
    },

    /// Unable to acquire the state lock within the timeout
    #[error("timed out after {timeout:?} waiting for lock {path}")]
    #[diagnostic(help("another hermit process may be stuck; remove the lock file if so"))]
    LockTimeout {
        /// path of the lock file
        path: Utf8PathBuf,
        /// how long we waited
        timeout: std::time::Duration,
    },

    /// Archive layer error, including path-traversal attempts
    #[error("failed to extract {path}: {message}")]
    ExtractionFailed {
        /// the archive being extracted
        path: Utf8PathBuf,
        /// what went wrong
        message: String,
    },

    /// A trigger action returned non-zero or an IO error
    #[error("trigger {event} of {reference} failed: {message}")]
    TriggerFailed {
        /// the triggering event
        event: String,
        /// the package whose trigger ran
        reference: String,
        /// what went wrong
        message: String,
    },

    /// A reference string couldn't be parsed
    #[error("invalid package reference {value:?}")]
    InvalidReference {
        /// the offending input
        value: String,
    },

    /// An envar list entry wasn't KEY=VALUE
    #[error("unable to parse environment variable as a key/value pair: {line}")]
    EnvParse {
        /// the line of text that couldn't be parsed
        line: String,
    },

    /// A runtime-dependency cycle was found in manifests
    #[error("cyclic runtime dependency: {chain}")]
    CyclicDependency {
        /// the cycle, as `a -> b -> a`
        chain: String,
    },

    /// A git URL looked like an argument injection
    #[error("refusing git URL beginning with '-': {url}")]
    SuspiciousGitUrl {
        /// the offending URL
        url: String,
    },

    /// A subprocess we rely on failed
    #[error("{command} failed: {message}")]
    Subprocess {
        /// the command that ran
        command: String,
        /// why it failed
        message: String,
    },

    /// The directory is not a hermit environment
    #[error("{dir} is not a hermit environment")]
    #[diagnostic(help("run 'hermit init' to create one"))]
    NotAnEnvironment {
        /// where we looked
        dir: Utf8PathBuf,
    },

    /// A catch-all for contextual failures that have no dedicated variant
    #[error("{0}")]
    Other(String),
}

impl HermitError {
    /// Shorthand for an ad-hoc error with a formatted message
    pub fn msg(message: impl std::fmt::Display) -> Self {
        HermitError::Other(message.to_string())
    }
}
