use std::fmt;

/// Errors raised while the translator talks to the object-storage backend.
///
/// `Display` defers to `{:?}`; callers needing a user-facing message use the
/// `log` macros instead, same as the rest of this workspace.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    Config(ConfigError),
    /// A `put`/`get`/`delete_many`/`list`/`head` call failed for a reason other than
    /// NoSuchKey. Carries whether the failure looked transient (timeout, connection
    /// reset) so the session facade can map it to the host's I/O-error status without
    /// re-deriving that classification.
    Backend { transient: bool, message: String },
    /// A `delete_many` response reported at least one per-key error.
    BatchDelete(String),
    /// A short body from a range GET, or a body of the wrong length being `put`.
    Assertion(String),
    /// A write (or a size query requiring a write-capable device) was attempted against
    /// a single-object, read-only session.
    ReadOnly,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Backend { transient: true, .. })
    }
}

/// Configuration errors, raised once at config-complete time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    MissingBucket,
    MissingKey,
    SizeWithoutObjectSize,
    ObjectSizeWithoutSize,
    SizeNotMultipleOfObjectSize { size: u64, object_size: u64 },
    ZeroObjectSize,
    UnknownParameter(String),
    BadSize(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}
