//! Error taxonomy for the marshaling core.
//!
//! Infrastructure failures (bad handles, missing libraries or symbols,
//! unclassifiable types) are distinct from [`Error::ForeignException`], which
//! carries a business failure raised by foreign code and is the only variant
//! callers are expected to recover from.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for all marshaling operations.
pub type Result<T> = std::result::Result<T, Error>;

/// One dlopen attempt recorded while searching for a library.
#[derive(Debug, Clone)]
pub struct LoadAttempt {
    /// Candidate path handed to the loader.
    pub path: PathBuf,
    /// Whether the file existed at the time of the attempt.
    pub exists: bool,
    /// Loader error text, if any.
    pub detail: String,
}

/// The full attempted-path trail of a failed library load.
#[derive(Debug, Clone, Default)]
pub struct LoadAttempts(pub Vec<LoadAttempt>);

impl fmt::Display for LoadAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for attempt in &self.0 {
            write!(
                f,
                "\n+{} {}",
                attempt.path.display(),
                if attempt.exists { "(exists)" } else { "(does not exist)" }
            )?;
            if !attempt.detail.is_empty() {
                write!(f, ": {}", attempt.detail)?;
            }
        }
        Ok(())
    }
}

/// Error type for metadata introspection and value marshaling.
#[derive(Debug, Error)]
pub enum Error {
    /// A descriptor or metatype handle was null or otherwise unusable.
    #[error("invalid handle: {0}")]
    Validation(String),

    /// No candidate path could be loaded. Carries every attempted path and
    /// the loader's error text, since this is usually a configuration
    /// problem.
    #[error("unable to load library {name}:{attempts}")]
    LibraryLoad { name: String, attempts: LoadAttempts },

    /// A symbol was not exported by the library that was expected to
    /// provide it.
    #[error("unable to find symbol {symbol} in {library}: {detail}")]
    SymbolNotFound {
        symbol: String,
        library: String,
        detail: String,
    },

    /// No metatype rule matched the given managed type.
    #[error("unable to retrieve foreign metatype for type {0}")]
    UnsupportedType(String),

    /// No marshal classification matched the given managed type.
    #[error("unable to marshal type {0}")]
    UnsupportedMarshal(String),

    /// A foreign metatype has no registered managed counterpart.
    #[error("unknown foreign type {0}")]
    UnknownForeignType(String),

    /// A foreign call completed by raising an error. The handle addresses
    /// the foreign error box; the description is captured when the
    /// exception is raised.
    #[error("foreign error raised: {description}")]
    ForeignException { handle: usize, description: String },

    /// Registration manifest could not be read.
    #[error("failed to read registration manifest: {0}")]
    Io(#[from] std::io::Error),

    /// Registration manifest could not be parsed.
    #[error("failed to parse registration manifest: {0}")]
    Manifest(#[from] toml::de::Error),
}

impl Error {
    /// True for the expected, user-visible foreign failure; false for
    /// every infrastructure error.
    pub fn is_foreign_exception(&self) -> bool {
        matches!(self, Error::ForeignException { .. })
    }
}
