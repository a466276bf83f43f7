//! Custom error types for the crate.
//!
//! `SpectroError` is the single error type returned by the library. It is built
//! with `thiserror` and groups failures by where they originate:
//!
//! - **EEPROM codec**: `InsufficientPages`, `EncodeRange`, `MissingCoefficient`.
//!   Field-level decode problems are *not* errors; they are logged and the field
//!   falls back to its default so the rest of the record still decodes.
//! - **Command catalog**: `UnknownSetting`, `InvalidSettingValue`. Raised at the
//!   boundary, before anything is queued to the worker.
//! - **Device session**: `UnsupportedDevice`, `NotConnected`, `Instrument`.
//!   Backends report hardware failures with `anyhow`; the session wraps them
//!   into `Instrument`.
//! - **Worker wrapper**: `ConnectFailed`, `AlreadyRunning`, `WorkerTerminated`.
//! - **Ambient**: `Config`, `Configuration`, `Io`, `Json`, `Logging`.
//!
//! Nothing here crosses the worker channels. The worker logs its failures and
//! signals them with a poison message instead.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, SpectroError>;

/// Everything that can go wrong in this crate.
#[derive(Error, Debug)]
pub enum SpectroError {
    /// Fewer EEPROM pages than the record spans.
    #[error("EEPROM parse expects at least {expected} pages, got {actual}")]
    InsufficientPages {
        /// Pages the layout needs
        expected: usize,
        /// Pages supplied
        actual: usize,
    },

    /// A field would land outside its page or on the revision byte.
    #[error("EEPROM encode out of range: page {page}, offset {offset}, len {len}")]
    EncodeRange {
        /// Page index
        page: usize,
        /// Byte offset within the page
        offset: usize,
        /// Field width in bytes
        len: usize,
    },

    /// A coefficient array is shorter than its slots.
    #[error("EEPROM field '{field}' is missing coefficient {index}")]
    MissingCoefficient {
        /// Label of the missing slot
        field: &'static str,
        /// Position within the array
        index: usize,
    },

    /// Name not in the command catalog.
    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    /// Value has the wrong kind, range or length for its setting.
    #[error("Invalid value for setting '{setting}': {reason}")]
    InvalidSettingValue {
        /// Catalog name
        setting: String,
        /// What was wrong with the value
        reason: String,
    },

    /// Malformed id, or no backend for its scheme.
    #[error("Unsupported device identifier: {0}")]
    UnsupportedDevice(String),

    /// Operation needs a connected session.
    #[error("Device not connected")]
    NotConnected,

    /// Backend failure, flattened from its `anyhow` chain.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// The worker never delivered its settings.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// A session only connects once.
    #[error("Worker already running for {0}")]
    AlreadyRunning(String),

    /// The worker has exited and nothing is left to read.
    #[error("Worker has terminated")]
    WorkerTerminated,

    /// Figment extraction failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Extracted values failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File access, e.g. reading a page dump.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Subscriber setup or filter reload failed.
    #[error("Logging error: {0}")]
    Logging(String),
}

impl From<figment::Error> for SpectroError {
    fn from(err: figment::Error) -> Self {
        SpectroError::Config(Box::new(err))
    }
}

impl From<anyhow::Error> for SpectroError {
    fn from(err: anyhow::Error) -> Self {
        SpectroError::Instrument(format!("{:#}", err))
    }
}
