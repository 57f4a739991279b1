//! # Bridge Error Types
//!
//! Error taxonomy for the bridge, split along the fault-tolerance boundary:
//!
//! | Variant | Severity | Raised by |
//! |---------|----------|-----------|
//! | `Configuration` | fatal | settings / definitions / registry build |
//! | `Transport` | recoverable | Modbus read/write |
//! | `DecodeAmbiguity` | recoverable | enum/select decode |
//! | `UnknownOption` | recoverable | select command encode |
//! | `Publisher` | recoverable | MQTT publish |
//!
//! Only `Configuration` is allowed to stop the process; everything else is
//! contained within a single poll cycle or command and logged.

use thiserror::Error;

/// Result type used throughout the bridge.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// All errors produced by the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Structural problem in settings or the definition table.
    ///
    /// Raised only before the poll loop starts; prevents startup.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Modbus transport failure (connect, read or write rejected).
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Underlying socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A raw register value has no entry in the entity's option table.
    ///
    /// The affected entity is simply not republished that tick.
    #[error("Register {address} value {raw} matches no configured option")]
    DecodeAmbiguity { address: u16, raw: i16 },

    /// A command requested a display value that is not a configured option.
    #[error("'{value}' is not an option of entity '{entity}'")]
    UnknownOption { entity: String, value: String },

    /// MQTT publish or connection failure.
    #[error("Publisher error: {message}")]
    Publisher { message: String },
}

impl BridgeError {
    /// Create a configuration error.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        BridgeError::Configuration {
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport<S: Into<String>>(message: S) -> Self {
        BridgeError::Transport {
            message: message.into(),
        }
    }

    /// Create a publisher error.
    pub fn publisher<S: Into<String>>(message: S) -> Self {
        BridgeError::Publisher {
            message: message.into(),
        }
    }

    /// Whether the error may stop the process.
    ///
    /// Everything except `Configuration` is contained by the poll loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Configuration { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
