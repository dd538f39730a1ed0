//! Custom error types for instrument drivers.
//!
//! This module defines the primary error type, `DaqError`, shared by drivers and
//! hosts. Using the `thiserror` crate, it provides a consistent way to tell apart
//! the failure classes an instrument conversation can produce.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: Local misuse of a connection object, such as opening a socket
//!   that is already open.
//! - **`Communication`**: The link to the instrument failed and the single
//!   reconnect-and-retry did not recover it.
//! - **`Device`**: The instrument understood the request and refused it. The payload is
//!   the instrument's own message.
//! - **`Parse`**: The instrument answered with something that does not match the
//!   expected reply grammar.
//! - **`Configuration`**: A request was rejected before anything was sent to the
//!   instrument.
//! - **`Formula`**: A calibration formula could not be compiled or evaluated.
//!
//! Capability traits return `anyhow::Result`, so a `DaqError` travels through `?`
//! unchanged and can be recovered with `err.downcast_ref::<DaqError>()`.

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for instrument drivers.
///
/// # Error Categories
///
/// 1. **Transport Errors** - `Communication`
///    - The socket timed out, was reset or refused
///    - Already retried once by the line client before surfacing
///    - Recovery: supervising loop observes `FAULT` and decides
///
/// 2. **Instrument Errors** - `Device`, `Parse`
///    - A command/state mismatch or a reply the driver cannot interpret
///    - Not retried automatically
///
/// 3. **Request Errors** - `Configuration`, `Formula`, `Connection`
///    - Rejected synchronously, nothing (more) is sent to the hardware
#[derive(Error, Debug)]
pub enum DaqError {
    /// Connection object used in an invalid way.
    ///
    /// **Example**: `open()` called while the socket is already open.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Transport failure that survived the reconnect-and-retry budget.
    ///
    /// **Error Type**: Fatal for the request that produced it. The connection is
    /// closed and will be reopened by the next request.
    #[error("Communication error while sending '{command}': {message}")]
    Communication {
        /// Command whose exchange failed
        command: String,
        /// Description of the last transport failure
        message: String,
    },

    /// The instrument replied with its error token.
    ///
    /// The payload is the instrument's message with the token stripped.
    #[error("{0}")]
    Device(String),

    /// The instrument replied with something that does not fit the reply grammar.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A request was rejected before any command was issued.
    ///
    /// # Example
    ///
    /// ```rust
    /// use daq_core::error::DaqError;
    ///
    /// fn validate_time(seconds: f64) -> Result<f64, DaqError> {
    ///     if !seconds.is_finite() {
    ///         return Err(DaqError::Configuration(
    ///             "integration time must be finite".into()
    ///         ));
    ///     }
    ///     Ok(seconds)
    /// }
    /// assert!(validate_time(f64::NAN).is_err());
    /// ```
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A calibration formula was rejected or failed on a sample.
    #[error("Formula error in '{formula}': {message}")]
    Formula {
        /// Formula text as supplied by the user
        formula: String,
        /// What went wrong
        message: String,
    },
}

impl DaqError {
    /// Build a [`DaqError::Communication`] for `command`.
    pub fn communication(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Communication {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Build a [`DaqError::Formula`].
    pub fn formula(formula: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Formula {
            formula: formula.into(),
            message: message.into(),
        }
    }

    /// True for link-level failures (as opposed to instrument or request errors).
    ///
    /// Polling code uses this to degrade to a fault state instead of propagating.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Communication { .. })
    }
}
