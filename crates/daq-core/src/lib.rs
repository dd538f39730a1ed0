//! `daq-core`
//!
//! Core trait definitions and types shared by rust-daq instrument drivers.
//!
//! ## Modules
//!
//! - [`capabilities`]: capability traits a host drives (acquisition lifecycle,
//!   per-channel control) and the value types they exchange
//! - [`driver`]: the [`DriverFactory`](driver::DriverFactory) plugin boundary
//! - [`error`]: the [`DaqError`](error::DaqError) taxonomy

pub mod capabilities;
pub mod driver;
pub mod error;

// Re-export commonly used types
pub use anyhow::{anyhow, Result};
pub use capabilities::{AcquisitionState, ChannelReadout, Synchronization};
pub use error::{AppResult, DaqError};
