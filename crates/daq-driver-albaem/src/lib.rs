//! ALBA Em# (EM2) Electrometer Driver
//!
//! This crate provides a driver for the ALBA Em# four-channel electrometer,
//! controlled over a plain-text line protocol on TCP.
//!
//! # Layers
//!
//! - [`sockio`] - line client: framing, timeouts, single-retry reconnection
//! - [`em2`] - typed device commands and per-channel front-ends
//! - [`acquisition`] - prepare/start/read/status/abort session orchestration
//! - [`driver`] - rust-daq capability traits and the driver factory
//!
//! # Capabilities
//!
//! - `MultiChannelAcquisition` - scan sessions in software or hardware
//!   trigger/gate synchronization
//! - `ChannelControl` - range, inversion, instantaneous current, calibration
//!   formulas
//!
//! # Usage
//!
//! ```rust,ignore
//! use daq_driver_albaem::AlbaEmFactory;
//! use daq_core::driver::DriverFactory;
//!
//! // Register the factory
//! registry.register_factory(Box::new(AlbaEmFactory));
//!
//! // Create via config
//! let config = toml::toml! {
//!     host = "electrometer01"
//!     port = 5025
//! };
//! let components = factory.build(config.into()).await?;
//! ```
//!
//! # Mock Mode
//!
//! For testing without hardware, set `mock = true` in the configuration. The
//! driver then talks to a simulated device on a loopback socket
//! ([`mock::MockEm2`]).

pub mod acquisition;
pub mod config;
pub mod driver;
pub mod em2;
pub mod formula;
pub mod measurement;
pub mod mock;
pub mod sockio;

pub use acquisition::Acquisition;
pub use driver::{AlbaEmConfig, AlbaEmDriver, AlbaEmFactory};
pub use em2::{Channel, DeviceState, Em2, TriggerMode};
pub use sockio::LineClient;

/// Force linker to include this crate's factories.
/// Call this from the host's hardware registry to ensure the factory is available.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<AlbaEmFactory>());
}
