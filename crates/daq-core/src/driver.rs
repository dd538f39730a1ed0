//! Driver Factory and Component Types
//!
//! This module provides the plugin API for dynamically registered drivers.
//! Drivers implement [`DriverFactory`]; a host registers the factories it links
//! and builds devices from the `[devices.driver]` sections of its TOML config.
//!
//! # Example: Implementing a Driver Factory
//!
//! ```rust,ignore
//! use daq_core::driver::{DriverFactory, DeviceComponents, Capability};
//! use futures::future::BoxFuture;
//! use std::sync::Arc;
//!
//! pub struct MyElectrometerFactory;
//!
//! impl DriverFactory for MyElectrometerFactory {
//!     fn driver_type(&self) -> &'static str { "my_electrometer" }
//!     fn name(&self) -> &'static str { "My Electrometer" }
//!     fn capabilities(&self) -> &'static [Capability] {
//!         &[Capability::MultiChannelAcquisition]
//!     }
//!
//!     fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
//!         let table = config.as_table().ok_or_else(|| anyhow::anyhow!("expected table"))?;
//!         if !table.contains_key("host") {
//!             anyhow::bail!("missing 'host' field");
//!         }
//!         Ok(())
//!     }
//!
//!     fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
//!         Box::pin(async move {
//!             let driver = Arc::new(MyElectrometer::connect(&config).await?);
//!             Ok(DeviceComponents::new().with_acquisition(driver))
//!         })
//!     }
//! }
//! ```

use crate::capabilities::{ChannelControl, MultiChannelAcquisition};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags for device introspection.
///
/// Mirrors the capability traits as an enum for easy matching and listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Runs prepare/start/read/status/abort sessions
    /// Corresponds to [`crate::capabilities::MultiChannelAcquisition`]
    MultiChannelAcquisition,

    /// Exposes per-channel range, inversion and calibration
    /// Corresponds to [`crate::capabilities::ChannelControl`]
    ChannelControl,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::MultiChannelAcquisition => "Multi-Channel Acquisition",
            Self::ChannelControl => "Channel Control",
        }
    }
}

// =============================================================================
// Device Components (Capability Bag)
// =============================================================================

/// Container for capability trait objects returned by drivers.
///
/// ```rust,ignore
/// let driver = Arc::new(MyDriver::new().await?);
///
/// let components = DeviceComponents::new()
///     .with_acquisition(driver.clone())
///     .with_channel_control(driver);
/// ```
#[derive(Default)]
pub struct DeviceComponents {
    /// Acquisition lifecycle implementation
    pub acquisition: Option<Arc<dyn MultiChannelAcquisition>>,

    /// Per-channel front-end implementation
    pub channel_control: Option<Arc<dyn ChannelControl>>,

    /// Capability-specific metadata (units, channel names, etc.)
    pub metadata: DeviceMetadata,
}

impl DeviceComponents {
    /// Create a new empty DeviceComponents
    pub fn new() -> Self {
        Self::default()
    }

    /// Get list of capabilities this device supports
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();

        if self.acquisition.is_some() {
            caps.push(Capability::MultiChannelAcquisition);
        }
        if self.channel_control.is_some() {
            caps.push(Capability::ChannelControl);
        }

        caps
    }

    /// Set MultiChannelAcquisition implementation
    pub fn with_acquisition(mut self, a: Arc<dyn MultiChannelAcquisition>) -> Self {
        self.acquisition = Some(a);
        self
    }

    /// Set ChannelControl implementation
    pub fn with_channel_control(mut self, c: Arc<dyn ChannelControl>) -> Self {
        self.channel_control = Some(c);
        self
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: DeviceMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// =============================================================================
// Device Metadata
// =============================================================================

/// Capability-specific metadata for a device.
#[derive(Debug, Clone, Default)]
pub struct DeviceMetadata {
    /// Identification string reported by the device, if queried
    pub identification: Option<String>,

    /// Units of the raw channel samples (e.g., "A")
    pub measurement_units: Option<String>,

    /// Names of the measurement channels, in channel order
    pub channel_names: Vec<String>,

    /// Smallest accepted integration time in seconds
    pub min_integration_time: Option<f64>,
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Trait for driver factories that create device instances.
///
/// The factory is responsible for:
///
/// 1. Declaring what driver type it handles (matching TOML `type` field)
/// 2. Validating configuration before instantiation
/// 3. Asynchronously creating the driver and returning capabilities
///
/// Factories must be `Send + Sync + 'static` because they may be called from any task.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name used in TOML config `type` field.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// List of capabilities this driver type provides.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Validate configuration without instantiating.
    ///
    /// # Returns
    ///
    /// - `Ok(())` if configuration is valid
    /// - `Err` with descriptive message if validation fails
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Async instantiation of the driver.
    ///
    /// Parses the configuration, opens the connection and returns the
    /// capability trait objects the device implements.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>>;
}
