//! Acquisition Capabilities
//!
//! This module defines the capability traits a host framework drives when it runs
//! a multi-channel counter/electrometer in a scan. Instead of one monolithic
//! controller interface, a device implements the capabilities it supports:
//!
//! - [`MultiChannelAcquisition`]: the prepare/start/read/status/abort lifecycle
//! - [`ChannelControl`]: per-channel range, inversion, instant reading and calibration
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn step<T>(device: &T, integration_time: f64) -> Result<ChannelReadout>
//! where
//!     T: MultiChannelAcquisition,
//! {
//!     device.set_synchronization(Synchronization::SoftwareTrigger).await?;
//!     device.prepare(integration_time, 1, 0.0, 1).await?;
//!     device.start().await?;
//!     loop {
//!         let (state, _) = device.status().await?;
//!         if state != AcquisitionState::Acquiring {
//!             break;
//!         }
//!         tokio::time::sleep(Duration::from_millis(10)).await;
//!     }
//!     device.read().await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Synchronization
// =============================================================================

/// How acquisition points are clocked during a scan.
///
/// The `*Start` variants start a whole sequence from one edge; they exist in the
/// host vocabulary but are not supported by every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Synchronization {
    /// Host issues one trigger per point
    #[default]
    SoftwareTrigger,
    /// Host opens and closes one gate per point
    SoftwareGate,
    /// Host starts a sequence that then runs on its own clock
    SoftwareStart,
    /// External edge per point
    HardwareTrigger,
    /// External gate level per point
    HardwareGate,
    /// External edge starts a self-clocked sequence
    HardwareStart,
}

impl Synchronization {
    /// True when the host clocks each point.
    #[must_use]
    pub fn is_software(&self) -> bool {
        matches!(
            self,
            Self::SoftwareTrigger | Self::SoftwareGate | Self::SoftwareStart
        )
    }

    /// True for the sequence-start variants.
    #[must_use]
    pub fn is_start(&self) -> bool {
        matches!(self, Self::SoftwareStart | Self::HardwareStart)
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::SoftwareTrigger => "software trigger",
            Self::SoftwareGate => "software gate",
            Self::SoftwareStart => "software start",
            Self::HardwareTrigger => "hardware trigger",
            Self::HardwareGate => "hardware gate",
            Self::HardwareStart => "hardware start",
        }
    }
}

impl std::fmt::Display for Synchronization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Acquisition State
// =============================================================================

/// Host-facing state of an acquisition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    /// Ready: nothing configured, or the current start delivered everything
    #[default]
    Idle,
    /// Configured and armed, waiting for `start`
    Armed,
    /// Points are still outstanding for the current start
    Acquiring,
    /// Device reported a fault, an unknown state, or the link is down
    Fault,
}

impl AcquisitionState {
    /// Short label for status displays.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Armed => "ARMED",
            Self::Acquiring => "ACQUIRING",
            Self::Fault => "FAULT",
        }
    }
}

impl std::fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// Channel Readout
// =============================================================================

/// Samples delivered by one `read()` call.
///
/// `time` is the time-value series (channel 0); `channels` maps each measurement
/// channel name to its calibrated samples, in acquisition order. All series have
/// the same length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelReadout {
    /// Integration time of each delivered point, in seconds
    pub time: Vec<f64>,
    /// Calibrated samples per channel name (e.g. `"CHAN01"`)
    pub channels: BTreeMap<String, Vec<f64>>,
}

impl ChannelReadout {
    /// Number of points delivered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// True when the read delivered nothing new.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Samples of one channel, if it was part of the reply.
    pub fn channel(&self, name: &str) -> Option<&[f64]> {
        self.channels.get(name).map(Vec::as_slice)
    }

    /// Append the points of a later readout after these.
    pub fn append(&mut self, later: ChannelReadout) {
        self.time.extend(later.time);
        for (name, samples) in later.channels {
            self.channels.entry(name).or_default().extend(samples);
        }
    }
}

// =============================================================================
// Capability Traits
// =============================================================================

/// Capability: Multi-channel acquisition lifecycle
///
/// The host configures a session with [`prepare`](Self::prepare), then for every
/// start calls [`start`](Self::start) and polls [`status`](Self::status) /
/// [`read`](Self::read) until the start is complete.
///
/// # Contract
/// - `prepare` rejects unusable requests before touching the hardware
/// - `read` is idempotent with respect to already-delivered data
/// - `status` reports link failures as [`AcquisitionState::Fault`] instead of erroring
/// - `abort` is idempotent
#[async_trait]
pub trait MultiChannelAcquisition: Send + Sync {
    /// Select the synchronization used by the next `prepare`.
    async fn set_synchronization(&self, synchronization: Synchronization) -> Result<()>;

    /// Synchronization currently selected.
    async fn synchronization(&self) -> Result<Synchronization>;

    /// Configure and arm a session.
    ///
    /// # Arguments
    /// * `integration_time` - seconds per point
    /// * `repetitions` - points per start
    /// * `latency` - dead time between points requested by the host, in seconds
    /// * `nb_starts` - number of starts in the session
    async fn prepare(
        &self,
        integration_time: f64,
        repetitions: u64,
        latency: f64,
        nb_starts: u64,
    ) -> Result<()>;

    /// Begin the next start of the session.
    async fn start(&self) -> Result<()>;

    /// Pull every point that became available since the last read.
    async fn read(&self) -> Result<ChannelReadout>;

    /// Current state and a human-readable status message.
    async fn status(&self) -> Result<(AcquisitionState, String)>;

    /// Stop the acquisition. Calling it again is a no-op.
    async fn abort(&self) -> Result<()>;
}

/// Capability: Per-channel front-end control
///
/// Channels are numbered from 1; channel 0 is the time-value series and has no
/// front-end.
#[async_trait]
pub trait ChannelControl: Send + Sync {
    /// Number of measurement channels (excluding the time series).
    fn channel_count(&self) -> usize;

    /// Amplifier range of a channel (e.g. `"1mA"`).
    async fn range(&self, channel: usize) -> Result<String>;

    /// Set the amplifier range of a channel.
    async fn set_range(&self, channel: usize, range: &str) -> Result<()>;

    /// Digital inversion of a channel.
    async fn inversion(&self, channel: usize) -> Result<bool>;

    /// Enable or disable digital inversion of a channel.
    async fn set_inversion(&self, channel: usize, inverted: bool) -> Result<()>;

    /// Instantaneous current of a channel.
    async fn instant_current(&self, channel: usize) -> Result<f64>;

    /// Calibration formula applied to the channel's samples.
    async fn formula(&self, channel: usize) -> Result<String>;

    /// Replace the calibration formula of a channel.
    async fn set_formula(&self, channel: usize, formula: &str) -> Result<()>;
}
