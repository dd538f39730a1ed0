//! ALBA Em# Driver
//!
//! Adapts the [`Acquisition`] orchestrator and the [`Em2`] command layer to
//! the rust-daq capability traits and registers them through
//! [`AlbaEmFactory`].
//!
//! # Capabilities
//!
//! - `MultiChannelAcquisition` - prepare/start/read/status/abort sessions
//! - `ChannelControl` - range, inversion, instantaneous current and
//!   calibration formula per channel

use crate::acquisition::{Acquisition, AcquisitionSession, MIN_INTEGRATION_TIME};
use crate::em2::{channel_name, Em2, CHANNEL_COUNT, TRIGGER_INPUTS};
use crate::formula::CalibrationFormula;
use crate::mock::MockEm2;
use crate::sockio::{LineClient, DEFAULT_PORT, DEFAULT_TIMEOUT_MS};
use anyhow::{Context, Result};
use async_trait::async_trait;
use daq_core::capabilities::{
    AcquisitionState, ChannelControl, ChannelReadout, MultiChannelAcquisition, Synchronization,
};
use daq_core::driver::{Capability, DeviceComponents, DeviceMetadata, DriverFactory};
use daq_core::error::{AppResult, DaqError};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Em# driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlbaEmConfig {
    /// Hostname or IP address of the electrometer
    pub host: String,

    /// Command port (default: 5025)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connect/read/write timeout in milliseconds (default: 1000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Use the in-process simulated device instead of `host:port`
    #[serde(default)]
    pub mock: bool,

    /// External trigger input for the hardware synchronizations
    #[serde(default = "default_trigger_input")]
    pub trigger_input: String,

    /// `ACQU:MODE` pushed to the device when the driver is built
    #[serde(default)]
    pub acquisition_mode: Option<String>,

    /// Points per start when the host asks for a single repetition in a
    /// hardware synchronization
    #[serde(default = "default_points_per_step")]
    pub points_per_step: u64,

    /// Calibration formula per channel number, e.g. `"1" = "value*2"`
    #[serde(default)]
    pub formulas: BTreeMap<String, String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_trigger_input() -> String {
    crate::acquisition::DEFAULT_TRIGGER_INPUT.to_string()
}

fn default_points_per_step() -> u64 {
    1
}

impl AlbaEmConfig {
    /// Configuration for `host` with every other field at its default.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            mock: false,
            trigger_input: default_trigger_input(),
            acquisition_mode: None,
            points_per_step: default_points_per_step(),
            formulas: BTreeMap::new(),
        }
    }

    /// Check every field, including that each formula compiles.
    pub fn validate(&self) -> AppResult<()> {
        if self.host.trim().is_empty() {
            return Err(DaqError::Configuration("'host' cannot be empty".into()));
        }
        if self.port == 0 {
            return Err(DaqError::Configuration("'port' cannot be 0".into()));
        }
        if self.timeout_ms == 0 {
            return Err(DaqError::Configuration("'timeout_ms' cannot be 0".into()));
        }
        if self.points_per_step == 0 {
            return Err(DaqError::Configuration(
                "'points_per_step' must be at least 1".into(),
            ));
        }
        if !TRIGGER_INPUTS.contains(&self.trigger_input.as_str()) {
            return Err(DaqError::Configuration(format!(
                "unknown trigger input '{}' (expected one of {})",
                self.trigger_input,
                TRIGGER_INPUTS.join(", ")
            )));
        }
        if let Some(mode) = &self.acquisition_mode {
            if mode.trim().is_empty() {
                return Err(DaqError::Configuration(
                    "'acquisition_mode' cannot be empty".into(),
                ));
            }
        }
        for (channel, text) in self.formula_channels()? {
            CalibrationFormula::compile(text).map_err(|e| {
                DaqError::Configuration(format!("formula for channel {channel}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Formulas keyed by parsed channel number.
    pub fn formula_channels(&self) -> AppResult<Vec<(usize, &str)>> {
        self.formulas
            .iter()
            .map(|(key, text)| match key.trim().parse::<usize>() {
                Ok(n) if (1..=CHANNEL_COUNT).contains(&n) => Ok((n, text.as_str())),
                _ => Err(DaqError::Configuration(format!(
                    "formula key '{key}' is not a channel number (1..={CHANNEL_COUNT})"
                ))),
            })
            .collect()
    }

    /// Socket timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// =============================================================================
// AlbaEmDriver
// =============================================================================

/// Driver for the ALBA Em# four-channel electrometer.
///
/// # Example
///
/// ```rust,ignore
/// let driver = AlbaEmDriver::new_async(&AlbaEmConfig::new("electrometer01")).await?;
///
/// driver.set_synchronization(Synchronization::SoftwareTrigger).await?;
/// driver.prepare(0.1, 1, 0.0, 10).await?;
/// for _ in 0..10 {
///     driver.start().await?;
///     while driver.status().await?.0 == AcquisitionState::Acquiring {
///         tokio::time::sleep(Duration::from_millis(20)).await;
///     }
///     let points = driver.read().await?;
/// }
/// ```
pub struct AlbaEmDriver {
    em: Em2,
    acquisition: Mutex<Acquisition>,
    /// Simulated device backing a mock-mode driver
    mock: Option<MockEm2>,
}

impl AlbaEmDriver {
    /// Create a driver from a validated configuration and check the link.
    pub async fn new_async(config: &AlbaEmConfig) -> Result<Arc<Self>> {
        let (client, mock) = if config.mock {
            tracing::info!("Creating mock Em# driver");
            let mock = MockEm2::start()
                .await
                .context("Failed to start simulated Em#")?;
            (LineClient::new(mock.host(), mock.port()), Some(mock))
        } else {
            tracing::info!("Connecting to Em# at {}:{}", config.host, config.port);
            (LineClient::new(config.host.clone(), config.port), None)
        };
        let client = client.with_timeout(config.timeout());

        let mut driver = Self::with_em(Em2::new(client));
        driver.mock = mock;
        driver.configure(config).await?;
        driver.validate_connection().await?;

        tracing::info!("Em# driver initialized (mock={})", config.mock);
        Ok(Arc::new(driver))
    }

    /// Wrap an existing command layer without touching the device.
    pub fn with_em(em: Em2) -> Self {
        Self {
            acquisition: Mutex::new(Acquisition::new(em.clone())),
            em,
            mock: None,
        }
    }

    async fn configure(&self, config: &AlbaEmConfig) -> Result<()> {
        let mut acquisition = self.acquisition.lock().await;
        acquisition.set_trigger_input(config.trigger_input.clone());
        acquisition.set_points_per_step(config.points_per_step)?;
        for (channel, text) in config.formula_channels()? {
            acquisition.set_formula(channel, text)?;
        }
        drop(acquisition);

        if let Some(mode) = &config.acquisition_mode {
            self.em
                .set_acquisition_mode(mode)
                .await
                .with_context(|| format!("Failed to set acquisition mode '{mode}'"))?;
        }
        Ok(())
    }

    async fn validate_connection(&self) -> Result<String> {
        let idn = self.em.idn().await.context("Em# did not answer *IDN?")?;
        tracing::debug!("Validated connection: {}", idn);
        Ok(idn)
    }

    /// Command layer, for settings not covered by the capability traits.
    pub fn em(&self) -> &Em2 {
        &self.em
    }

    /// Simulated device, when built in mock mode.
    pub fn mock(&self) -> Option<&MockEm2> {
        self.mock.as_ref()
    }

    /// Snapshot of the current session counters.
    pub async fn session(&self) -> AcquisitionSession {
        self.acquisition.lock().await.session().clone()
    }

    /// Points per start for single-repetition hardware scans.
    pub async fn points_per_step(&self) -> u64 {
        self.acquisition.lock().await.points_per_step()
    }

    /// Set the points per step. Zero is rejected.
    pub async fn set_points_per_step(&self, points: u64) -> Result<()> {
        self.acquisition.lock().await.set_points_per_step(points)?;
        Ok(())
    }

    /// Trigger input used by hardware synchronizations.
    pub async fn trigger_input(&self) -> String {
        self.acquisition.lock().await.trigger_input().to_string()
    }

    /// Select the trigger input; it must be one of [`TRIGGER_INPUTS`].
    pub async fn set_trigger_input(&self, input: &str) -> Result<()> {
        if !TRIGGER_INPUTS.contains(&input) {
            return Err(DaqError::Configuration(format!("unknown trigger input '{input}'")).into());
        }
        self.acquisition.lock().await.set_trigger_input(input);
        Ok(())
    }

    /// Acquisition mode of the device (`ACQU:MODE?`).
    pub async fn acquisition_mode(&self) -> Result<String> {
        Ok(self.em.acquisition_mode().await?)
    }

    /// Set the acquisition mode of the device.
    pub async fn set_acquisition_mode(&self, mode: &str) -> Result<()> {
        Ok(self.em.set_acquisition_mode(mode).await?)
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

#[async_trait]
impl MultiChannelAcquisition for AlbaEmDriver {
    async fn set_synchronization(&self, synchronization: Synchronization) -> Result<()> {
        self.acquisition
            .lock()
            .await
            .set_synchronization(synchronization);
        Ok(())
    }

    async fn synchronization(&self) -> Result<Synchronization> {
        Ok(self.acquisition.lock().await.synchronization())
    }

    async fn prepare(
        &self,
        integration_time: f64,
        repetitions: u64,
        latency: f64,
        nb_starts: u64,
    ) -> Result<()> {
        self.acquisition
            .lock()
            .await
            .prepare(integration_time, repetitions, latency, nb_starts)
            .await?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.acquisition.lock().await.start().await?;
        Ok(())
    }

    async fn read(&self) -> Result<ChannelReadout> {
        Ok(self.acquisition.lock().await.read().await?)
    }

    async fn status(&self) -> Result<(AcquisitionState, String)> {
        Ok(self.acquisition.lock().await.status().await)
    }

    async fn abort(&self) -> Result<()> {
        self.acquisition.lock().await.abort().await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelControl for AlbaEmDriver {
    fn channel_count(&self) -> usize {
        CHANNEL_COUNT
    }

    async fn range(&self, channel: usize) -> Result<String> {
        Ok(self.em.channel(channel)?.range().await?)
    }

    async fn set_range(&self, channel: usize, range: &str) -> Result<()> {
        self.em.channel(channel)?.set_range(range).await?;
        Ok(())
    }

    async fn inversion(&self, channel: usize) -> Result<bool> {
        Ok(self.em.channel(channel)?.inversion().await?)
    }

    async fn set_inversion(&self, channel: usize, inverted: bool) -> Result<()> {
        self.em.channel(channel)?.set_inversion(inverted).await?;
        Ok(())
    }

    async fn instant_current(&self, channel: usize) -> Result<f64> {
        Ok(self.em.channel(channel)?.current().await?)
    }

    async fn formula(&self, channel: usize) -> Result<String> {
        let acquisition = self.acquisition.lock().await;
        Ok(acquisition.formula(channel)?.text().to_string())
    }

    async fn set_formula(&self, channel: usize, formula: &str) -> Result<()> {
        self.acquisition.lock().await.set_formula(channel, formula)?;
        Ok(())
    }
}

// =============================================================================
// AlbaEmFactory
// =============================================================================

/// Factory for creating Em# driver instances.
///
/// Register this factory with the DeviceRegistry to enable automatic
/// device creation from TOML configuration.
pub struct AlbaEmFactory;

/// Static capabilities for the Em# driver
static ALBAEM_CAPABILITIES: &[Capability] = &[
    Capability::MultiChannelAcquisition,
    Capability::ChannelControl,
];

impl DriverFactory for AlbaEmFactory {
    fn driver_type(&self) -> &'static str {
        "albaem2"
    }

    fn name(&self) -> &'static str {
        "ALBA Em# Electrometer"
    }

    fn capabilities(&self) -> &'static [Capability] {
        ALBAEM_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: AlbaEmConfig = config
            .clone()
            .try_into()
            .context("Invalid Em# config")?;
        cfg.validate()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: AlbaEmConfig = config.try_into().context("Invalid Em# config")?;
            cfg.validate()?;

            let driver = AlbaEmDriver::new_async(&cfg).await?;
            let identification = driver.validate_connection().await?;

            Ok(DeviceComponents::new()
                .with_acquisition(driver.clone())
                .with_channel_control(driver)
                .with_metadata(DeviceMetadata {
                    identification: Some(identification),
                    measurement_units: Some("A".to_string()),
                    channel_names: (1..=CHANNEL_COUNT).map(channel_name).collect(),
                    min_integration_time: Some(MIN_INTEGRATION_TIME),
                }))
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
