//! Acquisition orchestration
//!
//! Drives one Em# through prepare / start / read / status / abort sessions on
//! behalf of a scan host.
//!
//! ## Session model
//!
//! `prepare` configures the device for `points_per_start * nb_starts` points
//! and arms it with `ACQU:START`. Each `start` then opens a window of
//! `points_per_start` points: in the software synchronizations it fires one
//! `TRIG:SWSE`, in the hardware ones it just waits for external edges.
//! `read` pulls whatever became available since the previous read, applies the
//! per-channel calibration formulas, and synthesizes the time series from the
//! integration time. `status` reports `ACQUIRING` until the current start has
//! delivered all of its points.
//!
//! ```text
//!  prepare        start          (all points of the start read)
//! Idle ─────> Armed ─────> Acquiring ──────────────────────> Idle
//!   ^                          │
//!   └──────── abort ───────────┘
//! ```
//!
//! A device that reports `FAULT`, an unrecognized state, or cannot be reached
//! surfaces as [`AcquisitionState::Fault`] from `status`.

use crate::em2::{DeviceState, Em2, Setup, TriggerMode, CHANNEL_COUNT};
use crate::formula::CalibrationFormula;
use crate::measurement::{channel_number, RawMeasurement};
use daq_core::capabilities::{AcquisitionState, ChannelReadout, Synchronization};
use daq_core::error::{AppResult, DaqError};
use std::collections::BTreeMap;

/// Shortest integration time the device accepts, in seconds. Shorter requests
/// are raised to this value.
pub const MIN_INTEGRATION_TIME: f64 = 1e-4;

/// Default external trigger input.
pub const DEFAULT_TRIGGER_INPUT: &str = "DIO_1";

/// How points of one start are clocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerPlan {
    /// One `TRIG:SWSE` per start, one point per start
    Software,
    /// External edges or gates on `input`
    External { mode: TriggerMode, input: String },
}

/// Resolved shape of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionPlan {
    /// How points are clocked
    pub trigger: TriggerPlan,
    /// Points each start produces
    pub points_per_start: u64,
    /// Starts in the session
    pub nb_starts: u64,
}

impl AcquisitionPlan {
    /// Resolve the host's request into a plan.
    ///
    /// Software synchronizations always take one point per start. Hardware
    /// synchronizations take `repetitions` points per start, except that a
    /// request for exactly one repetition is replaced by `points_per_step`.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] for the `*Start` synchronizations and for
    /// zero starts or repetitions.
    pub fn configure(
        synchronization: Synchronization,
        repetitions: u64,
        nb_starts: u64,
        points_per_step: u64,
        trigger_input: &str,
    ) -> AppResult<Self> {
        if nb_starts == 0 {
            return Err(DaqError::Configuration(
                "number of starts must be at least 1".into(),
            ));
        }

        if synchronization.is_start() {
            return Err(DaqError::Configuration(format!(
                "{synchronization} synchronization is not supported"
            )));
        }

        let external = |mode: TriggerMode| -> AppResult<(TriggerPlan, u64)> {
            let points = match repetitions {
                0 => {
                    return Err(DaqError::Configuration(
                        "repetitions must be at least 1".into(),
                    ))
                }
                1 => points_per_step.max(1),
                n => n,
            };
            let plan = TriggerPlan::External {
                mode,
                input: trigger_input.to_string(),
            };
            Ok((plan, points))
        };

        let (trigger, points_per_start) = if synchronization.is_software() {
            (TriggerPlan::Software, 1)
        } else if synchronization == Synchronization::HardwareGate {
            external(TriggerMode::Gate)?
        } else {
            external(TriggerMode::Hardware)?
        };

        Ok(Self {
            trigger,
            points_per_start,
            nb_starts,
        })
    }

    /// Points the device is configured for (`ACQU:NTRIG`).
    pub fn total_points(&self) -> u64 {
        self.points_per_start.saturating_mul(self.nb_starts)
    }

    /// Device trigger mode implementing the plan.
    pub fn trigger_mode(&self) -> TriggerMode {
        match &self.trigger {
            TriggerPlan::Software => TriggerMode::Software,
            TriggerPlan::External { mode, .. } => *mode,
        }
    }
}

/// Counters of the current session. Reset by every `prepare`.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionSession {
    /// Seconds per point after clamping
    pub integration_time: f64,
    /// `None` until a `prepare` armed the device
    pub plan: Option<AcquisitionPlan>,
    /// Starts issued so far
    pub starts: u64,
    /// Device index of the next point to read
    pub last_read_index: u64,
    /// Points of the current start handed to the host
    pub points_read_per_start: u64,
    /// Points that arrived ahead of the start they belong to
    pub surplus: u64,
    /// Points handed to the host over the whole session
    pub points_delivered: u64,
    /// Set by `abort`; cleared by the next `prepare`
    pub aborted: bool,
}

impl AcquisitionSession {
    fn new(integration_time: f64, plan: AcquisitionPlan) -> Self {
        Self {
            integration_time,
            plan: Some(plan),
            ..Self::default()
        }
    }

    /// Points each start produces, 0 before `prepare`.
    pub fn points_per_start(&self) -> u64 {
        self.plan.as_ref().map_or(0, |p| p.points_per_start)
    }

    /// Points the session will produce in total.
    pub fn points_expected(&self) -> u64 {
        self.plan.as_ref().map_or(0, AcquisitionPlan::total_points)
    }

    /// The current start has delivered every point.
    pub fn start_complete(&self) -> bool {
        self.points_read_per_start >= self.points_per_start()
    }

    /// Points of the current start still outstanding.
    fn outstanding(&self) -> bool {
        self.starts > 0 && !self.start_complete()
    }
}

/// Clamp a requested integration time to what the device can do.
///
/// # Errors
/// [`DaqError::Configuration`] for NaN or infinite times.
pub fn clamp_integration_time(seconds: f64) -> AppResult<f64> {
    if !seconds.is_finite() {
        return Err(DaqError::Configuration(format!(
            "integration time must be finite, got {seconds}"
        )));
    }
    if seconds < MIN_INTEGRATION_TIME {
        tracing::debug!(
            requested = seconds,
            "Raising integration time to {} s",
            MIN_INTEGRATION_TIME
        );
        return Ok(MIN_INTEGRATION_TIME);
    }
    Ok(seconds)
}

/// Acquisition orchestrator for one Em#.
///
/// Not internally synchronized; the driver wraps it in a mutex.
pub struct Acquisition {
    em: Em2,
    synchronization: Synchronization,
    points_per_step: u64,
    trigger_input: String,
    formulas: [CalibrationFormula; CHANNEL_COUNT],
    session: AcquisitionSession,
    phase: AcquisitionState,
    /// Points fetched by `status` that `read` has not handed out yet
    pending: ChannelReadout,
}

impl Acquisition {
    /// Orchestrator over `em` with identity formulas and software-trigger synchronization.
    pub fn new(em: Em2) -> Self {
        Self {
            em,
            synchronization: Synchronization::default(),
            points_per_step: 1,
            trigger_input: DEFAULT_TRIGGER_INPUT.to_string(),
            formulas: Default::default(),
            session: AcquisitionSession::default(),
            phase: AcquisitionState::Idle,
            pending: ChannelReadout::default(),
        }
    }

    /// Command layer.
    pub fn em(&self) -> &Em2 {
        &self.em
    }

    /// Counters of the current session.
    pub fn session(&self) -> &AcquisitionSession {
        &self.session
    }

    /// Synchronization used by the next `prepare`.
    pub fn synchronization(&self) -> Synchronization {
        self.synchronization
    }

    /// Takes effect at the next `prepare`.
    pub fn set_synchronization(&mut self, synchronization: Synchronization) {
        self.synchronization = synchronization;
    }

    /// Points per start requested for single-repetition hardware scans.
    pub fn points_per_step(&self) -> u64 {
        self.points_per_step
    }

    /// Set the points per step.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] for zero.
    pub fn set_points_per_step(&mut self, points: u64) -> AppResult<()> {
        if points == 0 {
            return Err(DaqError::Configuration(
                "points per step must be at least 1".into(),
            ));
        }
        self.points_per_step = points;
        Ok(())
    }

    /// Trigger input used by hardware synchronizations.
    pub fn trigger_input(&self) -> &str {
        &self.trigger_input
    }

    /// External input used by the hardware synchronizations.
    pub fn set_trigger_input(&mut self, input: impl Into<String>) {
        self.trigger_input = input.into();
    }

    fn formula_slot(&self, channel: usize) -> AppResult<usize> {
        if (1..=CHANNEL_COUNT).contains(&channel) {
            Ok(channel - 1)
        } else {
            Err(DaqError::Configuration(format!(
                "channel {channel} has no calibration formula (valid: 1..={CHANNEL_COUNT})"
            )))
        }
    }

    /// Calibration formula of channel `channel` (1-based).
    pub fn formula(&self, channel: usize) -> AppResult<&CalibrationFormula> {
        let slot = self.formula_slot(channel)?;
        Ok(&self.formulas[slot])
    }

    /// Compile and install a calibration formula. The previous formula stays
    /// in place if compilation fails.
    pub fn set_formula(&mut self, channel: usize, text: &str) -> AppResult<()> {
        let slot = self.formula_slot(channel)?;
        let formula = CalibrationFormula::compile(text)?;
        tracing::debug!(channel, formula = formula.text(), "Calibration formula set");
        self.formulas[slot] = formula;
        Ok(())
    }

    /// Configure and arm a new session.
    ///
    /// Requests are validated before anything is sent; a rejected request
    /// leaves the previous session untouched. Once the device is being
    /// reconfigured the previous session is gone, and the new one exists only
    /// if `ACQU:START` succeeds.
    pub async fn prepare(
        &mut self,
        integration_time: f64,
        repetitions: u64,
        latency: f64,
        nb_starts: u64,
    ) -> AppResult<()> {
        let integration_time = clamp_integration_time(integration_time)?;
        let plan = AcquisitionPlan::configure(
            self.synchronization,
            repetitions,
            nb_starts,
            self.points_per_step,
            &self.trigger_input,
        )?;

        // The device is about to be reconfigured; until it is armed again there
        // is no session to start
        self.session = AcquisitionSession::default();
        self.pending = ChannelReadout::default();
        self.phase = AcquisitionState::Idle;

        let state = self.em.acquisition_state().await?;
        if state.is_busy() {
            tracing::warn!(%state, "Device still acquiring from a previous session, stopping it");
            self.em.stop_acquisition().await?;
        }

        let mut setup = Setup::new()
            .acquisition_time(integration_time)
            .nb_points(plan.total_points())
            .trigger_mode(plan.trigger_mode());
        if let TriggerPlan::External { input, .. } = &plan.trigger {
            setup = setup.trigger_input(input);
        }
        setup = setup.timestamp_data(false);
        self.em.apply(&setup).await?;

        self.em.start_acquisition(false).await?;
        self.session = AcquisitionSession::new(integration_time, plan.clone());
        self.phase = AcquisitionState::Armed;

        tracing::info!(
            synchronization = %self.synchronization,
            integration_time,
            latency,
            points_per_start = plan.points_per_start,
            nb_starts = plan.nb_starts,
            "Acquisition prepared"
        );
        Ok(())
    }

    /// Begin the next start of the prepared session.
    pub async fn start(&mut self) -> AppResult<()> {
        let Some(plan) = self.session.plan.clone() else {
            return Err(DaqError::Configuration(
                "start requested before prepare".into(),
            ));
        };
        if self.session.aborted {
            return Err(DaqError::Configuration(
                "session was aborted, prepare a new one".into(),
            ));
        }
        if self.session.starts >= plan.nb_starts {
            return Err(DaqError::Configuration(format!(
                "all {} starts of the session were issued, prepare a new one",
                plan.nb_starts
            )));
        }
        if self.session.outstanding() {
            tracing::warn!(
                read = self.session.points_read_per_start,
                expected = plan.points_per_start,
                "Starting before the previous start delivered all its points"
            );
        }

        let carried = self.session.surplus.min(plan.points_per_start);
        self.session.surplus -= carried;
        self.session.points_read_per_start = carried;
        if carried > 0 {
            tracing::debug!(carried, "Points of this start were read ahead");
        }
        if plan.trigger == TriggerPlan::Software {
            self.em.software_trigger().await?;
        } else {
            tracing::debug!("Waiting for external trigger");
        }
        self.session.starts += 1;
        self.phase = AcquisitionState::Acquiring;
        Ok(())
    }

    /// Hand out every point not delivered before.
    ///
    /// Returns an empty readout when nothing new is available or the session
    /// was aborted. Calling it repeatedly never returns a point twice.
    pub async fn read(&mut self) -> AppResult<ChannelReadout> {
        let fresh = self.read_new(None).await?;
        let mut readout = std::mem::take(&mut self.pending);
        readout.append(fresh);
        Ok(readout)
    }

    async fn read_new(&mut self, known_state: Option<&DeviceState>) -> AppResult<ChannelReadout> {
        if self.session.aborted {
            tracing::debug!("Acquisition aborted, nothing to read");
            return Ok(ChannelReadout::default());
        }
        if self.session.plan.is_none() {
            return Ok(ChannelReadout::default());
        }

        let data_ready = self.em.nb_points_ready().await?;
        let last = self.session.last_read_index;
        if data_ready <= last {
            if self.session.outstanding() {
                let state = match known_state {
                    Some(state) => state.clone(),
                    None => self.em.acquisition_state().await?,
                };
                if state == DeviceState::On {
                    tracing::warn!(
                        data_ready,
                        last_read_index = last,
                        "Data not ready while state is idle"
                    );
                }
            }
            return Ok(ChannelReadout::default());
        }

        let requested = data_ready - last;
        let raw = self.em.read(last, requested).await?;
        let readout = self.calibrate(raw)?;

        let delivered = readout.len() as u64;
        if delivered != requested {
            tracing::warn!(
                requested,
                delivered,
                "Device returned a different number of points than announced"
            );
        }
        self.record_delivery(delivered);
        Ok(readout)
    }

    /// Attribute delivered points to the current start; the rest belongs to
    /// later starts (external edges can run ahead of `start`).
    fn record_delivery(&mut self, delivered: u64) {
        let session = &mut self.session;
        session.last_read_index += delivered;
        session.points_delivered += delivered;

        let per_start = session.points_per_start();
        let room = if session.starts == 0 {
            0
        } else {
            per_start.saturating_sub(session.points_read_per_start)
        };
        let current = delivered.min(room);
        session.points_read_per_start += current;
        session.surplus += delivered - current;

        if session.points_delivered > session.points_expected() {
            tracing::warn!(
                delivered = session.points_delivered,
                expected = session.points_expected(),
                "More points than the session was configured for"
            );
        }
    }

    /// Apply formulas and build the readout. Leaves `raw` samples untouched
    /// on failure; nothing is recorded as delivered.
    fn calibrate(&self, raw: RawMeasurement) -> AppResult<ChannelReadout> {
        let mut length = None;
        let mut channels = BTreeMap::new();

        for (name, samples) in raw {
            match length {
                Some(len) if len != samples.len() => {
                    return Err(DaqError::Parse(format!(
                        "channel {name} returned {} points, expected {len}",
                        samples.len()
                    )));
                }
                _ => length = Some(samples.len()),
            }

            let formula = channel_number(&name)
                .and_then(|number| number.checked_sub(1))
                .and_then(|slot| self.formulas.get(slot));
            let values = match formula {
                Some(formula) if !formula.is_identity() => formula.apply_all(&samples)?,
                _ => samples,
            };
            channels.insert(name, values);
        }

        let points = length.unwrap_or(0);
        Ok(ChannelReadout {
            time: vec![self.session.integration_time; points],
            channels,
        })
    }

    /// Current state and a status message. Never fails: transport and device
    /// problems are reported as [`AcquisitionState::Fault`].
    pub async fn status(&mut self) -> (AcquisitionState, String) {
        let device_state = match self.em.acquisition_state().await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Unable to query device state: {}", e);
                return (AcquisitionState::Fault, e.to_string());
            }
        };

        match &device_state {
            DeviceState::Fault => return (AcquisitionState::Fault, device_state.to_string()),
            DeviceState::Unknown(raw) => {
                tracing::warn!(state = %raw, "Unknown device state");
                return (
                    AcquisitionState::Fault,
                    format!("unknown device state '{raw}'"),
                );
            }
            _ => {}
        }

        let phase = self.phase;
        let state = match phase {
            AcquisitionState::Acquiring => self.acquiring_state(&device_state).await,
            AcquisitionState::Armed if self.session.aborted => AcquisitionState::Idle,
            phase => phase,
        };
        (state, device_state.to_string())
    }

    async fn acquiring_state(&mut self, device_state: &DeviceState) -> AcquisitionState {
        if self.session.aborted || self.session.start_complete() {
            return AcquisitionState::Idle;
        }
        if *device_state != DeviceState::On {
            return AcquisitionState::Acquiring;
        }

        // Device finished but points are unread: pull them now
        match self.read_new(Some(device_state)).await {
            Ok(readout) => self.pending.append(readout),
            Err(e) => {
                tracing::warn!("Opportunistic read failed: {}", e);
                return AcquisitionState::Acquiring;
            }
        }
        if self.session.start_complete() {
            AcquisitionState::Idle
        } else {
            tracing::warn!(
                read = self.session.points_read_per_start,
                expected = self.session.points_per_start(),
                "Device idle but the current start is incomplete"
            );
            AcquisitionState::Acquiring
        }
    }

    /// Stop the acquisition. Only the first call talks to the device; a failed
    /// stop can be retried.
    pub async fn abort(&mut self) -> AppResult<()> {
        if self.session.aborted {
            tracing::debug!("Abort already requested");
            return Ok(());
        }
        self.em.stop_acquisition().await?;
        self.session.aborted = true;
        self.phase = AcquisitionState::Idle;
        tracing::info!("Acquisition aborted");
        Ok(())
    }
}
