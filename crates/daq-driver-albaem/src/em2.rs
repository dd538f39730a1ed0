//! Em# command layer
//!
//! Typed accessors over the device's text commands. Every reply is checked for
//! the device error token before it is interpreted; a reply such as
//! `ERROR: invalid range` becomes [`DaqError::Device`] carrying
//! `invalid range`. Times are seconds in this API and milliseconds on the wire.
//!
//! ## Command set
//!
//! | Command | Accessor |
//! |---------|----------|
//! | `*IDN?` | [`Em2::idn`] |
//! | `ACQU:STAT?` | [`Em2::acquisition_state`] |
//! | `ACQU:TIME` | [`Em2::acquisition_time`], [`Em2::set_acquisition_time`] |
//! | `ACQU:NTRIG` | [`Em2::nb_points`], [`Em2::set_nb_points`] |
//! | `ACQU:NDAT?` | [`Em2::nb_points_ready`] |
//! | `ACQU:MEAS?` | [`Em2::read`], [`Em2::read_all`] |
//! | `ACQU:MODE` | [`Em2::acquisition_mode`], [`Em2::set_acquisition_mode`] |
//! | `ACQU:START`, `ACQU:STOP` | [`Em2::start_acquisition`], [`Em2::stop_acquisition`] |
//! | `TRIG:MODE`, `TRIG:INPU`, `TRIG:POLA`, `TRIG:DELA`, `TRIG:PREC` | trigger accessors |
//! | `TRIG:SWSE True` | [`Em2::software_trigger`] |
//! | `TMST` | [`Em2::timestamp_data`], [`Em2::set_timestamp_data`] |
//! | `CHANnn:...` | [`Channel`] |

use crate::measurement::{parse_measurement, RawMeasurement};
use crate::sockio::LineClient;
use daq_core::error::{AppResult, DaqError};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Number of measurement channels.
pub const CHANNEL_COUNT: usize = 4;

/// Prefix the device puts in front of rejected requests.
pub const ERROR_TOKEN: &str = "ERROR";

/// Amplifier ranges, largest first.
pub const RANGES: [&str; 8] = [
    "1mA", "100uA", "10uA", "1uA", "100nA", "10nA", "1nA", "100pA",
];

/// External trigger inputs the device accepts for `TRIG:INPU`.
pub const TRIGGER_INPUTS: [&str; 14] = [
    "DIO_1",
    "DIO_2",
    "DIO_3",
    "DIO_4",
    "DIFF_IO_1",
    "DIFF_IO_2",
    "DIFF_IO_3",
    "DIFF_IO_4",
    "DIFF_IO_5",
    "DIFF_IO_6",
    "DIFF_IO_7",
    "DIFF_IO_8",
    "DIFF_IO_9",
    "TRIGGER_IN",
];

const MS_PER_SECOND: f64 = 1e3;

/// Acquisition state reported by `ACQU:STAT?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    /// Idle and ready
    On,
    /// Armed and waiting for triggers
    Running,
    /// Integrating a point
    Acquiring,
    /// Device-side failure
    Fault,
    /// Anything else the firmware reported
    Unknown(String),
}

impl DeviceState {
    /// Parse a raw state such as `STATE_ON`. The part after the first `_` is
    /// the state name; a reply without `_` is taken as the name itself.
    pub fn parse(raw: &str) -> Self {
        let name = raw.split_once('_').map_or(raw, |(_, name)| name).trim();
        match name.to_ascii_uppercase().as_str() {
            "ON" => Self::On,
            "RUNNING" => Self::Running,
            "ACQUIRING" => Self::Acquiring,
            "FAULT" => Self::Fault,
            _ => Self::Unknown(raw.trim().to_string()),
        }
    }

    /// True while an acquisition is in progress on the device.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Running | Self::Acquiring)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => f.write_str("ON"),
            Self::Running => f.write_str("RUNNING"),
            Self::Acquiring => f.write_str("ACQUIRING"),
            Self::Fault => f.write_str("FAULT"),
            Self::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Device trigger mode (`TRIG:MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerMode {
    /// Each point is triggered by `TRIG:SWSE`
    Software,
    /// Each point starts on an external edge
    Hardware,
    /// Each point lasts as long as the external gate
    Gate,
}

impl TriggerMode {
    /// Wire value for `TRIG:MODE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Software => "SOFTWARE",
            Self::Hardware => "HARDWARE",
            Self::Gate => "GATE",
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerMode {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SOFTWARE" => Ok(Self::Software),
            "HARDWARE" => Ok(Self::Hardware),
            "GATE" => Ok(Self::Gate),
            other => Err(DaqError::Parse(format!("unknown trigger mode '{other}'"))),
        }
    }
}

/// A batch of settings written in one pipelined exchange.
///
/// ```rust,ignore
/// let setup = Setup::new()
///     .acquisition_time(0.1)
///     .nb_points(10)
///     .trigger_mode(TriggerMode::Software)
///     .timestamp_data(false);
/// em.apply(&setup).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct Setup {
    commands: Vec<String>,
}

impl Setup {
    /// Empty setup.
    pub fn new() -> Self {
        Self::default()
    }

    /// `ACQU:TIME`, given in seconds.
    #[must_use]
    pub fn acquisition_time(mut self, seconds: f64) -> Self {
        self.commands
            .push(format!("ACQU:TIME {}", seconds_to_wire_ms(seconds)));
        self
    }

    /// `ACQU:NTRIG`
    #[must_use]
    pub fn nb_points(mut self, points: u64) -> Self {
        self.commands.push(format!("ACQU:NTRIG {points}"));
        self
    }

    /// `TRIG:MODE`
    #[must_use]
    pub fn trigger_mode(mut self, mode: TriggerMode) -> Self {
        self.commands.push(format!("TRIG:MODE {mode}"));
        self
    }

    /// `TRIG:INPU`
    #[must_use]
    pub fn trigger_input(mut self, input: &str) -> Self {
        self.commands.push(format!("TRIG:INPU {input}"));
        self
    }

    /// `TMST`
    #[must_use]
    pub fn timestamp_data(mut self, enabled: bool) -> Self {
        self.commands.push(format!("TMST {}", u8::from(enabled)));
        self
    }

    /// Commands in the order they will be sent.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }
}

/// Milliseconds for the wire, rounded to the microsecond.
fn seconds_to_wire_ms(seconds: f64) -> f64 {
    (seconds * MS_PER_SECOND * 1e3).round() / 1e3
}

/// Command layer over one [`LineClient`].
#[derive(Clone)]
pub struct Em2 {
    client: Arc<LineClient>,
}

impl Em2 {
    /// Command layer over `client`.
    pub fn new(client: LineClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// Underlying line client (connection control, reconnect counter).
    pub fn client(&self) -> &LineClient {
        &self.client
    }

    /// Send one command and return its reply, mapping device errors.
    pub async fn command(&self, command: &str) -> AppResult<String> {
        let reply = self.client.exchange(command).await?;
        check_reply(reply)
    }

    /// Send several commands in one exchange.
    ///
    /// All replies are consumed even when one of them is an error, so the
    /// stream stays aligned; the first device error is then returned.
    pub async fn commands<S: AsRef<str>>(&self, commands: &[S]) -> AppResult<Vec<String>> {
        let replies = self.client.exchange_many(commands).await?;
        replies.into_iter().map(check_reply).collect()
    }

    /// Write every command of a [`Setup`] in one exchange.
    pub async fn apply(&self, setup: &Setup) -> AppResult<()> {
        self.commands(setup.commands()).await.map(|_| ())
    }

    async fn query_f64(&self, command: &str) -> AppResult<f64> {
        let reply = self.command(command).await?;
        parse_number(command, &reply)
    }

    async fn query_u64(&self, command: &str) -> AppResult<u64> {
        let reply = self.command(command).await?;
        reply.parse().map_err(|_| {
            DaqError::Parse(format!("'{command}' returned '{reply}', expected an integer"))
        })
    }

    async fn query_bool(&self, command: &str) -> AppResult<bool> {
        let reply = self.command(command).await?;
        parse_flag(command, &reply)
    }

    /// Identification string (`*IDN?`).
    pub async fn idn(&self) -> AppResult<String> {
        self.command("*IDN?").await
    }

    /// Acquisition state (`ACQU:STAT?`).
    pub async fn acquisition_state(&self) -> AppResult<DeviceState> {
        self.command("ACQU:STAT?").await.map(|raw| DeviceState::parse(&raw))
    }

    /// Integration time per point, in seconds.
    pub async fn acquisition_time(&self) -> AppResult<f64> {
        Ok(self.query_f64("ACQU:TIME?").await? / MS_PER_SECOND)
    }

    /// Set the integration time per point, in seconds.
    pub async fn set_acquisition_time(&self, seconds: f64) -> AppResult<()> {
        self.apply(&Setup::new().acquisition_time(seconds)).await
    }

    /// Points the device will acquire after `ACQU:START`.
    pub async fn nb_points(&self) -> AppResult<u64> {
        self.query_u64("ACQU:NTRIG?").await
    }

    /// Points the next acquisition stores.
    pub async fn set_nb_points(&self, points: u64) -> AppResult<()> {
        self.apply(&Setup::new().nb_points(points)).await
    }

    /// Points acquired so far and available for reading.
    pub async fn nb_points_ready(&self) -> AppResult<u64> {
        self.query_u64("ACQU:NDAT?").await
    }

    /// `ACQU:MODE?`
    pub async fn acquisition_mode(&self) -> AppResult<String> {
        self.command("ACQU:MODE?").await
    }

    /// `ACQU:MODE`
    pub async fn set_acquisition_mode(&self, mode: &str) -> AppResult<()> {
        self.command(&format!("ACQU:MODE {mode}")).await.map(|_| ())
    }

    /// `TRIG:MODE?`
    pub async fn trigger_mode(&self) -> AppResult<TriggerMode> {
        self.command("TRIG:MODE?").await?.parse()
    }

    /// `TRIG:MODE`
    pub async fn set_trigger_mode(&self, mode: TriggerMode) -> AppResult<()> {
        self.apply(&Setup::new().trigger_mode(mode)).await
    }

    /// `TRIG:INPU?`
    pub async fn trigger_input(&self) -> AppResult<String> {
        self.command("TRIG:INPU?").await
    }

    /// `TRIG:INPU`
    pub async fn set_trigger_input(&self, input: &str) -> AppResult<()> {
        self.apply(&Setup::new().trigger_input(input)).await
    }

    /// `TRIG:POLA?`
    pub async fn trigger_polarity(&self) -> AppResult<String> {
        self.command("TRIG:POLA?").await
    }

    /// `TRIG:POLA`
    pub async fn set_trigger_polarity(&self, polarity: &str) -> AppResult<()> {
        self.command(&format!("TRIG:POLA {polarity}")).await.map(|_| ())
    }

    /// Delay between the trigger edge and the start of integration, in seconds.
    pub async fn trigger_delay(&self) -> AppResult<f64> {
        Ok(self.query_f64("TRIG:DELA?").await? / MS_PER_SECOND)
    }

    /// Trigger delay, in seconds.
    pub async fn set_trigger_delay(&self, seconds: f64) -> AppResult<()> {
        self.command(&format!("TRIG:DELA {}", seconds_to_wire_ms(seconds)))
            .await
            .map(|_| ())
    }

    /// `TRIG:PREC?`
    pub async fn trigger_precision(&self) -> AppResult<bool> {
        self.query_bool("TRIG:PREC?").await
    }

    /// `TRIG:PREC`
    pub async fn set_trigger_precision(&self, precise: bool) -> AppResult<()> {
        let value = if precise { "True" } else { "False" };
        self.command(&format!("TRIG:PREC {value}")).await.map(|_| ())
    }

    /// Issue one software trigger.
    pub async fn software_trigger(&self) -> AppResult<()> {
        self.command("TRIG:SWSE True").await.map(|_| ())
    }

    /// Whether the device timestamps its samples.
    pub async fn timestamp_data(&self) -> AppResult<bool> {
        self.query_bool("TMST?").await
    }

    /// Enable timestamps in measurement replies.
    pub async fn set_timestamp_data(&self, enabled: bool) -> AppResult<()> {
        self.apply(&Setup::new().timestamp_data(enabled)).await
    }

    /// Arm the device, optionally firing the first software trigger at once.
    pub async fn start_acquisition(&self, soft_trigger: bool) -> AppResult<()> {
        let command = if soft_trigger {
            "ACQU:START SWTRIG"
        } else {
            "ACQU:START"
        };
        self.command(command).await.map(|_| ())
    }

    /// Stop the acquisition (`ACQU:STOP`).
    pub async fn stop_acquisition(&self) -> AppResult<()> {
        self.command("ACQU:STOP").await.map(|_| ())
    }

    /// Read `count` points starting at the 0-based point `start_index`.
    ///
    /// The device addresses the point *before* the first one returned, so
    /// this sends `ACQU:MEAS? {start_index-1},{count}`.
    pub async fn read(&self, start_index: u64, count: u64) -> AppResult<RawMeasurement> {
        let before = i64::try_from(start_index)
            .map_err(|_| DaqError::Configuration(format!("read index {start_index} is out of range")))?
            - 1;
        let reply = self
            .command(&format!("ACQU:MEAS? {before},{count}"))
            .await?;
        parse_measurement(&reply)
    }

    /// Read every point currently available.
    pub async fn read_all(&self) -> AppResult<RawMeasurement> {
        let ready = self.nb_points_ready().await?;
        self.read(0, ready).await
    }

    /// Front-end of channel `number` (1-based).
    ///
    /// # Errors
    /// [`DaqError::Configuration`] if `number` is not in `1..=CHANNEL_COUNT`.
    pub fn channel(&self, number: usize) -> AppResult<Channel<'_>> {
        if !(1..=CHANNEL_COUNT).contains(&number) {
            return Err(DaqError::Configuration(format!(
                "channel {number} does not exist (valid: 1..={CHANNEL_COUNT})"
            )));
        }
        Ok(Channel { em: self, number })
    }

    /// All channels, in order.
    pub fn channels(&self) -> impl Iterator<Item = Channel<'_>> {
        (1..=CHANNEL_COUNT).map(move |number| Channel { em: self, number })
    }

    /// Multi-line report of the device settings and every channel.
    pub async fn summary(&self) -> AppResult<String> {
        let idn = self.idn().await?;
        let timestamp = self.timestamp_data().await?;
        let state = self.acquisition_state().await?;
        let mode = self.acquisition_mode().await?;
        let time = self.acquisition_time().await?;
        let points = self.nb_points().await?;
        let ready = self.nb_points_ready().await?;
        let trigger_mode = self.trigger_mode().await?;
        let input = self.trigger_input().await?;
        let delay = self.trigger_delay().await?;
        let polarity = self.trigger_polarity().await?;
        let precise = self.trigger_precision().await?;

        let mut lines = vec![
            idn,
            format!("connection: {}:{}", self.client.host(), self.client.port()),
            format!("timestamp data: {timestamp}"),
            "Acquisition:".to_string(),
            format!("  state: {state}"),
            format!("  mode: {mode}"),
            format!("  time: {time}s"),
            format!("  nb. points: {points}"),
            format!("  nb. points ready: {ready}"),
            "Trigger:".to_string(),
            format!("  mode: {trigger_mode}"),
            format!("  input: {input}"),
            format!("  delay: {delay}s"),
            format!("  polarity: {polarity}"),
            format!("  precise: {precise}"),
        ];
        for channel in self.channels() {
            lines.push(channel.summary().await?);
        }
        Ok(lines.join("\n"))
    }
}

/// Front-end of one measurement channel.
pub struct Channel<'a> {
    em: &'a Em2,
    number: usize,
}

impl Channel<'_> {
    /// Channel number, from 1.
    pub fn number(&self) -> usize {
        self.number
    }

    /// Name used in measurement replies, e.g. `CHAN01`.
    pub fn name(&self) -> String {
        channel_name(self.number)
    }

    /// Amplifier range, one of [`RANGES`].
    pub async fn range(&self) -> AppResult<String> {
        self.em
            .command(&format!("CHAN{:02}:CABO:RANGE?", self.number))
            .await
    }

    /// Set the amplifier range.
    pub async fn set_range(&self, range: &str) -> AppResult<()> {
        self.em
            .command(&format!("CHAN{:02}:CABO:RANGE {range}", self.number))
            .await
            .map(|_| ())
    }

    /// Digital inversion (`CABO:INVE?`).
    pub async fn inversion(&self) -> AppResult<bool> {
        let command = format!("CHAN{:02}:CABO:INVE?", self.number);
        let reply = self.em.command(&command).await?;
        parse_flag(&command, &reply)
    }

    /// Enable or disable digital inversion.
    pub async fn set_inversion(&self, inverted: bool) -> AppResult<()> {
        let value = if inverted { "On" } else { "Off" };
        self.em
            .command(&format!("CHAN{:02}:CABO:INVE {value}", self.number))
            .await
            .map(|_| ())
    }

    /// Instantaneous current reading.
    pub async fn current(&self) -> AppResult<f64> {
        self.em
            .query_f64(&format!("CHAN{:02}:INSC?", self.number))
            .await
    }

    /// Instantaneous voltage reading.
    pub async fn voltage(&self) -> AppResult<f64> {
        self.em
            .query_f64(&format!("CHAN{:02}:INSV?", self.number))
            .await
    }

    /// One-line description of the channel front-end.
    pub async fn summary(&self) -> AppResult<String> {
        let range = self.range().await?;
        let inverted = self.inversion().await?;
        Ok(format!("{}: range={range} inverted={inverted}", self.name()))
    }
}

/// Name of channel `number` in measurement replies.
pub fn channel_name(number: usize) -> String {
    format!("CHAN{number:02}")
}

/// Map a reply carrying the error token to [`DaqError::Device`].
pub(crate) fn check_reply(reply: String) -> AppResult<String> {
    match reply.strip_prefix(ERROR_TOKEN) {
        Some(rest) => {
            let message = rest.trim_start_matches(':').trim();
            tracing::debug!("Em# rejected request: {}", message);
            Err(DaqError::Device(message.to_string()))
        }
        None => Ok(reply),
    }
}

fn parse_number(command: &str, reply: &str) -> AppResult<f64> {
    reply.parse().map_err(|_| {
        DaqError::Parse(format!("'{command}' returned '{reply}', expected a number"))
    })
}

fn parse_flag(command: &str, reply: &str) -> AppResult<bool> {
    match reply.to_ascii_uppercase().as_str() {
        "ON" | "TRUE" | "1" => Ok(true),
        "OFF" | "FALSE" | "0" => Ok(false),
        _ => Err(DaqError::Parse(format!(
            "'{command}' returned '{reply}', expected a boolean"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEm2;

    #[test]
    fn test_device_state_parse() {
        assert_eq!(DeviceState::parse("STATE_ON"), DeviceState::On);
        assert_eq!(DeviceState::parse("STATE_RUNNING"), DeviceState::Running);
        assert_eq!(DeviceState::parse("STATE_ACQUIRING"), DeviceState::Acquiring);
        assert_eq!(DeviceState::parse("STATE_FAULT"), DeviceState::Fault);
        assert_eq!(
            DeviceState::parse("STATE_MOVING"),
            DeviceState::Unknown("STATE_MOVING".into())
        );
        assert!(DeviceState::Running.is_busy());
        assert!(!DeviceState::On.is_busy());
    }

    #[test]
    fn test_check_reply_strips_error_token() {
        let err = check_reply("ERROR: invalid range".into()).unwrap_err();
        assert!(matches!(&err, DaqError::Device(msg) if msg == "invalid range"));
        assert_eq!(err.to_string(), "invalid range");
        assert!(!err.is_transport());

        assert_eq!(check_reply("1mA".into()).unwrap(), "1mA");
    }

    #[test]
    fn test_setup_commands() {
        let setup = Setup::new()
            .acquisition_time(1.1)
            .nb_points(10)
            .trigger_mode(TriggerMode::Gate)
            .trigger_input("DIFF_IO_3")
            .timestamp_data(false);

        assert_eq!(
            setup.commands(),
            [
                "ACQU:TIME 1100",
                "ACQU:NTRIG 10",
                "TRIG:MODE GATE",
                "TRIG:INPU DIFF_IO_3",
                "TMST 0",
            ]
        );
        assert_eq!(Setup::new().acquisition_time(1e-4).commands(), ["ACQU:TIME 0.1"]);
    }

    #[tokio::test]
    async fn test_time_is_seconds_in_api() {
        let mock = MockEm2::start().await.unwrap();
        let em = Em2::new(mock.line_client());

        em.set_acquisition_time(0.25).await.unwrap();
        assert!(mock.command_log().await.contains(&"ACQU:TIME 250".to_string()));
        assert!((em.acquisition_time().await.unwrap() - 0.25).abs() < 1e-12);

        em.set_trigger_delay(0.002).await.unwrap();
        assert!((em.trigger_delay().await.unwrap() - 0.002).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_channel_round_trip() {
        let mock = MockEm2::start().await.unwrap();
        let em = Em2::new(mock.line_client());
        let channel = em.channel(2).unwrap();

        channel.set_range("10nA").await.unwrap();
        assert_eq!(channel.range().await.unwrap(), "10nA");

        channel.set_inversion(true).await.unwrap();
        assert!(channel.inversion().await.unwrap());
        assert!(mock
            .command_log()
            .await
            .contains(&"CHAN02:CABO:INVE On".to_string()));

        assert_eq!(
            channel.summary().await.unwrap(),
            "CHAN02: range=10nA inverted=true"
        );
    }

    #[tokio::test]
    async fn test_invalid_range_is_device_error() {
        let mock = MockEm2::start().await.unwrap();
        let em = Em2::new(mock.line_client());

        let err = em.channel(1).unwrap().set_range("3A").await.unwrap_err();
        assert!(matches!(&err, DaqError::Device(msg) if msg == "invalid range"));
        assert_eq!(em.client().reconnect_count(), 0);
    }

    #[test]
    fn test_channel_index_bounds() {
        let em = Em2::new(LineClient::new("127.0.0.1", 1));
        assert!(matches!(em.channel(0), Err(DaqError::Configuration(_))));
        assert!(matches!(em.channel(5), Err(DaqError::Configuration(_))));
        assert_eq!(em.channel(4).unwrap().name(), "CHAN04");
        assert_eq!(em.channels().count(), CHANNEL_COUNT);
    }

    #[tokio::test]
    async fn test_read_addresses_point_before_start() {
        let mock = MockEm2::start().await.unwrap();
        mock.load_points((1..=8u8).map(|i| [f64::from(i); 4]).collect())
            .await;
        let em = Em2::new(mock.line_client());

        let data = em.read(5, 3).await.unwrap();
        assert_eq!(data["CHAN01"], vec![6.0, 7.0, 8.0]);
        assert!(mock
            .command_log()
            .await
            .contains(&"ACQU:MEAS? 4,3".to_string()));

        let all = em.read_all().await.unwrap();
        assert_eq!(all["CHAN04"].len(), 8);
        assert!(mock
            .command_log()
            .await
            .contains(&"ACQU:MEAS? -1,8".to_string()));
    }

    #[tokio::test]
    async fn test_summary_lists_channels() {
        let mock = MockEm2::start().await.unwrap();
        let em = Em2::new(mock.line_client());

        let summary = em.summary().await.unwrap();
        assert!(summary.starts_with("ALBA Em#"));
        assert!(summary.contains("state: ON"));
        assert!(summary.contains("CHAN04: range=1mA inverted=false"));
    }
}
