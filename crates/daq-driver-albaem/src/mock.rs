//! Simulated Em# on a loopback TCP socket
//!
//! Speaks the same line protocol as the hardware, so everything above the
//! socket (reconnects, framing, error-token mapping) runs unmodified against
//! it. Used by the tests and by `mock = true` driver configurations.
//!
//! The model is deliberately small: one point is produced per software trigger
//! (or per [`MockEm2::external_trigger`] in hardware modes), every point holds
//! the current per-channel value (negated for inverted channels), and the
//! device returns to `STATE_ON` once `ACQU:NTRIG` points are stored.
//!
//! Fault injection:
//! - [`drop_next`](MockEm2::drop_next): close the connection instead of replying
//! - [`stall_next`](MockEm2::stall_next): swallow the request, never reply
//! - [`error_burst`](MockEm2::error_burst): prefix the next reply with stale error text
//! - [`fail_command`](MockEm2::fail_command): reject the next matching command
//! - [`force_state`](MockEm2::force_state): override `ACQU:STAT?`

use crate::em2::{channel_name, CHANNEL_COUNT, RANGES};
use crate::sockio::LineClient;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Identification reported by the simulated device.
pub const MOCK_IDN: &str = "ALBA Em#,MOCK,00000,2.0";

/// Requests kept in the command log; older ones are discarded.
pub const LOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    On,
    Running,
}

#[derive(Debug)]
struct DeviceModel {
    acquisition_time_ms: f64,
    ntrig: u64,
    acquisition_mode: String,
    trigger_mode: String,
    trigger_input: String,
    trigger_polarity: String,
    trigger_delay_ms: f64,
    trigger_precision: bool,
    timestamp: bool,
    run_state: RunState,
    forced_state: Option<String>,
    points: Vec<[f64; CHANNEL_COUNT]>,
    values: [f64; CHANNEL_COUNT],
    ranges: [String; CHANNEL_COUNT],
    inverted: [bool; CHANNEL_COUNT],
    log: VecDeque<String>,
    connections: u64,
    drop_next: u32,
    stall_next: u32,
    burst: Option<String>,
    failures: Vec<(String, String)>,
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self {
            acquisition_time_ms: 1000.0,
            ntrig: 1,
            acquisition_mode: "CURRENT".to_string(),
            trigger_mode: "SOFTWARE".to_string(),
            trigger_input: "DIO_1".to_string(),
            trigger_polarity: "RISING".to_string(),
            trigger_delay_ms: 0.0,
            trigger_precision: false,
            timestamp: false,
            run_state: RunState::On,
            forced_state: None,
            points: Vec::new(),
            values: [1.0, 2.0, 3.0, 4.0],
            ranges: std::array::from_fn(|_| RANGES[0].to_string()),
            inverted: [false; CHANNEL_COUNT],
            log: VecDeque::new(),
            connections: 0,
            drop_next: 0,
            stall_next: 0,
            burst: None,
            failures: Vec::new(),
        }
    }
}

/// What the connection handler does with a request.
enum Action {
    Reply(String),
    Drop,
    Stall,
}

impl DeviceModel {
    fn handle(&mut self, command: &str) -> Action {
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(command.to_string());

        if self.drop_next > 0 {
            self.drop_next -= 1;
            return Action::Drop;
        }
        if self.stall_next > 0 {
            self.stall_next -= 1;
            return Action::Stall;
        }

        let reply = match self.take_failure(command) {
            Some(message) => format!("ERROR: {message}"),
            None => self.execute(command),
        };
        match self.burst.take() {
            Some(stale) => Action::Reply(format!("ERROR: {stale};{reply}")),
            None => Action::Reply(reply),
        }
    }

    fn take_failure(&mut self, command: &str) -> Option<String> {
        let index = self
            .failures
            .iter()
            .position(|(prefix, _)| command.starts_with(prefix.as_str()))?;
        Some(self.failures.remove(index).1)
    }

    fn execute(&mut self, command: &str) -> String {
        let (head, arg) = match command.split_once(' ') {
            Some((head, arg)) => (head, Some(arg.trim())),
            None => (command, None),
        };
        let head = head.to_ascii_uppercase();

        if let Some(rest) = head.strip_prefix("CHAN") {
            return self.execute_channel(rest, arg, command);
        }

        match (head.as_str(), arg) {
            ("*IDN?", None) => MOCK_IDN.to_string(),
            ("ACQU:STAT?", None) => self.state_string(),
            ("ACQU:TIME?", None) => self.acquisition_time_ms.to_string(),
            ("ACQU:TIME", Some(v)) => match v.parse() {
                Ok(ms) => {
                    self.acquisition_time_ms = ms;
                    command.to_string()
                }
                Err(_) => "ERROR: invalid time".to_string(),
            },
            ("ACQU:NTRIG?", None) => self.ntrig.to_string(),
            ("ACQU:NTRIG", Some(v)) => match v.parse() {
                Ok(n) => {
                    self.ntrig = n;
                    command.to_string()
                }
                Err(_) => "ERROR: invalid number of triggers".to_string(),
            },
            ("ACQU:NDAT?", None) => self.points.len().to_string(),
            ("ACQU:MEAS?", Some(v)) => self.measure(v),
            ("ACQU:MODE?", None) => self.acquisition_mode.clone(),
            ("ACQU:MODE", Some(v)) => {
                self.acquisition_mode = v.to_string();
                command.to_string()
            }
            ("ACQU:START", trigger) => {
                self.points.clear();
                self.run_state = RunState::Running;
                if trigger.is_some_and(|t| t.eq_ignore_ascii_case("SWTRIG")) {
                    self.acquire();
                }
                command.to_string()
            }
            ("ACQU:STOP", None) => {
                self.run_state = RunState::On;
                command.to_string()
            }
            ("TRIG:MODE?", None) => self.trigger_mode.clone(),
            ("TRIG:MODE", Some(v)) => {
                self.trigger_mode = v.to_ascii_uppercase();
                command.to_string()
            }
            ("TRIG:INPU?", None) => self.trigger_input.clone(),
            ("TRIG:INPU", Some(v)) => {
                self.trigger_input = v.to_string();
                command.to_string()
            }
            ("TRIG:POLA?", None) => self.trigger_polarity.clone(),
            ("TRIG:POLA", Some(v)) => {
                self.trigger_polarity = v.to_string();
                command.to_string()
            }
            ("TRIG:DELA?", None) => self.trigger_delay_ms.to_string(),
            ("TRIG:DELA", Some(v)) => match v.parse() {
                Ok(ms) => {
                    self.trigger_delay_ms = ms;
                    command.to_string()
                }
                Err(_) => "ERROR: invalid delay".to_string(),
            },
            ("TRIG:PREC?", None) => flag_reply(self.trigger_precision),
            ("TRIG:PREC", Some(v)) => {
                self.trigger_precision = v.eq_ignore_ascii_case("true");
                command.to_string()
            }
            ("TRIG:SWSE", Some(_)) => {
                if self.run_state != RunState::Running || self.trigger_mode != "SOFTWARE" {
                    return "ERROR: not armed for software trigger".to_string();
                }
                self.acquire();
                command.to_string()
            }
            ("TMST?", None) => flag_reply(self.timestamp),
            ("TMST", Some(v)) => {
                self.timestamp = matches!(v, "1") || v.eq_ignore_ascii_case("true");
                command.to_string()
            }
            _ => "ERROR: unknown command".to_string(),
        }
    }

    fn execute_channel(&mut self, rest: &str, arg: Option<&str>, command: &str) -> String {
        let Some((number, property)) = rest.split_once(':') else {
            return "ERROR: unknown command".to_string();
        };
        let index = match number.parse::<usize>() {
            Ok(n) if (1..=CHANNEL_COUNT).contains(&n) => n - 1,
            _ => return "ERROR: invalid channel".to_string(),
        };

        match (property, arg) {
            ("CABO:RANGE?", None) => self.ranges[index].clone(),
            ("CABO:RANGE", Some(v)) => {
                if !RANGES.contains(&v) {
                    return "ERROR: invalid range".to_string();
                }
                self.ranges[index] = v.to_string();
                command.to_string()
            }
            ("CABO:INVE?", None) => {
                let value = if self.inverted[index] { "On" } else { "Off" };
                value.to_string()
            }
            ("CABO:INVE", Some(v)) => {
                self.inverted[index] = v.eq_ignore_ascii_case("on");
                command.to_string()
            }
            ("INSC?", None) => self.sample(index).to_string(),
            ("INSV?", None) => (self.sample(index) * 1e3).to_string(),
            _ => "ERROR: unknown command".to_string(),
        }
    }

    fn state_string(&self) -> String {
        if let Some(forced) = &self.forced_state {
            return forced.clone();
        }
        match self.run_state {
            RunState::On => "STATE_ON".to_string(),
            RunState::Running => "STATE_RUNNING".to_string(),
        }
    }

    fn sample(&self, index: usize) -> f64 {
        if self.inverted[index] {
            -self.values[index]
        } else {
            self.values[index]
        }
    }

    fn acquire(&mut self) {
        if self.run_state != RunState::Running {
            return;
        }
        let point = std::array::from_fn(|i| self.sample(i));
        self.points.push(point);
        if self.points.len() as u64 >= self.ntrig {
            self.run_state = RunState::On;
        }
    }

    /// `ACQU:MEAS? before,count`: points from index `before + 1`.
    fn measure(&self, arg: &str) -> String {
        let Some((before, count)) = arg.split_once(',') else {
            return "ERROR: invalid arguments".to_string();
        };
        let (Ok(before), Ok(count)) = (before.trim().parse::<i64>(), count.trim().parse::<usize>())
        else {
            return "ERROR: invalid arguments".to_string();
        };

        let start = usize::try_from(before + 1).unwrap_or(0).min(self.points.len());
        let end = start.saturating_add(count).min(self.points.len());
        let selected = &self.points[start..end];

        let pairs: Vec<String> = (0..CHANNEL_COUNT)
            .map(|channel| {
                let samples: Vec<String> = selected
                    .iter()
                    .map(|point| format!("{:?}", point[channel]))
                    .collect();
                format!("['{}', [{}]]", channel_name(channel + 1), samples.join(", "))
            })
            .collect();
        format!("[{}]", pairs.join(", "))
    }
}

fn flag_reply(value: bool) -> String {
    let text = if value { "True" } else { "False" };
    text.to_string()
}

/// Handle to a running simulated device. The listener stops when dropped.
pub struct MockEm2 {
    addr: SocketAddr,
    model: Arc<Mutex<DeviceModel>>,
    listener: JoinHandle<()>,
}

impl MockEm2 {
    /// Bind to an ephemeral loopback port and start serving.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let model = Arc::new(Mutex::new(DeviceModel::default()));

        let accept_model = model.clone();
        let listener = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        accept_model.lock().await.connections += 1;
                        tokio::spawn(serve(socket, accept_model.clone()));
                    }
                    Err(e) => {
                        tracing::warn!("Mock Em# accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        tracing::debug!("Mock Em# listening on {}", addr);
        Ok(Self {
            addr,
            model,
            listener,
        })
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Listening IP, as a host string for [`LineClient`].
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// A fresh client for this device with a short timeout.
    pub fn line_client(&self) -> LineClient {
        LineClient::new(self.host(), self.port()).with_timeout(Duration::from_millis(300))
    }

    /// The last [`LOG_CAPACITY`] requests received, in order, without the
    /// terminator.
    pub async fn command_log(&self) -> Vec<String> {
        self.model.lock().await.log.iter().cloned().collect()
    }

    /// Number of logged requests starting with `prefix`.
    pub async fn count_commands(&self, prefix: &str) -> usize {
        self.model
            .lock()
            .await
            .log
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Forget every logged request.
    pub async fn clear_command_log(&self) {
        self.model.lock().await.log.clear();
    }

    /// Connections accepted so far.
    pub async fn connections(&self) -> u64 {
        self.model.lock().await.connections
    }

    /// Close the connection instead of answering the next `count` requests.
    pub async fn drop_next(&self, count: u32) {
        self.model.lock().await.drop_next = count;
    }

    /// Never answer the next `count` requests.
    pub async fn stall_next(&self, count: u32) {
        self.model.lock().await.stall_next = count;
    }

    /// Prefix the next reply with a stale `ERROR: <message>;` segment.
    pub async fn error_burst(&self, message: &str) {
        self.model.lock().await.burst = Some(message.to_string());
    }

    /// Answer the next command starting with `prefix` with `ERROR: <message>`.
    pub async fn fail_command(&self, prefix: &str, message: &str) {
        self.model
            .lock()
            .await
            .failures
            .push((prefix.to_string(), message.to_string()));
    }

    /// Report `state` for `ACQU:STAT?` until cleared with `None`.
    pub async fn force_state(&self, state: Option<&str>) {
        self.model.lock().await.forced_state = state.map(str::to_string);
    }

    /// Raw value channel `number` (1-based) produces for new points.
    pub async fn set_channel_value(&self, number: usize, value: f64) {
        if let Some(slot) = self.model.lock().await.values.get_mut(number.wrapping_sub(1)) {
            *slot = value;
        }
    }

    /// Replace the stored points.
    pub async fn load_points(&self, points: Vec<[f64; CHANNEL_COUNT]>) {
        self.model.lock().await.points = points;
    }

    /// Deliver `count` external trigger edges. Ignored unless the device is
    /// armed in a hardware trigger mode.
    pub async fn external_trigger(&self, count: usize) {
        let mut model = self.model.lock().await;
        if model.trigger_mode == "SOFTWARE" {
            return;
        }
        for _ in 0..count {
            model.acquire();
        }
    }

    /// Points stored on the device.
    pub async fn stored_points(&self) -> usize {
        self.model.lock().await.points.len()
    }

    /// Value of a simple setting, by its query command (e.g. `TRIG:INPU?`).
    pub async fn query(&self, command: &str) -> String {
        self.model.lock().await.execute(command)
    }
}

impl Drop for MockEm2 {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn serve(socket: TcpStream, model: Arc<Mutex<DeviceModel>>) {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim().trim_end_matches(';').trim();
        if command.is_empty() {
            continue;
        }

        let action = model.lock().await.handle(command);
        match action {
            Action::Reply(reply) => {
                if writer.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
            Action::Drop => return,
            Action::Stall => {}
        }
    }
}
