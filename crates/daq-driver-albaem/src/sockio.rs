//! Line protocol client for the Em# TCP command port
//!
//! Each request is a single text line terminated by `;\n`; each reply is a
//! single line terminated by `\n`. The device sometimes flushes stale error
//! text ahead of the real answer, separated by `;`, so only the last non-empty
//! segment of a reply is returned.
//!
//! The socket is opened lazily and guarded by one lock held for the whole
//! write/read round trip, so concurrent callers never interleave. A transport
//! failure (I/O error, timeout, peer closed) drops the socket, reconnects and
//! replays the request exactly once before giving up.

use daq_core::error::{AppResult, DaqError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::Instrument;

/// Default Em# command port
pub const DEFAULT_PORT: u16 = 5025;

/// Default per-operation timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Appended to every request
const TERMINATOR: &str = ";\n";

type Stream = BufReader<TcpStream>;

/// Transport-level failure of a single attempt.
#[derive(Debug)]
enum Fault {
    Io(std::io::Error),
    Timeout(&'static str),
    Closed,
}

impl From<std::io::Error> for Fault {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Timeout(op) => write!(f, "timed out during {op}"),
            Self::Closed => f.write_str("connection closed by device"),
        }
    }
}

/// Async line client with transparent single-retry reconnection.
pub struct LineClient {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Mutex<Option<Stream>>,
    reconnects: AtomicU64,
    span: tracing::Span,
}

impl LineClient {
    /// Create a client for `host:port`. No connection is made until the first
    /// exchange or an explicit [`open`](Self::open).
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let span = tracing::info_span!("albaem", host = %host, port);
        Self {
            host,
            port,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream: Mutex::new(None),
            reconnects: AtomicU64::new(0),
            span,
        }
    }

    /// Set the per-operation timeout (connect, write and read each).
    #[must_use]
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = duration;
        self
    }

    /// Replace the span every exchange is logged under.
    #[must_use]
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Instrument host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Instrument TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Timeout applied to every socket operation.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of times the connection was re-established after a fault.
    /// The initial connection is not counted.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// True while a socket is held.
    pub async fn is_open(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Open the connection explicitly.
    ///
    /// # Errors
    /// [`DaqError::Connection`] if a connection is already open,
    /// [`DaqError::Communication`] if the device cannot be reached.
    pub async fn open(&self) -> AppResult<()> {
        async {
            let mut slot = self.stream.lock().await;
            if slot.is_some() {
                return Err(DaqError::Connection(format!(
                    "connection to {}:{} is already open",
                    self.host, self.port
                )));
            }
            let stream = self
                .connect()
                .await
                .map_err(|fault| DaqError::communication("open", fault.to_string()))?;
            *slot = Some(stream);
            Ok(())
        }
        .instrument(self.span.clone())
        .await
    }

    /// Release the socket. Safe to call when already closed.
    pub async fn close(&self) {
        async {
            let mut slot = self.stream.lock().await;
            if Self::discard(&mut slot).await {
                tracing::info!("Connection closed");
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Send one request and return the authoritative segment of its reply.
    ///
    /// # Errors
    /// [`DaqError::Communication`] when both the attempt and its retry failed.
    pub async fn exchange(&self, command: &str) -> AppResult<String> {
        let mut replies = self.transact(&[command]).await?;
        replies
            .pop()
            .ok_or_else(|| DaqError::communication(command, "no reply received"))
    }

    /// Send several requests back to back, then read one reply per request.
    ///
    /// Replies are returned in request order. The whole batch is one critical
    /// section; on a transport fault the full batch is replayed once.
    pub async fn exchange_many<S: AsRef<str>>(&self, commands: &[S]) -> AppResult<Vec<String>> {
        let commands: Vec<&str> = commands.iter().map(AsRef::as_ref).collect();
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.transact(&commands).await
    }

    async fn transact(&self, commands: &[&str]) -> AppResult<Vec<String>> {
        let label = commands.join("; ");
        async {
            let mut slot = self.stream.lock().await;

            let first = match self.attempt(&mut slot, commands).await {
                Ok(replies) => return Ok(replies),
                Err(fault) => fault,
            };

            tracing::warn!(command = %label, error = %first, "Transport fault, reconnecting");
            Self::discard(&mut slot).await;
            let count = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;

            match self.attempt(&mut slot, commands).await {
                Ok(replies) => {
                    tracing::info!(reconnects = count, "Exchange recovered after reconnect");
                    Ok(replies)
                }
                Err(second) => {
                    Self::discard(&mut slot).await;
                    tracing::error!(command = %label, error = %second, "Exchange failed after reconnect");
                    Err(DaqError::communication(label.clone(), second.to_string()))
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn attempt(
        &self,
        slot: &mut Option<Stream>,
        commands: &[&str],
    ) -> Result<Vec<String>, Fault> {
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let stream = slot.as_mut().ok_or(Fault::Closed)?;

        let mut payload = String::new();
        for command in commands {
            tracing::debug!("Em# write: {:?}", command);
            payload.push_str(command);
            payload.push_str(TERMINATOR);
        }

        timeout(self.timeout, stream.get_mut().write_all(payload.as_bytes()))
            .await
            .map_err(|_| Fault::Timeout("write"))??;
        timeout(self.timeout, stream.get_mut().flush())
            .await
            .map_err(|_| Fault::Timeout("flush"))??;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(self.read_reply(stream).await?);
        }
        Ok(replies)
    }

    async fn read_reply(&self, stream: &mut Stream) -> Result<String, Fault> {
        let mut raw = Vec::new();
        let read = timeout(self.timeout, stream.read_until(b'\n', &mut raw))
            .await
            .map_err(|_| Fault::Timeout("read"))??;

        // EOF, or EOF in the middle of a line
        if read == 0 || raw.last() != Some(&b'\n') {
            return Err(Fault::Closed);
        }

        let text = String::from_utf8_lossy(&raw);
        let reply = authoritative_segment(&text);
        tracing::debug!("Em# reply: {:?}", reply);
        Ok(reply)
    }

    async fn connect(&self) -> Result<Stream, Fault> {
        let stream = timeout(
            self.timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| Fault::Timeout("connect"))??;

        // Requests are tiny; don't let Nagle hold them back
        stream.set_nodelay(true)?;

        tracing::info!("Connected to Em# at {}:{}", self.host, self.port);
        Ok(BufReader::new(stream))
    }

    /// Drop the held socket, if any. Returns whether one was held.
    async fn discard(slot: &mut Option<Stream>) -> bool {
        match slot.take() {
            Some(mut stream) => {
                if let Err(err) = stream.get_mut().shutdown().await {
                    tracing::debug!("Ignoring shutdown error: {}", err);
                }
                true
            }
            None => false,
        }
    }
}

/// Last non-empty `;`-separated segment of a raw reply line, trimmed.
pub(crate) fn authoritative_segment(raw: &str) -> String {
    let line = raw.trim_end_matches(['\r', '\n']);
    let mut segments = line.split(';').map(str::trim).filter(|s| !s.is_empty());
    let mut last = segments.next().unwrap_or_default();
    let mut discarded = 0usize;
    for segment in segments {
        last = segment;
        discarded += 1;
    }
    if discarded > 0 {
        tracing::debug!(discarded, "Discarded stale reply segments");
    }
    last.to_string()
}
