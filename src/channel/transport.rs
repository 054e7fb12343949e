use std::fmt;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use uuid::Uuid;

use crate::config::{self, AppConfig};
use crate::logging::{LogLevel, Logger};
use crate::shutdown::ShutdownSignal;
use crate::wire::codec::WireCodec;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Timing knobs shared by every channel of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    /// `None` waits for replies and peers until shutdown.
    pub reply_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from(&config::TransportConfig::default())
    }
}

impl From<&config::TransportConfig> for TransportSettings {
    fn from(value: &config::TransportConfig) -> Self {
        let optional = |millis: u64| (millis > 0).then(|| Duration::from_millis(millis));
        Self {
            connect_timeout: Duration::from_millis(value.connect_timeout_ms),
            poll_interval: Duration::from_millis(value.poll_interval_ms).max(MIN_POLL_INTERVAL),
            reply_timeout: optional(value.reply_timeout_ms),
            write_timeout: optional(value.write_timeout_ms),
        }
    }
}

impl TransportSettings {
    /// Connect attempts made from a polling loop never outlast one poll.
    pub fn poll_connect_timeout(&self) -> Duration {
        self.connect_timeout.min(self.poll_interval)
    }
}

/// Everything a channel needs from its surroundings, passed in explicitly.
#[derive(Clone)]
pub struct TransportContext {
    settings: TransportSettings,
    codec: WireCodec,
    shutdown: ShutdownSignal,
    logger: Arc<Logger>,
}

impl TransportContext {
    pub fn new(
        settings: TransportSettings,
        codec: WireCodec,
        shutdown: ShutdownSignal,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            settings,
            codec,
            shutdown,
            logger,
        }
    }

    pub fn from_app_config(app_config: &AppConfig, shutdown: ShutdownSignal, logger: Arc<Logger>) -> Self {
        Self::new(
            TransportSettings::from(&app_config.transport),
            WireCodec::from_app_config(app_config),
            shutdown,
            logger,
        )
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn codec(&self) -> &WireCodec {
        &self.codec
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub(crate) fn reply_deadline(&self) -> Option<Instant> {
        self.settings.reply_timeout.map(|timeout| Instant::now() + timeout)
    }
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportContext")
            .field("settings", &self.settings)
            .field("max_frame_size_bytes", &self.codec.max_frame_size_bytes())
            .field("shutdown", &self.shutdown.is_triggered())
            .finish()
    }
}

/// Which side of the conversation opens the socket. Fixed per channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindRole {
    Listen,
    Dial,
}

impl fmt::Display for BindRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listen => write!(f, "listen"),
            Self::Dial => write!(f, "dial"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub address: String,
    pub bind: BindRole,
}

impl ChannelSpec {
    pub fn listen(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            bind: BindRole::Listen,
        }
    }

    pub fn dial(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            bind: BindRole::Dial,
        }
    }
}

pub(crate) enum Endpoint {
    Listener(TcpListener),
    Dialer { address: String },
}

impl Endpoint {
    /// Listeners bind immediately so address conflicts surface at startup.
    pub(crate) fn open(spec: &ChannelSpec) -> io::Result<Self> {
        match spec.bind {
            BindRole::Listen => {
                let listener = TcpListener::bind(&spec.address)?;
                listener.set_nonblocking(true)?;
                Ok(Self::Listener(listener))
            }
            BindRole::Dial => {
                resolve_first(&spec.address)?;
                Ok(Self::Dialer {
                    address: spec.address.clone(),
                })
            }
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Listener(listener) => listener.local_addr().ok(),
            Self::Dialer { .. } => None,
        }
    }

    /// One accept or connect attempt. `Ok(None)` means no peer yet.
    pub(crate) fn try_establish(&self, connect_timeout: Duration) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self {
            Self::Listener(listener) => match listener.accept() {
                Ok(accepted) => Ok(Some(accepted)),
                Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(source) => Err(source),
            },
            Self::Dialer { address } => {
                let peer = resolve_first(address)?;
                match TcpStream::connect_timeout(&peer, connect_timeout) {
                    Ok(stream) => Ok(Some((stream, peer))),
                    Err(source) if is_not_listening(&source) => Ok(None),
                    Err(source) => Err(source),
                }
            }
        }
    }
}

fn resolve_first(address: &str) -> io::Result<SocketAddr> {
    address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("address '{address}' did not resolve"),
        )
    })
}

fn is_not_listening(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
    )
}

pub(crate) struct Connection {
    id: Uuid,
    peer: SocketAddr,
    stream: TcpStream,
}

impl Connection {
    pub(crate) fn configure(stream: TcpStream, peer: SocketAddr, ctx: &TransportContext) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(ctx.settings.poll_interval))?;
        stream.set_write_timeout(ctx.settings.write_timeout)?;
        Ok(Self {
            id: Uuid::new_v4(),
            peer,
            stream,
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn log_fields(&self) -> serde_json::Value {
        json!({"connection_id": self.id.to_string(), "peer": self.peer.to_string()})
    }
}

/// Blocking read view over a connection that gives up when shutdown is
/// signalled, when nothing arrives before `idle_deadline`, or when the
/// whole read outlasts `reply_deadline`.
///
/// Idle expiry is reported as `WouldBlock` and only applies before the first
/// byte; once a message starts it is read to completion.
pub(crate) struct CancellableReader<'a> {
    stream: &'a TcpStream,
    shutdown: &'a ShutdownSignal,
    idle_deadline: Option<Instant>,
    reply_deadline: Option<Instant>,
    consumed: usize,
}

impl<'a> CancellableReader<'a> {
    pub(crate) fn new(
        stream: &'a TcpStream,
        shutdown: &'a ShutdownSignal,
        idle_deadline: Option<Instant>,
        reply_deadline: Option<Instant>,
    ) -> Self {
        Self {
            stream,
            shutdown,
            idle_deadline,
            reply_deadline,
            consumed: 0,
        }
    }
}

impl Read for CancellableReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut stream = self.stream;
            match stream.read(buf) {
                Ok(read) => {
                    self.consumed += read;
                    return Ok(read);
                }
                Err(source)
                    if matches!(
                        source.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    if self.shutdown.is_triggered() {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "shutdown requested",
                        ));
                    }
                    let now = Instant::now();
                    if self.consumed == 0 && self.idle_deadline.is_some_and(|deadline| now >= deadline) {
                        return Err(io::ErrorKind::WouldBlock.into());
                    }
                    if self.reply_deadline.is_some_and(|deadline| now >= deadline) {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "reply timeout elapsed"));
                    }
                }
                Err(source) => return Err(source),
            }
        }
    }
}

/// Waits for a peer until one connects, `deadline` passes, or shutdown.
pub(crate) fn establish(
    endpoint: &Endpoint,
    ctx: &TransportContext,
    deadline: Option<Instant>,
) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    loop {
        if ctx.shutdown.is_triggered() {
            return Ok(None);
        }
        if let Some(established) = endpoint.try_establish(ctx.settings.connect_timeout)? {
            return Ok(Some(established));
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Ok(None);
        }
        thread::sleep(ctx.settings.poll_interval);
    }
}

/// A single attempt spread over at most one poll interval, for loops that
/// must come back and check their other duties.
pub(crate) fn poll_establish(
    endpoint: &Endpoint,
    ctx: &TransportContext,
) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    let deadline = Instant::now() + ctx.settings.poll_interval;
    let step = (ctx.settings.poll_interval / 4).max(MIN_POLL_INTERVAL);
    loop {
        if let Some(established) = endpoint.try_establish(ctx.settings.poll_connect_timeout())? {
            return Ok(Some(established));
        }
        let now = Instant::now();
        if now >= deadline || ctx.shutdown.is_triggered() {
            return Ok(None);
        }
        let pause = match endpoint {
            Endpoint::Listener(_) => step,
            Endpoint::Dialer { .. } => deadline - now,
        };
        thread::sleep(pause.min(deadline - now));
    }
}

pub(crate) fn log_connection_event(
    ctx: &TransportContext,
    level: LogLevel,
    log_context: &str,
    message: &str,
    connection: &Connection,
) {
    if ctx.logger.enabled(level) {
        ctx.logger
            .log(level, Some(log_context), message, Some(connection.log_fields()));
    }
}
