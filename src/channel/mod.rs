mod transport;

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{Shutdown, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use serde_json::json;

use crate::dispatch::panic_message;
use crate::logging::LogLevel;
use crate::wire::codec::CodecError;
use crate::wire::envelope::Envelope;

pub use transport::{BindRole, ChannelSpec, TransportContext, TransportSettings};

use transport::{CancellableReader, Connection, Endpoint};

/// Turn position of a channel. Requesters cycle `Idle -> Sent -> Idle`,
/// responders `Idle -> Received -> Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sent,
    Received,
    Closed,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Sent => "sent",
            Self::Received => "received",
            Self::Closed => "closed",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug)]
pub enum ChannelError {
    Bind {
        channel: String,
        address: String,
        source: io::Error,
    },
    MalformedEnvelope {
        channel: String,
        source: CodecError,
    },
    ProtocolViolation {
        channel: String,
        operation: &'static str,
        state: TurnState,
    },
    PeerUnavailable {
        channel: String,
        reason: String,
    },
    Closed {
        channel: String,
    },
}

impl ChannelError {
    pub fn channel(&self) -> &str {
        match self {
            Self::Bind { channel, .. }
            | Self::MalformedEnvelope { channel, .. }
            | Self::ProtocolViolation { channel, .. }
            | Self::PeerUnavailable { channel, .. }
            | Self::Closed { channel } => channel,
        }
    }

    /// The channel is `Closed` after this error and needs `recreate()`.
    pub fn requires_recreate(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation { .. } | Self::PeerUnavailable { .. } | Self::Closed { .. }
        )
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind {
                channel,
                address,
                source,
            } => write!(f, "channel '{channel}' failed to bind {address}: {source}"),
            Self::MalformedEnvelope { channel, source } => {
                write!(f, "channel '{channel}' got a malformed envelope: {source}")
            }
            Self::ProtocolViolation {
                channel,
                operation,
                state,
            } => write!(
                f,
                "channel '{channel}' cannot {operation} while {state}; channel closed"
            ),
            Self::PeerUnavailable { channel, reason } => {
                write!(f, "peer of channel '{channel}' is unavailable: {reason}")
            }
            Self::Closed { channel } => write!(f, "channel '{channel}' is closed"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } => Some(source),
            Self::MalformedEnvelope { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
enum Wait {
    /// Give up quietly if nothing starts arriving within one poll interval.
    Poll,
    /// Wait for the peer's turn, bounded only by the reply timeout.
    Reply,
}

/// Socket, connection and turn bookkeeping shared by all channel flavours.
struct Link {
    spec: ChannelSpec,
    ctx: TransportContext,
    endpoint: Endpoint,
    connection: Option<Connection>,
    state: TurnState,
    log_context: String,
}

impl Link {
    fn open(spec: ChannelSpec, ctx: TransportContext) -> Result<Self, ChannelError> {
        let endpoint = Endpoint::open(&spec).map_err(|source| ChannelError::Bind {
            channel: spec.name.clone(),
            address: spec.address.clone(),
            source,
        })?;
        let log_context = format!("channel::{}", spec.name);

        ctx.logger().log(
            LogLevel::Debug,
            Some(&log_context),
            "channel opened",
            Some(json!({
                "address": spec.address,
                "bind": spec.bind.to_string(),
                "local_addr": endpoint.local_addr().map(|addr| addr.to_string()),
            })),
        );

        Ok(Self {
            spec,
            ctx,
            endpoint,
            connection: None,
            state: TurnState::Idle,
            log_context,
        })
    }

    fn expect_state(&mut self, operation: &'static str, expected: TurnState) -> Result<(), ChannelError> {
        match self.state {
            state if state == expected => Ok(()),
            TurnState::Closed => Err(ChannelError::Closed {
                channel: self.spec.name.clone(),
            }),
            state => Err(self.violation(operation, state)),
        }
    }

    fn violation(&mut self, operation: &'static str, state: TurnState) -> ChannelError {
        self.ctx.logger().log(
            LogLevel::Warn,
            Some(&self.log_context),
            "protocol violation, closing channel",
            Some(json!({"operation": operation, "state": state.to_string()})),
        );
        self.drop_connection();
        self.state = TurnState::Closed;
        ChannelError::ProtocolViolation {
            channel: self.spec.name.clone(),
            operation,
            state,
        }
    }

    fn fail(&mut self, reason: impl Into<String>) -> ChannelError {
        let reason = reason.into();
        let connection_id = self.connection.as_ref().map(|connection| connection.id().to_string());
        let level = if self.ctx.shutdown().is_triggered() {
            LogLevel::Debug
        } else {
            LogLevel::Warn
        };
        self.ctx.logger().log(
            level,
            Some(&self.log_context),
            "peer unavailable, closing channel",
            Some(json!({"reason": reason, "connection_id": connection_id})),
        );
        self.drop_connection();
        self.state = TurnState::Closed;
        ChannelError::PeerUnavailable {
            channel: self.spec.name.clone(),
            reason,
        }
    }

    fn drop_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            let _ = connection.stream().shutdown(Shutdown::Both);
            transport::log_connection_event(
                &self.ctx,
                LogLevel::Debug,
                &self.log_context,
                "connection dropped",
                &connection,
            );
        }
    }

    fn adopt(&mut self, stream: std::net::TcpStream, peer: SocketAddr) -> Result<(), ChannelError> {
        let connection = match Connection::configure(stream, peer, &self.ctx) {
            Ok(connection) => connection,
            Err(source) => return Err(self.fail(format!("failed to configure connection: {source}"))),
        };
        transport::log_connection_event(
            &self.ctx,
            LogLevel::Info,
            &self.log_context,
            "peer connected",
            &connection,
        );
        self.connection = Some(connection);
        Ok(())
    }

    /// Outgoing turns wait for a peer until the reply timeout or shutdown.
    fn connect_for_send(&mut self) -> Result<(), ChannelError> {
        if self.connection.is_some() {
            return Ok(());
        }

        match transport::establish(&self.endpoint, &self.ctx, self.ctx.reply_deadline()) {
            Ok(Some((stream, peer))) => self.adopt(stream, peer),
            Ok(None) if self.ctx.shutdown().is_triggered() => {
                Err(self.fail("shutdown requested before a peer connected"))
            }
            Ok(None) => Err(self.fail("no peer connected before the reply timeout")),
            Err(source) => Err(self.fail(format!("connect failed: {source}"))),
        }
    }

    /// Incoming turns try for at most one poll interval.
    fn poll_connection(&mut self) -> Result<bool, ChannelError> {
        if self.connection.is_some() {
            return Ok(true);
        }

        match transport::poll_establish(&self.endpoint, &self.ctx) {
            Ok(Some((stream, peer))) => {
                self.adopt(stream, peer)?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(source) => {
                self.ctx.logger().log(
                    LogLevel::Verbose,
                    Some(&self.log_context),
                    "peer not reachable yet",
                    Some(json!({"address": self.spec.address, "error": source.to_string()})),
                );
                Ok(false)
            }
        }
    }

    fn transmit(&mut self, envelope: &Envelope) -> Result<(), ChannelError> {
        let Some(connection) = self.connection.as_ref() else {
            return Err(self.fail("no connection to write to"));
        };

        let mut writer = connection.stream();
        match self.ctx.codec().write_envelope(&mut writer, envelope) {
            Ok(()) => {
                self.trace("sent", envelope);
                Ok(())
            }
            Err(CodecError::Io(source)) => Err(self.fail(format!("write failed: {source}"))),
            Err(source) => Err(ChannelError::MalformedEnvelope {
                channel: self.spec.name.clone(),
                source,
            }),
        }
    }

    fn receive(&mut self, wait: Wait) -> Result<Option<Envelope>, ChannelError> {
        let Some(connection) = self.connection.as_ref() else {
            return Err(self.fail("no connection to read from"));
        };

        let (idle_deadline, reply_deadline) = match wait {
            Wait::Poll => (Some(Instant::now() + self.ctx.settings().poll_interval), None),
            Wait::Reply => (None, self.ctx.reply_deadline()),
        };
        let mut reader = CancellableReader::new(
            connection.stream(),
            self.ctx.shutdown(),
            idle_deadline,
            reply_deadline,
        );

        match self.ctx.codec().read_envelope(&mut reader) {
            Ok(envelope) => {
                self.trace("received", &envelope);
                Ok(Some(envelope))
            }
            Err(CodecError::Io(source)) => match source.kind() {
                ErrorKind::WouldBlock => Ok(None),
                ErrorKind::ConnectionAborted if self.ctx.shutdown().is_triggered() => {
                    Err(self.fail("shutdown requested"))
                }
                ErrorKind::TimedOut => Err(self.fail("reply timeout elapsed")),
                ErrorKind::UnexpectedEof => Err(self.fail("peer closed the connection")),
                _ => Err(self.fail(format!("read failed: {source}"))),
            },
            Err(CodecError::Truncated) => Err(self.fail("peer closed the connection mid-message")),
            Err(source) if source.is_malformed_envelope() => {
                self.ctx.logger().log(
                    LogLevel::Warn,
                    Some(&self.log_context),
                    "malformed envelope",
                    Some(json!({"error": source.to_string()})),
                );
                Err(ChannelError::MalformedEnvelope {
                    channel: self.spec.name.clone(),
                    source,
                })
            }
            Err(source) => Err(self.fail(format!("stream lost framing: {source}"))),
        }
    }

    fn recreate(&mut self) -> bool {
        if self.state != TurnState::Closed {
            return false;
        }
        self.drop_connection();
        self.state = TurnState::Idle;
        self.ctx
            .logger()
            .debug(Some(&self.log_context), "channel recreated");
        true
    }

    fn close(&mut self) {
        self.drop_connection();
        self.state = TurnState::Closed;
    }

    fn trace(&self, direction: &str, envelope: &Envelope) {
        if self.ctx.logger().enabled(LogLevel::Verbose) {
            self.ctx.logger().log(
                LogLevel::Verbose,
                Some(&self.log_context),
                direction,
                Some(json!({
                    "function": envelope.function,
                    "binary_bytes": envelope.binary.as_ref().map(|binary| binary.bytes.len()),
                })),
            );
        }
    }
}

macro_rules! channel_accessors {
    ($channel:ty) => {
        impl $channel {
            pub fn name(&self) -> &str {
                &self.link.spec.name
            }

            pub fn spec(&self) -> &ChannelSpec {
                &self.link.spec
            }

            pub fn state(&self) -> TurnState {
                self.link.state
            }

            /// Bound address of a listening channel.
            pub fn local_addr(&self) -> Option<SocketAddr> {
                self.link.endpoint.local_addr()
            }

            pub fn is_connected(&self) -> bool {
                self.link.connection.is_some()
            }

            /// Takes a `Closed` channel back to `Idle` without a connection.
            /// Returns `false` when the channel was not closed.
            pub fn recreate(&mut self) -> bool {
                self.link.recreate()
            }

            pub fn close(&mut self) {
                self.link.close();
            }
        }

        impl fmt::Debug for $channel {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($channel))
                    .field("spec", &self.link.spec)
                    .field("state", &self.link.state)
                    .field("connected", &self.link.connection.is_some())
                    .finish()
            }
        }
    };
}

/// Requesting side of a strict-alternating conversation.
pub struct RequestChannel {
    link: Link,
}

impl RequestChannel {
    pub fn open(spec: ChannelSpec, ctx: TransportContext) -> Result<Self, ChannelError> {
        Link::open(spec, ctx).map(|link| Self { link })
    }

    pub fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError> {
        self.link.expect_state("send", TurnState::Idle)?;
        self.link.connect_for_send()?;
        self.link.transmit(envelope)?;
        self.link.state = TurnState::Sent;
        Ok(())
    }

    pub fn receive_reply(&mut self) -> Result<Envelope, ChannelError> {
        self.link.expect_state("receive a reply", TurnState::Sent)?;
        match self.link.receive(Wait::Reply) {
            Ok(Some(reply)) => {
                self.link.state = TurnState::Idle;
                Ok(reply)
            }
            Ok(None) => Err(self.link.fail("reply wait ended without a message")),
            Err(error @ ChannelError::MalformedEnvelope { .. }) => {
                // The unreadable reply still completed the peer's turn.
                self.link.state = TurnState::Idle;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    pub fn request(&mut self, envelope: &Envelope) -> Result<Envelope, ChannelError> {
        self.send(envelope)?;
        self.receive_reply()
    }
}

channel_accessors!(RequestChannel);

/// Answering side of a strict-alternating conversation.
pub struct ReplyChannel {
    link: Link,
}

impl ReplyChannel {
    pub fn open(spec: ChannelSpec, ctx: TransportContext) -> Result<Self, ChannelError> {
        Link::open(spec, ctx).map(|link| Self { link })
    }

    /// `Ok(None)` when no request started arriving within one poll interval.
    ///
    /// A malformed request still moves the channel to `Received`, so the
    /// caller owes the peer a reply.
    pub fn receive_request(&mut self) -> Result<Option<Envelope>, ChannelError> {
        self.link.expect_state("receive a request", TurnState::Idle)?;
        if !self.link.poll_connection()? {
            return Ok(None);
        }

        match self.link.receive(Wait::Poll) {
            Ok(Some(request)) => {
                self.link.state = TurnState::Received;
                Ok(Some(request))
            }
            Ok(None) => Ok(None),
            Err(error @ ChannelError::MalformedEnvelope { .. }) => {
                self.link.state = TurnState::Received;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    pub fn send_reply(&mut self, reply: &Envelope) -> Result<(), ChannelError> {
        self.link.expect_state("send a reply", TurnState::Received)?;
        self.link.transmit(reply)?;
        self.link.state = TurnState::Idle;
        Ok(())
    }
}

channel_accessors!(ReplyChannel);

/// Pushing side of a fire-and-forget conversation; every push waits for
/// the peer's ack.
pub struct NotifyChannel {
    link: Link,
}

impl NotifyChannel {
    pub fn open(spec: ChannelSpec, ctx: TransportContext) -> Result<Self, ChannelError> {
        Link::open(spec, ctx).map(|link| Self { link })
    }

    /// Returns the ack. An `error` reply counts as an ack whose handler
    /// failed; anything else closes the channel.
    pub fn notify(&mut self, envelope: &Envelope) -> Result<Envelope, ChannelError> {
        self.link.expect_state("notify", TurnState::Idle)?;
        self.link.connect_for_send()?;
        self.link.transmit(envelope)?;
        self.link.state = TurnState::Sent;

        let ack = match self.link.receive(Wait::Reply) {
            Ok(Some(ack)) => ack,
            Ok(None) => return Err(self.link.fail("ack wait ended without a message")),
            Err(error @ ChannelError::MalformedEnvelope { .. }) => {
                self.link.state = TurnState::Idle;
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        if !(ack.is_reply() || ack.is_error()) {
            return Err(self.link.violation("accept a non-ack reply", TurnState::Sent));
        }
        self.link.state = TurnState::Idle;
        Ok(ack)
    }
}

channel_accessors!(NotifyChannel);

/// Receiving side of a fire-and-forget conversation.
pub struct NotifyListener {
    link: Link,
}

impl NotifyListener {
    pub fn open(spec: ChannelSpec, ctx: TransportContext) -> Result<Self, ChannelError> {
        Link::open(spec, ctx).map(|link| Self { link })
    }

    /// Receives at most one notification, acks it, then runs `handler`.
    ///
    /// The ack goes out before the handler starts and does not depend on its
    /// outcome; a panicking handler is logged and swallowed. Returns the
    /// notification, or `Ok(None)` when nothing arrived within one poll
    /// interval.
    pub fn on_notify<F>(&mut self, handler: F) -> Result<Option<Envelope>, ChannelError>
    where
        F: FnOnce(&Envelope),
    {
        self.link.expect_state("receive a notification", TurnState::Idle)?;
        if !self.link.poll_connection()? {
            return Ok(None);
        }

        let notification = match self.link.receive(Wait::Poll) {
            Ok(Some(notification)) => notification,
            Ok(None) => return Ok(None),
            Err(ChannelError::MalformedEnvelope { channel, source }) => {
                self.link.state = TurnState::Received;
                self.link
                    .transmit(&Envelope::error("", source.to_string()))?;
                self.link.state = TurnState::Idle;
                return Err(ChannelError::MalformedEnvelope { channel, source });
            }
            Err(error) => return Err(error),
        };

        self.link.state = TurnState::Received;
        self.link.transmit(&Envelope::ack())?;
        self.link.state = TurnState::Idle;

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&notification))) {
            self.link.ctx.logger().log(
                LogLevel::Error,
                Some(&self.link.log_context),
                "notification handler panicked",
                Some(json!({
                    "function": notification.function,
                    "panic": panic_message(panic.as_ref()),
                })),
            );
        }

        Ok(Some(notification))
    }
}

channel_accessors!(NotifyListener);
