use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;

use crate::channel::{
    ChannelError, ChannelSpec, NotifyChannel, NotifyListener, ReplyChannel, RequestChannel,
    TransportContext,
};
use crate::dispatch::{panic_message, DispatchTable};
use crate::logging::LogLevel;
use crate::queue::OutboundQueue;
use crate::wire::envelope::Envelope;

/// Called with the forwarded envelope and the peer's reply.
pub type ReplyObserver = Arc<dyn Fn(&Envelope, &Envelope) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboundMode {
    Request,
    Notify,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundMode {
    Respond,
    ReceiveNotifications,
}

pub struct Outbound {
    pub channel: ChannelSpec,
    pub mode: OutboundMode,
    pub queue: OutboundQueue,
    pub on_reply: Option<ReplyObserver>,
}

pub struct Inbound {
    pub channel: ChannelSpec,
    pub mode: InboundMode,
    pub table: Arc<DispatchTable>,
}

/// Declarative description of one worker thread and the channels it owns.
pub struct WorkerSpec {
    pub name: String,
    pub outbound: Option<Outbound>,
    pub inbound: Option<Inbound>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outbound: None,
            inbound: None,
        }
    }

    pub fn forward_requests(self, channel: ChannelSpec, queue: OutboundQueue) -> Self {
        self.with_outbound(channel, OutboundMode::Request, queue)
    }

    pub fn forward_notifications(self, channel: ChannelSpec, queue: OutboundQueue) -> Self {
        self.with_outbound(channel, OutboundMode::Notify, queue)
    }

    /// Applies to the outbound side configured before this call.
    pub fn on_reply<F>(mut self, observer: F) -> Self
    where
        F: Fn(&Envelope, &Envelope) + Send + Sync + 'static,
    {
        if let Some(outbound) = self.outbound.as_mut() {
            outbound.on_reply = Some(Arc::new(observer));
        }
        self
    }

    pub fn respond(self, channel: ChannelSpec, table: Arc<DispatchTable>) -> Self {
        self.with_inbound(channel, InboundMode::Respond, table)
    }

    pub fn receive_notifications(self, channel: ChannelSpec, table: Arc<DispatchTable>) -> Self {
        self.with_inbound(channel, InboundMode::ReceiveNotifications, table)
    }

    fn with_outbound(mut self, channel: ChannelSpec, mode: OutboundMode, queue: OutboundQueue) -> Self {
        self.outbound = Some(Outbound {
            channel,
            mode,
            queue,
            on_reply: None,
        });
        self
    }

    fn with_inbound(mut self, channel: ChannelSpec, mode: InboundMode, table: Arc<DispatchTable>) -> Self {
        self.inbound = Some(Inbound {
            channel,
            mode,
            table,
        });
        self
    }
}

#[derive(Debug)]
pub enum WorkerError {
    EmptySpec { worker: String },
    Channel(ChannelError),
    Spawn { worker: String, source: io::Error },
    JoinFailed { worker: String, reason: String },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySpec { worker } => {
                write!(f, "worker '{worker}' has neither an inbound nor an outbound channel")
            }
            Self::Channel(source) => write!(f, "{source}"),
            Self::Spawn { worker, source } => {
                write!(f, "failed to spawn thread for worker '{worker}': {source}")
            }
            Self::JoinFailed { worker, reason } => {
                write!(f, "worker '{worker}' thread panicked: {reason}")
            }
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Channel(source) => Some(source),
            Self::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ChannelError> for WorkerError {
    fn from(value: ChannelError) -> Self {
        Self::Channel(value)
    }
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    served: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    recreated: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub served: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub recreated: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            served: self.served.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            recreated: self.recreated.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum OutboundChannel {
    Request(RequestChannel),
    Notify(NotifyChannel),
}

impl OutboundChannel {
    fn open(spec: ChannelSpec, mode: OutboundMode, ctx: &TransportContext) -> Result<Self, ChannelError> {
        match mode {
            OutboundMode::Request => RequestChannel::open(spec, ctx.clone()).map(Self::Request),
            OutboundMode::Notify => NotifyChannel::open(spec, ctx.clone()).map(Self::Notify),
        }
    }

    fn deliver(&mut self, envelope: &Envelope) -> Result<Envelope, ChannelError> {
        match self {
            Self::Request(channel) => channel.request(envelope),
            Self::Notify(channel) => channel.notify(envelope),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Request(channel) => channel.name(),
            Self::Notify(channel) => channel.name(),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Request(channel) => channel.local_addr(),
            Self::Notify(channel) => channel.local_addr(),
        }
    }

    fn recreate(&mut self) -> bool {
        match self {
            Self::Request(channel) => channel.recreate(),
            Self::Notify(channel) => channel.recreate(),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Request(channel) => channel.close(),
            Self::Notify(channel) => channel.close(),
        }
    }
}

enum InboundChannel {
    Respond(ReplyChannel),
    Notifications(NotifyListener),
}

impl InboundChannel {
    fn open(spec: ChannelSpec, mode: InboundMode, ctx: &TransportContext) -> Result<Self, ChannelError> {
        match mode {
            InboundMode::Respond => ReplyChannel::open(spec, ctx.clone()).map(Self::Respond),
            InboundMode::ReceiveNotifications => {
                NotifyListener::open(spec, ctx.clone()).map(Self::Notifications)
            }
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Respond(channel) => channel.name(),
            Self::Notifications(channel) => channel.name(),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Respond(channel) => channel.local_addr(),
            Self::Notifications(channel) => channel.local_addr(),
        }
    }

    fn recreate(&mut self) -> bool {
        match self {
            Self::Respond(channel) => channel.recreate(),
            Self::Notifications(channel) => channel.recreate(),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Respond(channel) => channel.close(),
            Self::Notifications(channel) => channel.close(),
        }
    }
}

struct OutboundLink {
    channel: OutboundChannel,
    queue: OutboundQueue,
    on_reply: Option<ReplyObserver>,
}

struct InboundLink {
    channel: InboundChannel,
    table: Arc<DispatchTable>,
}

/// Single-threaded owner of at most one inbound and one outbound channel.
///
/// Each turn serves at most one inbound message, then delivers at most one
/// queued envelope. Both waits are bounded by the poll interval so the loop
/// notices shutdown promptly.
pub struct WorkerLoop {
    name: String,
    log_context: String,
    ctx: TransportContext,
    outbound: Option<OutboundLink>,
    inbound: Option<InboundLink>,
    stats: Arc<WorkerStats>,
}

impl WorkerLoop {
    /// Opens every channel of `spec`; listeners are bound before this returns.
    pub fn open(spec: WorkerSpec, ctx: TransportContext) -> Result<Self, WorkerError> {
        let WorkerSpec {
            name,
            outbound,
            inbound,
        } = spec;
        if outbound.is_none() && inbound.is_none() {
            return Err(WorkerError::EmptySpec { worker: name });
        }

        let outbound = outbound
            .map(|outbound| -> Result<OutboundLink, ChannelError> {
                Ok(OutboundLink {
                    channel: OutboundChannel::open(outbound.channel, outbound.mode, &ctx)?,
                    queue: outbound.queue,
                    on_reply: outbound.on_reply,
                })
            })
            .transpose()?;
        let inbound = inbound
            .map(|inbound| -> Result<InboundLink, ChannelError> {
                Ok(InboundLink {
                    channel: InboundChannel::open(inbound.channel, inbound.mode, &ctx)?,
                    table: inbound.table,
                })
            })
            .transpose()?;

        Ok(Self {
            log_context: format!("worker::{name}"),
            name,
            ctx,
            outbound,
            inbound,
            stats: Arc::new(WorkerStats::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    pub fn queue(&self) -> Option<OutboundQueue> {
        self.outbound.as_ref().map(|outbound| outbound.queue.clone())
    }

    /// Addresses of the listening channels, keyed by channel name.
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        let outbound = self
            .outbound
            .as_ref()
            .and_then(|link| Some((link.channel.name().to_owned(), link.channel.local_addr()?)));
        let inbound = self
            .inbound
            .as_ref()
            .and_then(|link| Some((link.channel.name().to_owned(), link.channel.local_addr()?)));
        inbound.into_iter().chain(outbound).collect()
    }

    pub fn spawn(self) -> Result<WorkerHandle, WorkerError> {
        let name = self.name.clone();
        let stats = self.stats();
        let queue = self.queue();
        let join = thread::Builder::new()
            .name(format!("worker-{name}"))
            .spawn(move || self.run())
            .map_err(|source| WorkerError::Spawn {
                worker: name.clone(),
                source,
            })?;

        Ok(WorkerHandle {
            name,
            join: Some(join),
            stats,
            queue,
            started_at: Utc::now(),
        })
    }

    /// Runs turns until shutdown or until the outbound queue is closed.
    pub fn run(mut self) {
        self.ctx.logger().log(
            LogLevel::Info,
            Some(&self.log_context),
            "worker started",
            Some(json!({
                "inbound": self.inbound.as_ref().map(|link| link.channel.name()),
                "outbound": self.outbound.as_ref().map(|link| link.channel.name()),
            })),
        );

        while !self.ctx.shutdown().is_triggered() {
            if self.turn().is_break() {
                break;
            }
        }

        if let Some(link) = self.inbound.as_mut() {
            link.channel.close();
        }
        if let Some(link) = self.outbound.as_mut() {
            link.channel.close();
        }
        self.ctx.logger().log(
            LogLevel::Info,
            Some(&self.log_context),
            "worker stopped",
            serde_json::to_value(self.stats.snapshot()).ok(),
        );
    }

    pub fn turn(&mut self) -> ControlFlow<()> {
        self.serve_inbound();
        self.forward_outbound()
    }

    fn serve_inbound(&mut self) {
        let Some(link) = self.inbound.as_mut() else {
            return;
        };
        let table = &link.table;
        let outcome = match &mut link.channel {
            InboundChannel::Respond(channel) => serve_request(channel, table),
            InboundChannel::Notifications(listener) => listener
                .on_notify(|notification| {
                    // The ack is already out; a failed handler only gets logged.
                    let _ = table.dispatch(notification);
                })
                .map(|notification| notification.is_some()),
        };

        match outcome {
            Ok(true) => WorkerStats::bump(&self.stats.served),
            Ok(false) => {}
            Err(error @ ChannelError::MalformedEnvelope { .. }) => {
                WorkerStats::bump(&self.stats.malformed);
                self.ctx
                    .logger()
                    .warn(Some(&self.log_context), &format!("rejected inbound message: {error}"));
            }
            Err(error) => {
                let level = if self.ctx.shutdown().is_triggered() {
                    LogLevel::Debug
                } else {
                    LogLevel::Warn
                };
                self.ctx.logger().log(
                    level,
                    Some(&self.log_context),
                    "inbound channel failed",
                    Some(json!({"channel": error.channel(), "error": error.to_string()})),
                );
                if error.requires_recreate() && link.channel.recreate() {
                    WorkerStats::bump(&self.stats.recreated);
                }
            }
        }
    }

    fn forward_outbound(&mut self) -> ControlFlow<()> {
        let Some(link) = self.outbound.as_mut() else {
            return ControlFlow::Continue(());
        };
        let Some(envelope) = link.queue.pop_timeout(self.ctx.settings().poll_interval) else {
            return if link.queue.is_closed() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            };
        };

        match link.channel.deliver(&envelope) {
            Ok(reply) => {
                WorkerStats::bump(&self.stats.forwarded);
                if reply.is_error() {
                    self.ctx.logger().log(
                        LogLevel::Warn,
                        Some(&self.log_context),
                        "peer answered with an error",
                        Some(json!({"function": envelope.function, "reply": reply.argument})),
                    );
                }
                if let Some(observer) = link.on_reply.as_ref() {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(&envelope, &reply))) {
                        self.ctx.logger().log(
                            LogLevel::Error,
                            Some(&self.log_context),
                            "reply observer panicked",
                            Some(json!({"function": envelope.function, "panic": panic_message(panic.as_ref())})),
                        );
                    }
                }
            }
            Err(error) => {
                WorkerStats::bump(&self.stats.dropped);
                if matches!(error, ChannelError::MalformedEnvelope { .. }) {
                    WorkerStats::bump(&self.stats.malformed);
                }
                let level = if self.ctx.shutdown().is_triggered() {
                    LogLevel::Debug
                } else {
                    LogLevel::Warn
                };
                self.ctx.logger().log(
                    level,
                    Some(&self.log_context),
                    "dropping undeliverable envelope",
                    Some(json!({"function": envelope.function, "error": error.to_string()})),
                );
                if error.requires_recreate() && link.channel.recreate() {
                    WorkerStats::bump(&self.stats.recreated);
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// Reads one request and answers it. Unreadable requests get an error reply
/// because the peer is blocked waiting for one.
fn serve_request(channel: &mut ReplyChannel, table: &DispatchTable) -> Result<bool, ChannelError> {
    let request = match channel.receive_request() {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(false),
        Err(error @ ChannelError::MalformedEnvelope { .. }) => {
            channel.send_reply(&Envelope::error("", error.to_string()))?;
            return Err(error);
        }
        Err(error) => return Err(error),
    };

    let reply = table.dispatch(&request);
    match channel.send_reply(&reply) {
        Ok(()) => Ok(true),
        Err(error @ ChannelError::MalformedEnvelope { .. }) => {
            channel.send_reply(&Envelope::error(&request.function, error.to_string()))?;
            Ok(true)
        }
        Err(error) => Err(error),
    }
}

/// Running worker thread plus the shared pieces needed to observe it.
pub struct WorkerHandle {
    name: String,
    join: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
    queue: Option<OutboundQueue>,
    started_at: DateTime<Utc>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    pub fn queue(&self) -> Option<&OutboundQueue> {
        self.queue.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn status(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "started_at": self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "running": !self.is_finished(),
            "queue_depth": self.queue.as_ref().map(OutboundQueue::len),
            "stats": self.stats.snapshot(),
        })
    }

    pub fn join(mut self) -> Result<WorkerStatsSnapshot, WorkerError> {
        if let Some(join) = self.join.take() {
            join.join().map_err(|panic| WorkerError::JoinFailed {
                worker: self.name.clone(),
                reason: panic_message(panic.as_ref()),
            })?;
        }
        Ok(self.stats.snapshot())
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("started_at", &self.started_at)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use crate::channel::testing::test_context;
    use crate::channel::{ChannelSpec, NotifyChannel, ReplyChannel, RequestChannel};
    use crate::dispatch::DispatchTable;
    use crate::queue::OutboundQueue;
    use crate::wire::codec::WireCodec;
    use crate::wire::envelope::{message_argument, Envelope, NOTHING_HAPPENED_MESSAGE};

    use super::testing::wait_until;
    use super::{WorkerError, WorkerLoop, WorkerSpec};

    const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn worker_without_channels_is_rejected() {
        let (ctx, _sink) = test_context(None);

        let err = WorkerLoop::open(WorkerSpec::new("idle"), ctx)
            .err()
            .expect("a worker without channels should fail");

        assert!(matches!(err, WorkerError::EmptySpec { .. }));
    }

    #[test]
    fn forwards_queue_in_order_and_observes_replies() {
        let (peer_ctx, _peer_sink) = test_context(Some(REPLY_TIMEOUT));
        let mut peer = ReplyChannel::open(ChannelSpec::listen("rds_commands", "127.0.0.1:0"), peer_ctx)
            .expect("peer should bind");
        let address = peer.local_addr().expect("bound").to_string();
        let server = thread::spawn(move || {
            let mut seen = Vec::new();
            let deadline = Instant::now() + Duration::from_secs(5);
            while seen.len() < 3 && Instant::now() < deadline {
                if let Ok(Some(request)) = peer.receive_request() {
                    seen.push(request.function.clone());
                    let _ = peer.send_reply(&Envelope::message_reply(request.function));
                }
            }
            seen
        });

        let (ctx, _sink) = test_context(Some(REPLY_TIMEOUT));
        let shutdown = ctx.shutdown().clone();
        let queue = OutboundQueue::new("rds_commands");
        let replies = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&replies);
        let worker = WorkerLoop::open(
            WorkerSpec::new("rds_commands")
                .forward_requests(ChannelSpec::dial("rds_commands", address), queue.clone())
                .on_reply(move |sent, reply| {
                    recorded
                        .lock()
                        .expect("replies lock")
                        .push((sent.function.clone(), reply.message().map(str::to_owned)));
                }),
            ctx,
        )
        .expect("worker should open");
        let handle = worker.spawn().expect("worker should spawn");

        for function in ["A", "B", "C"] {
            queue.push(Envelope::call(function)).expect("push");
        }

        assert_eq!(server.join().expect("server thread"), vec!["A", "B", "C"]);
        assert!(wait_until(|| handle.stats().snapshot().forwarded == 3));
        shutdown.trigger();
        queue.close();
        let stats = handle.join().expect("worker should join");

        assert_eq!(stats.dropped, 0);
        let replies = replies.lock().expect("replies lock").clone();
        assert_eq!(
            replies,
            vec![
                ("A".to_owned(), Some("A".to_owned())),
                ("B".to_owned(), Some("B".to_owned())),
                ("C".to_owned(), Some("C".to_owned())),
            ]
        );
    }

    #[test]
    fn peer_loss_drops_in_flight_entry_and_recovers() {
        let flaky = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = flaky.local_addr().expect("bound").to_string();
        let peer = thread::spawn(move || {
            let codec = WireCodec::default();

            let (mut first, _) = flaky.accept().expect("first connection");
            let lost = codec.read_envelope(&mut first).expect("first request");
            drop(first);

            let (mut second, _) = flaky.accept().expect("second connection");
            let delivered = codec.read_envelope(&mut second).expect("second request");
            codec
                .write_envelope(&mut second, &Envelope::message_reply("Poi added"))
                .expect("reply");
            (lost.function, delivered.function)
        });

        let (ctx, sink) = test_context(Some(REPLY_TIMEOUT));
        let shutdown = ctx.shutdown().clone();
        let queue = OutboundQueue::new("rds_commands");
        let handle = WorkerLoop::open(
            WorkerSpec::new("rds_commands")
                .forward_requests(ChannelSpec::dial("rds_commands", address), queue.clone()),
            ctx,
        )
        .expect("worker should open")
        .spawn()
        .expect("worker should spawn");

        queue.push(Envelope::call("lost")).expect("push");
        queue.push(Envelope::call("delivered")).expect("push");

        let (lost, delivered) = peer.join().expect("peer thread");
        assert_eq!(lost, "lost");
        assert_eq!(delivered, "delivered");
        assert!(wait_until(|| handle.stats().snapshot().forwarded == 1));

        shutdown.trigger();
        queue.close();
        let stats = handle.join().expect("worker should join");

        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.recreated, 1);
        assert!(sink.contains("dropping undeliverable envelope"));
    }

    #[test]
    fn responder_dispatches_and_answers_unknown_and_malformed() {
        let (ctx, _sink) = test_context(Some(REPLY_TIMEOUT));
        let mut table = DispatchTable::new("gui_requests", Arc::clone(ctx.logger()));
        table
            .register("connect", |_| Ok(Some(message_argument("connected"))))
            .expect("register");
        let shutdown = ctx.shutdown().clone();
        let worker = WorkerLoop::open(
            WorkerSpec::new("gui_requests")
                .respond(ChannelSpec::listen("gui_requests", "127.0.0.1:0"), Arc::new(table)),
            ctx,
        )
        .expect("worker should open");
        let address = worker.local_addrs()[0].1.to_string();
        let handle = worker.spawn().expect("worker should spawn");

        let (client_ctx, _client_sink) = test_context(Some(REPLY_TIMEOUT));
        let mut client = RequestChannel::open(ChannelSpec::dial("gui", address.clone()), client_ctx)
            .expect("client should open");
        let connected = client.request(&Envelope::call("connect")).expect("reply");
        let unknown = client.request(&Envelope::call("set_area")).expect("reply");
        assert_eq!(connected.message(), Some("connected"));
        assert_eq!(unknown.message(), Some(NOTHING_HAPPENED_MESSAGE));
        drop(client);

        let mut raw = std::net::TcpStream::connect(&address).expect("raw client");
        let body = br#"{"arg":{}}"#;
        std::io::Write::write_all(&mut raw, &(body.len() as u32).to_be_bytes()).expect("header");
        std::io::Write::write_all(&mut raw, body).expect("body");
        raw.set_read_timeout(Some(REPLY_TIMEOUT)).expect("timeout");
        let rejected = WireCodec::default()
            .read_envelope(&mut raw)
            .expect("error reply for malformed request");
        assert!(rejected.is_error());

        assert!(wait_until(|| handle.stats().snapshot().malformed == 1));
        shutdown.trigger();
        let stats = handle.join().expect("worker should join");
        assert_eq!(stats.served, 2);
        assert!(stats.recreated >= 1);
    }

    #[test]
    fn malformed_request_with_binary_part_keeps_replies_in_step() {
        let (ctx, _sink) = test_context(Some(REPLY_TIMEOUT));
        let mut table = DispatchTable::new("gui_requests", Arc::clone(ctx.logger()));
        table
            .register("connect", |_| Ok(Some(message_argument("connected"))))
            .expect("register");
        let shutdown = ctx.shutdown().clone();
        let worker = WorkerLoop::open(
            WorkerSpec::new("gui_requests")
                .respond(ChannelSpec::listen("gui_requests", "127.0.0.1:0"), Arc::new(table)),
            ctx,
        )
        .expect("worker should open");
        let address = worker.local_addrs()[0].1.to_string();
        let handle = worker.spawn().expect("worker should spawn");

        let codec = WireCodec::default();
        let mut raw = std::net::TcpStream::connect(&address).expect("raw client");
        raw.set_read_timeout(Some(REPLY_TIMEOUT)).expect("timeout");
        for part in [
            &br#"{"arg":{},"bin":{"encoding":"uint8","dimensions":[1],"len":1}}"#[..],
            &[7_u8][..],
        ] {
            std::io::Write::write_all(&mut raw, &(part.len() as u32).to_be_bytes()).expect("header");
            std::io::Write::write_all(&mut raw, part).expect("part");
        }
        let rejected = codec
            .read_envelope(&mut raw)
            .expect("error reply for malformed request");
        assert!(rejected.is_error());

        codec
            .write_envelope(&mut raw, &Envelope::call("connect"))
            .expect("next request should write");
        let connected = codec.read_envelope(&mut raw).expect("reply to the next request");
        assert_eq!(connected.message(), Some("connected"));

        shutdown.trigger();
        let stats = handle.join().expect("worker should join");
        assert_eq!(stats.served, 1);
        assert_eq!(stats.malformed, 1);
    }

    #[test]
    fn notification_listener_acks_then_hands_off_downstream() {
        let (ctx, _sink) = test_context(Some(REPLY_TIMEOUT));
        let downstream = OutboundQueue::new("gui_notifications");
        let handoff = downstream.clone();
        let mut table = DispatchTable::new("rds_notifications", Arc::clone(ctx.logger()));
        table
            .register("new_pic", move |argument| {
                let forwarded = Envelope::new("new_pic", argument.clone());
                handoff.push(forwarded).map_err(|err| err.to_string())?;
                Ok(None)
            })
            .expect("register");
        let shutdown = ctx.shutdown().clone();
        let worker = WorkerLoop::open(
            WorkerSpec::new("rds_notifications").receive_notifications(
                ChannelSpec::listen("rds_notifications", "127.0.0.1:0"),
                Arc::new(table),
            ),
            ctx,
        )
        .expect("worker should open");
        let address = worker.local_addrs()[0].1.to_string();
        let handle = worker.spawn().expect("worker should spawn");

        let (notifier_ctx, _notifier_sink) = test_context(Some(REPLY_TIMEOUT));
        let mut notifier = NotifyChannel::open(ChannelSpec::dial("rds", address), notifier_ctx)
            .expect("notifier should open");
        let ack = notifier
            .notify(&Envelope::from_json("new_pic", json!({"image_id": 1})).expect("object"))
            .expect("ack");
        assert_eq!(ack.message(), Some("ack"));

        let forwarded = downstream
            .pop_timeout(Duration::from_secs(2))
            .expect("handler should enqueue downstream");
        assert_eq!(forwarded.argument.get("image_id"), Some(&json!(1)));

        shutdown.trigger();
        let stats = handle.join().expect("worker should join");
        assert_eq!(stats.served, 1);
    }
}
