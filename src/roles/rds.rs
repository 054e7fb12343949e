use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use crate::channel::{ChannelSpec, TransportContext};
use crate::config::RdsConfig;
use crate::coordinator::ThreadCoordinator;
use crate::dispatch::DispatchTable;
use crate::logging::Logger;
use crate::queue::OutboundQueue;
use crate::shutdown::ShutdownSignal;
use crate::store::{Area, Coordinate, DroneMode, ImageMetadata, ImageRecord, ImageStore, SessionRecord};
use crate::wire::envelope::{
    message_argument, required_as, ArgumentMap, BinaryPayload, Envelope, ADD_POI_FUNCTION,
    GUI_QUEUE_ETA_FUNCTION, MESSAGE_KEY, NEW_PIC_FUNCTION, QUEUE_ETA_FUNCTION,
};
use crate::worker::WorkerSpec;

use super::{reject, RoleError};

pub const COMMANDS: &str = "commands";
pub const INFO: &str = "info";
pub const NOTIFICATIONS: &str = "notifications";

const LOG_CONTEXT: &str = "role::rds";

/// Footprint of the demo image seeded at startup.
pub fn seed_area() -> Area {
    let corner = Coordinate::new(58.0, 16.0);
    Area {
        up_left: Coordinate::new(59.0, 16.0),
        up_right: corner,
        down_left: corner,
        down_right: corner,
        center: corner,
    }
}

#[derive(Default)]
struct DroneState {
    pending: VecDeque<ImageRecord>,
    /// Set while the drone is flying towards the image it popped last.
    arrival: Option<Instant>,
}

/// Stands in for the drone: takes queued images one at a time, flies for
/// `flying_time` and hands each one back as captured.
pub struct DroneSimulator {
    state: Mutex<DroneState>,
    queued: Condvar,
    flying_time: Duration,
}

impl DroneSimulator {
    pub fn new(flying_time: Duration) -> Self {
        Self {
            state: Mutex::new(DroneState::default()),
            queued: Condvar::new(),
            flying_time,
        }
    }

    pub fn enqueue(&self, image: ImageRecord) {
        self.lock().pending.push_back(image);
        self.queued.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whole seconds until the queue drains, rounded up. Zero when idle.
    pub fn eta_seconds(&self) -> u64 {
        let state = self.lock();
        let in_flight = state
            .arrival
            .map(|arrival| arrival.saturating_duration_since(Instant::now()))
            .unwrap_or_default();
        let queued = self.flying_time * state.pending.len() as u32;
        let total = in_flight + queued;
        total.as_secs() + u64::from(total.subsec_nanos() > 0)
    }

    /// Runs until `shutdown` fires. An image still in flight at that point is
    /// not reported.
    pub fn run(&self, shutdown: &ShutdownSignal, poll: Duration, mut capture: impl FnMut(ImageRecord)) {
        while !shutdown.is_triggered() {
            let Some(image) = self.next_target(poll) else {
                continue;
            };
            if shutdown.wait_timeout(self.flying_time, poll) {
                break;
            }
            self.lock().arrival = None;
            capture(image);
        }
    }

    fn next_target(&self, poll: Duration) -> Option<ImageRecord> {
        let mut state = self.lock();
        if state.pending.is_empty() {
            state = self
                .queued
                .wait_timeout(state, poll)
                .expect("drone state lock poisoned")
                .0;
        }
        let image = state.pending.pop_front()?;
        state.arrival = Some(Instant::now() + self.flying_time);
        Some(image)
    }

    fn lock(&self) -> MutexGuard<'_, DroneState> {
        self.state.lock().expect("drone state lock poisoned")
    }
}

impl fmt::Debug for DroneSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DroneSimulator")
            .field("pending", &self.pending())
            .field("flying_time", &self.flying_time)
            .finish()
    }
}

/// Relay emulator: accepts image requests from the backend, lets the drone
/// simulator "capture" them and publishes each capture as `new_pic`.
#[derive(Debug)]
pub struct RdsEmulator {
    coordinator: ThreadCoordinator,
    session: SessionRecord,
    simulator: Arc<DroneSimulator>,
}

impl RdsEmulator {
    pub fn build(
        config: &RdsConfig,
        ctx: TransportContext,
        store: Arc<dyn ImageStore>,
    ) -> Result<Self, RoleError> {
        let session = store.insert_session(DroneMode::Auto)?;
        if !config.seed_image_path.is_empty() {
            seed_image(store.as_ref(), session.id, &config.seed_image_path)?;
        }

        let logger = Arc::clone(ctx.logger());
        let poll = ctx.settings().poll_interval;
        let coordinator = ThreadCoordinator::new("rds", ctx);
        let simulator = Arc::new(DroneSimulator::new(Duration::from_millis(config.flying_time_ms)));
        let published = OutboundQueue::new(NOTIFICATIONS);

        coordinator.add_worker(WorkerSpec::new(COMMANDS).respond(
            ChannelSpec::listen(COMMANDS, &config.commands),
            Arc::new(command_table(store, Arc::clone(&simulator), Arc::clone(&logger))?),
        ))?;
        coordinator.add_worker(WorkerSpec::new(INFO).respond(
            ChannelSpec::listen(INFO, &config.info),
            Arc::new(info_table(Arc::clone(&simulator), Arc::clone(&logger))?),
        ))?;
        coordinator.add_worker(WorkerSpec::new(NOTIFICATIONS).forward_notifications(
            ChannelSpec::listen(NOTIFICATIONS, &config.notifications),
            published.clone(),
        ))?;

        let drone = Arc::clone(&simulator);
        let drone_id = config.drone_id.clone();
        coordinator.add_task("drone", move |shutdown| {
            drone.run(&shutdown, poll, |image| {
                let envelope = captured_image(&drone_id, &image, &logger);
                if let Err(error) = published.push(envelope) {
                    logger.debug(Some(LOG_CONTEXT), &error.to_string());
                }
            });
        })?;

        Ok(Self {
            coordinator,
            session,
            simulator,
        })
    }

    pub fn coordinator(&self) -> &ThreadCoordinator {
        &self.coordinator
    }

    pub fn session(&self) -> &SessionRecord {
        &self.session
    }

    pub fn simulator(&self) -> &Arc<DroneSimulator> {
        &self.simulator
    }
}

fn seed_image(store: &dyn ImageStore, session_id: u64, path: &str) -> Result<ImageRecord, RoleError> {
    let metadata = ImageMetadata {
        session_id,
        time_taken: Utc::now(),
        width: 0,
        height: 0,
        kind: "rgb".to_owned(),
        area: seed_area(),
    };
    Ok(store.insert_image(metadata, path)?)
}

fn command_table(
    store: Arc<dyn ImageStore>,
    simulator: Arc<DroneSimulator>,
    logger: Arc<Logger>,
) -> Result<DispatchTable, RoleError> {
    let mut table = DispatchTable::new(COMMANDS, logger);
    table.register(ADD_POI_FUNCTION, move |argument| {
        let area: Area = required_as(argument, "coordinates").map_err(reject)?;
        match store.find_image_by_area(&area).map_err(reject)? {
            Some(image) => {
                simulator.enqueue(image);
                Ok(Some(message_argument("Image added to queue")))
            }
            None => Ok(Some(message_argument("Something went wrong"))),
        }
    })?;
    Ok(table)
}

fn info_table(simulator: Arc<DroneSimulator>, logger: Arc<Logger>) -> Result<DispatchTable, RoleError> {
    let mut table = DispatchTable::new(INFO, logger);
    table.register(QUEUE_ETA_FUNCTION, move |_| {
        let mut reply = ArgumentMap::new();
        reply.insert(MESSAGE_KEY.to_owned(), json!(GUI_QUEUE_ETA_FUNCTION));
        reply.insert("eta_seconds".to_owned(), json!(simulator.eta_seconds()));
        Ok(Some(reply))
    })?;
    Ok(table)
}

fn captured_image(drone_id: &str, image: &ImageRecord, logger: &Logger) -> Envelope {
    let mut argument = ArgumentMap::new();
    argument.insert("drone_id".to_owned(), json!(drone_id));
    argument.insert("type".to_owned(), json!(image.kind));
    argument.insert("force_que_id".to_owned(), json!(0));
    argument.insert("coordinates".to_owned(), json!(image.area));
    let envelope = Envelope::new(NEW_PIC_FUNCTION, argument);

    match fs::read(&image.file_name) {
        Ok(bytes) if !bytes.is_empty() => {
            let encoding = image_encoding(&image.file_name);
            let dimensions = vec![bytes.len() as u64];
            envelope.with_binary(BinaryPayload::new(encoding, dimensions, bytes))
        }
        Ok(_) => envelope,
        Err(error) => {
            logger.warn(
                Some(LOG_CONTEXT),
                &format!("publishing '{}' without image data: {error}", image.file_name),
            );
            envelope
        }
    }
}

fn image_encoding(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "raw".to_owned())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use serde_json::json;

    use crate::channel::testing::test_context;
    use crate::channel::{ChannelSpec, NotifyListener, RequestChannel};
    use crate::config::RdsConfig;
    use crate::shutdown::ShutdownSignal;
    use crate::store::{Coordinate, ImageRecord, InMemoryImageStore};
    use crate::wire::envelope::Envelope;

    use super::{image_encoding, seed_area, DroneSimulator, RdsEmulator, COMMANDS, INFO, NOTIFICATIONS};

    fn record(file_name: &str) -> ImageRecord {
        ImageRecord {
            id: 1,
            session_id: 1,
            time_taken: Utc::now(),
            width: 0,
            height: 0,
            kind: "rgb".to_owned(),
            area: seed_area(),
            file_name: file_name.to_owned(),
        }
    }

    #[test]
    fn eta_counts_queue_and_rounds_up() {
        let simulator = DroneSimulator::new(Duration::from_millis(1_200));
        assert_eq!(simulator.eta_seconds(), 0);

        simulator.enqueue(record("a.jpg"));
        simulator.enqueue(record("b.jpg"));

        assert_eq!(simulator.pending(), 2);
        assert_eq!(simulator.eta_seconds(), 3);
    }

    #[test]
    fn simulator_captures_in_order_and_stops_on_shutdown() {
        let simulator = Arc::new(DroneSimulator::new(Duration::from_millis(20)));
        simulator.enqueue(record("a.jpg"));
        simulator.enqueue(record("b.jpg"));
        let shutdown = ShutdownSignal::new();
        let (tx, rx) = mpsc::channel();

        let drone = Arc::clone(&simulator);
        let signal = shutdown.clone();
        let handle = thread::spawn(move || {
            drone.run(&signal, Duration::from_millis(5), |image| {
                let _ = tx.send(image.file_name);
            });
        });

        let first = rx.recv_timeout(Duration::from_secs(5)).expect("first capture");
        let second = rx.recv_timeout(Duration::from_secs(5)).expect("second capture");
        shutdown.trigger();
        handle.join().expect("simulator thread should stop");

        assert_eq!((first.as_str(), second.as_str()), ("a.jpg", "b.jpg"));
        assert_eq!(simulator.eta_seconds(), 0);
    }

    #[test]
    fn encoding_follows_file_extension() {
        assert_eq!(image_encoding("/tmp/shot.JPG"), "jpg");
        assert_eq!(image_encoding("/tmp/shot"), "raw");
    }

    #[test]
    fn emulator_serves_commands_and_publishes_captures() {
        let image_path = std::env::temp_dir().join(format!("dronewire-rds-{}.png", std::process::id()));
        fs::write(&image_path, [0x89_u8, 0x50, 0x4E, 0x47]).expect("seed image should write");

        let (ctx, _sink) = test_context(Some(Duration::from_secs(2)));
        let rds = RdsEmulator::build(
            &RdsConfig {
                commands: "127.0.0.1:0".to_owned(),
                info: "127.0.0.1:0".to_owned(),
                notifications: "127.0.0.1:0".to_owned(),
                drone_id: "one".to_owned(),
                flying_time_ms: 1_000,
                seed_image_path: image_path.to_string_lossy().into_owned(),
            },
            ctx,
            Arc::new(InMemoryImageStore::new()),
        )
        .expect("emulator should build");
        rds.coordinator().start_all().expect("start");
        let addr = |channel: &str| rds.coordinator().local_addr(channel).expect("bound").to_string();

        let (client_ctx, _client_sink) = test_context(Some(Duration::from_secs(2)));
        let mut commands = RequestChannel::open(ChannelSpec::dial("commands", addr(COMMANDS)), client_ctx.clone())
            .expect("commands client");
        let mut info = RequestChannel::open(ChannelSpec::dial("info", addr(INFO)), client_ctx.clone())
            .expect("info client");
        let mut feed = NotifyListener::open(ChannelSpec::dial("feed", addr(NOTIFICATIONS)), client_ctx)
            .expect("feed");

        let mut elsewhere = seed_area();
        elsewhere.center = Coordinate::new(10.0, 10.0);
        let missing = commands
            .request(&Envelope::from_json("add_poi", json!({"coordinates": elsewhere})).expect("object"))
            .expect("reply");
        assert_eq!(missing.message(), Some("Something went wrong"));

        let queued = commands
            .request(&Envelope::from_json("add_poi", json!({"coordinates": seed_area()})).expect("object"))
            .expect("reply");
        assert_eq!(queued.message(), Some("Image added to queue"));

        let eta = info.request(&Envelope::call("queue_eta")).expect("reply");
        assert_eq!(eta.message(), Some("que_ETA"));
        assert_eq!(eta.argument.get("eta_seconds"), Some(&json!(1)));

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut captured = None;
        while captured.is_none() && Instant::now() < deadline {
            captured = feed.on_notify(|_| {}).expect("feed should poll");
        }
        let captured = captured.expect("capture should be published");

        assert_eq!(captured.function, "new_pic");
        assert_eq!(captured.argument.get("drone_id"), Some(&json!("one")));
        let binary = captured.binary.expect("image bytes attached");
        assert_eq!(binary.encoding, "png");
        assert_eq!(binary.bytes, vec![0x89, 0x50, 0x4E, 0x47]);

        rds.coordinator().stop_all();
        let _ = fs::remove_file(image_path);
    }
}
