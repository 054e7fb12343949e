use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::channel::{ChannelSpec, TransportContext};
use crate::config::ImmConfig;
use crate::coordinator::ThreadCoordinator;
use crate::dispatch::DispatchTable;
use crate::logging::Logger;
use crate::queue::OutboundQueue;
use crate::store::{Area, DroneMode, ImageMetadata, ImageStore, SessionRecord};
use crate::wire::envelope::{
    message_argument, optional_as, required, required_as, ArgumentMap, BinaryPayload, Envelope,
    ADD_POI_FUNCTION, GUI_QUEUE_ETA_FUNCTION, NEW_PIC_FUNCTION, QUEUE_ETA_FUNCTION,
    REQUEST_POI_FUNCTION,
};
use crate::worker::WorkerSpec;

use super::{reject, RoleError};

pub const GUI_REQUESTS: &str = "gui_requests";
pub const GUI_NOTIFICATIONS: &str = "gui_notifications";
pub const RDS_COMMANDS: &str = "rds_commands";
pub const RDS_INFO: &str = "rds_info";
pub const RDS_NOTIFICATIONS: &str = "rds_notifications";

const LOG_CONTEXT: &str = "role::imm";

/// Ground-station backend: answers the GUI, forwards work to the relay and
/// relays new images back to the GUI.
#[derive(Debug)]
pub struct ImmBackend {
    coordinator: ThreadCoordinator,
    session: SessionRecord,
}

impl ImmBackend {
    pub fn build(
        config: &ImmConfig,
        ctx: TransportContext,
        store: Arc<dyn ImageStore>,
    ) -> Result<Self, RoleError> {
        let drone_mode = DroneMode::from_config_value(&config.drone_mode).ok_or_else(|| {
            RoleError::InvalidSetting {
                key: "imm.drone_mode",
                value: config.drone_mode.clone(),
            }
        })?;
        let session = store.insert_session(drone_mode)?;
        let logger = Arc::clone(ctx.logger());
        let coordinator = ThreadCoordinator::new("imm", ctx);

        let rds_commands = OutboundQueue::new(RDS_COMMANDS);
        let rds_info = OutboundQueue::new(RDS_INFO);
        let gui_notifications = OutboundQueue::new(GUI_NOTIFICATIONS);

        let gui_table = gui_request_table(
            config.client_id,
            rds_commands.clone(),
            rds_info.clone(),
            Arc::clone(&logger),
        )?;
        let relay_table = relay_notification_table(
            session.id,
            store,
            gui_notifications.clone(),
            Arc::clone(&logger),
        )?;

        coordinator.add_worker(
            WorkerSpec::new(GUI_REQUESTS)
                .respond(ChannelSpec::listen(GUI_REQUESTS, &config.gui_requests), Arc::new(gui_table)),
        )?;
        coordinator.add_worker(WorkerSpec::new(GUI_NOTIFICATIONS).forward_notifications(
            ChannelSpec::listen(GUI_NOTIFICATIONS, &config.gui_notifications),
            gui_notifications.clone(),
        ))?;
        coordinator.add_worker(
            WorkerSpec::new(RDS_COMMANDS)
                .forward_requests(ChannelSpec::dial(RDS_COMMANDS, &config.rds_commands), rds_commands),
        )?;
        coordinator.add_worker(
            WorkerSpec::new(RDS_INFO)
                .forward_requests(ChannelSpec::dial(RDS_INFO, &config.rds_info), rds_info)
                .on_reply(move |sent, reply| relay_eta(&gui_notifications, &logger, sent, reply)),
        )?;
        coordinator.add_worker(WorkerSpec::new(RDS_NOTIFICATIONS).receive_notifications(
            ChannelSpec::dial(RDS_NOTIFICATIONS, &config.rds_notifications),
            Arc::new(relay_table),
        ))?;

        Ok(Self {
            coordinator,
            session,
        })
    }

    pub fn coordinator(&self) -> &ThreadCoordinator {
        &self.coordinator
    }

    pub fn session(&self) -> &SessionRecord {
        &self.session
    }
}

fn gui_request_table(
    client_id: i64,
    rds_commands: OutboundQueue,
    rds_info: OutboundQueue,
    logger: Arc<Logger>,
) -> Result<DispatchTable, RoleError> {
    let mut table = DispatchTable::new(GUI_REQUESTS, logger);
    // Priority requests without an explicit id get a process-unique one.
    let next_priority_id = AtomicU64::new(1);

    table.register(REQUEST_POI_FUNCTION, move |argument| {
        let coordinates = required(argument, "coordinates").map_err(reject)?.clone();
        let prio = optional_as::<bool>(argument, "prio").map_err(reject)?.unwrap_or(false);
        let force_que_id = match optional_as::<u64>(argument, "force_que_id").map_err(reject)? {
            Some(id) => id,
            None if prio => next_priority_id.fetch_add(1, Ordering::Relaxed),
            None => 0,
        };

        let mut forwarded = ArgumentMap::new();
        forwarded.insert("client_id".to_owned(), json!(client_id));
        forwarded.insert("force_que_id".to_owned(), json!(force_que_id));
        forwarded.insert("coordinates".to_owned(), coordinates);
        rds_commands
            .push(Envelope::new(ADD_POI_FUNCTION, forwarded))
            .map_err(reject)?;
        Ok(Some(message_argument("Poi added")))
    })?;

    table.register(GUI_QUEUE_ETA_FUNCTION, move |_| {
        rds_info
            .push(Envelope::call(QUEUE_ETA_FUNCTION))
            .map_err(reject)?;
        Ok(Some(message_argument("ETA requested")))
    })?;

    Ok(table)
}

/// Images captured in the same millisecond still get distinct names.
fn file_reference(drone_id: &str, time_taken: DateTime<Utc>, extension: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{drone_id}-{}-{}.{extension}",
        time_taken.format("%Y%m%dT%H%M%S%.3f"),
        &suffix[..8]
    )
}

fn relay_notification_table(
    session_id: u64,
    store: Arc<dyn ImageStore>,
    gui_notifications: OutboundQueue,
    logger: Arc<Logger>,
) -> Result<DispatchTable, RoleError> {
    let mut table = DispatchTable::new(RDS_NOTIFICATIONS, logger);

    table.register_with_payload(NEW_PIC_FUNCTION, move |argument, binary| {
        let area: Area = required_as(argument, "coordinates").map_err(reject)?;
        let kind = optional_as::<String>(argument, "type")
            .map_err(reject)?
            .unwrap_or_else(|| "rgb".to_owned());
        let drone_id = optional_as::<String>(argument, "drone_id")
            .map_err(reject)?
            .unwrap_or_else(|| "unknown".to_owned());

        let time_taken = Utc::now();
        let (width, height) = binary.map(image_size).unwrap_or((0, 0));
        let extension = binary.map_or("img", |payload| payload.encoding.as_str());
        let file_reference = file_reference(&drone_id, time_taken, extension);

        let image = store
            .insert_image(
                ImageMetadata {
                    session_id,
                    time_taken,
                    width,
                    height,
                    kind,
                    area,
                },
                &file_reference,
            )
            .map_err(reject)?;

        let mut notice = ArgumentMap::new();
        notice.insert("image_id".to_owned(), json!(image.id));
        notice.insert("type".to_owned(), json!(image.kind));
        notice.insert("coordinates".to_owned(), json!(image.area));
        gui_notifications
            .push(Envelope::new(NEW_PIC_FUNCTION, notice))
            .map_err(reject)?;

        let mut stored = ArgumentMap::new();
        stored.insert("image_id".to_owned(), json!(image.id));
        Ok(Some(stored))
    })?;

    Ok(table)
}

/// Array shapes arrive as `[rows, columns, ...]`.
fn image_size(payload: &BinaryPayload) -> (u64, u64) {
    match payload.dimensions.as_slice() {
        [height, width, ..] => (*width, *height),
        _ => (0, 0),
    }
}

fn relay_eta(gui_notifications: &OutboundQueue, logger: &Logger, sent: &Envelope, reply: &Envelope) {
    if sent.function != QUEUE_ETA_FUNCTION {
        return;
    }
    let Some(eta) = reply.argument.get("eta_seconds").and_then(Value::as_u64) else {
        logger.warn(Some(LOG_CONTEXT), "relay answered queue_eta without eta_seconds");
        return;
    };

    let mut argument = ArgumentMap::new();
    argument.insert("eta_seconds".to_owned(), json!(eta));
    if let Err(error) = gui_notifications.push(Envelope::new(GUI_QUEUE_ETA_FUNCTION, argument)) {
        logger.debug(Some(LOG_CONTEXT), &error.to_string());
    }
}
