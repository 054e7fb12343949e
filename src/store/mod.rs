use std::fmt;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub long: f64,
}

impl Coordinate {
    pub fn new(lat: f64, long: f64) -> Self {
        Self { lat, long }
    }
}

/// Ground footprint of one image: four corners plus the center point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub up_left: Coordinate,
    pub up_right: Coordinate,
    pub down_left: Coordinate,
    pub down_right: Coordinate,
    pub center: Coordinate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DroneMode {
    #[serde(rename = "AUTO")]
    Auto,
    #[serde(rename = "MAN")]
    Manual,
}

impl DroneMode {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "man" | "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Manual => "MAN",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: u64,
    pub start_time: DateTime<Utc>,
    pub drone_mode: DroneMode,
}

/// What the caller knows about an image before it is stored.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageMetadata {
    pub session_id: u64,
    pub time_taken: DateTime<Utc>,
    pub width: u64,
    pub height: u64,
    /// Sensor type, e.g. `rgb` or `ir`.
    pub kind: String,
    pub area: Area,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ImageRecord {
    pub id: u64,
    pub session_id: u64,
    pub time_taken: DateTime<Utc>,
    pub width: u64,
    pub height: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub area: Area,
    pub file_name: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    UnknownSession { session_id: u64 },
    DuplicateFile { file_name: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSession { session_id } => write!(f, "session {session_id} does not exist"),
            Self::DuplicateFile { file_name } => {
                write!(f, "an image is already stored as '{file_name}'")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistence used by the message handlers. Every call is synchronous and
/// leaves the store unchanged when it fails.
pub trait ImageStore: Send + Sync {
    fn find_image_by_area(&self, area: &Area) -> Result<Option<ImageRecord>, StoreError>;

    fn insert_image(&self, metadata: ImageMetadata, file_reference: &str) -> Result<ImageRecord, StoreError>;

    fn insert_session(&self, drone_mode: DroneMode) -> Result<SessionRecord, StoreError>;
}

#[derive(Default)]
struct StoreState {
    sessions: Vec<SessionRecord>,
    images: Vec<ImageRecord>,
}

#[derive(Default)]
pub struct InMemoryImageStore {
    state: Mutex<StoreState>,
}

impl InMemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn images(&self) -> Vec<ImageRecord> {
        self.lock().images.clone()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().expect("image store lock poisoned")
    }
}

impl ImageStore for InMemoryImageStore {
    fn find_image_by_area(&self, area: &Area) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.lock().images.iter().find(|image| image.area == *area).cloned())
    }

    fn insert_image(&self, metadata: ImageMetadata, file_reference: &str) -> Result<ImageRecord, StoreError> {
        let mut state = self.lock();
        if !state
            .sessions
            .iter()
            .any(|session| session.id == metadata.session_id)
        {
            return Err(StoreError::UnknownSession {
                session_id: metadata.session_id,
            });
        }
        if state.images.iter().any(|image| image.file_name == file_reference) {
            return Err(StoreError::DuplicateFile {
                file_name: file_reference.to_owned(),
            });
        }

        let record = ImageRecord {
            id: state.images.len() as u64 + 1,
            session_id: metadata.session_id,
            time_taken: metadata.time_taken,
            width: metadata.width,
            height: metadata.height,
            kind: metadata.kind,
            area: metadata.area,
            file_name: file_reference.to_owned(),
        };
        state.images.push(record.clone());
        Ok(record)
    }

    fn insert_session(&self, drone_mode: DroneMode) -> Result<SessionRecord, StoreError> {
        let mut state = self.lock();
        let record = SessionRecord {
            id: state.sessions.len() as u64 + 1,
            start_time: Utc::now(),
            drone_mode,
        };
        state.sessions.push(record.clone());
        Ok(record)
    }
}

impl fmt::Debug for InMemoryImageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryImageStore")
            .field("sessions", &state.sessions.len())
            .field("images", &state.images.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{
        Area, Coordinate, DroneMode, ImageMetadata, ImageStore, InMemoryImageStore, StoreError,
    };

    fn area(lat: f64) -> Area {
        Area {
            up_left: Coordinate::new(lat + 1.0, 16.0),
            up_right: Coordinate::new(lat, 16.0),
            down_left: Coordinate::new(lat, 16.0),
            down_right: Coordinate::new(lat, 16.0),
            center: Coordinate::new(lat, 16.0),
        }
    }

    fn metadata(session_id: u64, lat: f64) -> ImageMetadata {
        ImageMetadata {
            session_id,
            time_taken: Utc::now(),
            width: 640,
            height: 480,
            kind: "rgb".to_owned(),
            area: area(lat),
        }
    }

    #[test]
    fn area_uses_wire_field_names() {
        let parsed: Area = serde_json::from_value(json!({
            "up_left": {"lat": 59, "long": 16},
            "up_right": {"lat": 58, "long": 16},
            "down_left": {"lat": 58, "long": 16},
            "down_right": {"lat": 58, "long": 16},
            "center": {"lat": 58, "long": 16}
        }))
        .expect("area should parse");

        assert_eq!(parsed, area(58.0));
    }

    #[test]
    fn images_require_existing_session_and_unique_file() {
        let store = InMemoryImageStore::new();
        assert_eq!(
            store.insert_image(metadata(1, 58.0), "one.jpg"),
            Err(StoreError::UnknownSession { session_id: 1 })
        );

        let session = store.insert_session(DroneMode::Auto).expect("session");
        let image = store
            .insert_image(metadata(session.id, 58.0), "one.jpg")
            .expect("image should store");
        assert_eq!(image.id, 1);
        assert_eq!(
            store.insert_image(metadata(session.id, 57.0), "one.jpg"),
            Err(StoreError::DuplicateFile {
                file_name: "one.jpg".to_owned()
            })
        );
        assert_eq!(store.images().len(), 1);
    }

    #[test]
    fn finds_images_by_exact_area() {
        let store = InMemoryImageStore::new();
        let session = store.insert_session(DroneMode::Manual).expect("session");
        store
            .insert_image(metadata(session.id, 58.0), "one.jpg")
            .expect("image should store");

        let found = store.find_image_by_area(&area(58.0)).expect("lookup");
        assert_eq!(found.map(|image| image.file_name), Some("one.jpg".to_owned()));
        assert_eq!(store.find_image_by_area(&area(10.0)).expect("lookup"), None);
    }

    #[test]
    fn records_serialize_with_timestamps() {
        let store = InMemoryImageStore::new();
        let session = store.insert_session(DroneMode::Auto).expect("session");
        let image = store
            .insert_image(metadata(session.id, 58.0), "one.jpg")
            .expect("image should store");

        let session_json = serde_json::to_value(&session).expect("session should serialize");
        assert_eq!(session_json["drone_mode"], json!("AUTO"));
        assert!(session_json["start_time"].is_string());

        let image_json = serde_json::to_value(&image).expect("image should serialize");
        assert_eq!(image_json["type"], json!("rgb"));
        assert!(image_json["time_taken"].is_string());
    }

    #[test]
    fn drone_mode_parses_config_spellings() {
        assert_eq!(DroneMode::from_config_value("auto"), Some(DroneMode::Auto));
        assert_eq!(DroneMode::from_config_value("MAN"), Some(DroneMode::Manual));
        assert_eq!(DroneMode::from_config_value("hover"), None);
        assert_eq!(DroneMode::Manual.as_str(), "MAN");
    }
}
