use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

pub type ArgumentMap = Map<String, Value>;

pub const REPLY_FUNCTION: &str = "ack";
pub const ERROR_FUNCTION: &str = "error";
pub const MESSAGE_KEY: &str = "msg";
pub const ACK_MESSAGE: &str = "ack";
pub const NOTHING_HAPPENED_MESSAGE: &str = "nothing happened";

// Functions exchanged between the GUI, the IMM backend and the RDS.
pub const CONNECT_FUNCTION: &str = "connect";
pub const SET_AREA_FUNCTION: &str = "set_area";
pub const REQUEST_POI_FUNCTION: &str = "request_POI";
pub const GET_INFO_FUNCTION: &str = "get_info";
pub const SET_MODE_FUNCTION: &str = "set_mode";
pub const CLEAR_QUEUE_FUNCTION: &str = "clear_que";
pub const GUI_QUEUE_ETA_FUNCTION: &str = "que_ETA";
pub const QUIT_FUNCTION: &str = "quit";
pub const ADD_POI_FUNCTION: &str = "add_poi";
pub const QUEUE_ETA_FUNCTION: &str = "queue_eta";
pub const NEW_PIC_FUNCTION: &str = "new_pic";

/// Raw image bytes travelling as the second part of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryPayload {
    pub encoding: String,
    pub dimensions: Vec<u64>,
    pub bytes: Vec<u8>,
}

impl BinaryPayload {
    pub fn new(encoding: impl Into<String>, dimensions: Vec<u64>, bytes: Vec<u8>) -> Self {
        Self {
            encoding: encoding.into(),
            dimensions,
            bytes,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub function: String,
    pub argument: ArgumentMap,
    pub binary: Option<BinaryPayload>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    ArgumentMustBeObject,
    MissingArgument { key: String },
    InvalidArgument { key: String, reason: String },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArgumentMustBeObject => write!(f, "envelope argument must be a JSON object"),
            Self::MissingArgument { key } => write!(f, "missing argument '{key}'"),
            Self::InvalidArgument { key, reason } => {
                write!(f, "invalid argument '{key}': {reason}")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl Envelope {
    pub fn new(function: impl Into<String>, argument: ArgumentMap) -> Self {
        Self {
            function: function.into(),
            argument,
            binary: None,
        }
    }

    pub fn call(function: impl Into<String>) -> Self {
        Self::new(function, ArgumentMap::new())
    }

    /// Builds an envelope from a `json!` literal; the argument must be an object.
    pub fn from_json(function: impl Into<String>, argument: Value) -> Result<Self, EnvelopeError> {
        match argument {
            Value::Object(map) => Ok(Self::new(function, map)),
            Value::Null => Ok(Self::call(function)),
            _ => Err(EnvelopeError::ArgumentMustBeObject),
        }
    }

    /// Attaches a binary part. An empty payload is no binary part at all,
    /// since the wire never carries zero-length parts.
    pub fn with_binary(mut self, payload: BinaryPayload) -> Self {
        self.binary = (!payload.bytes.is_empty()).then_some(payload);
        self
    }

    pub fn reply(argument: ArgumentMap) -> Self {
        Self::new(REPLY_FUNCTION, argument)
    }

    pub fn message_reply(message: impl Into<String>) -> Self {
        Self::reply(message_argument(message))
    }

    pub fn ack() -> Self {
        Self::message_reply(ACK_MESSAGE)
    }

    pub fn nothing_happened() -> Self {
        Self::message_reply(NOTHING_HAPPENED_MESSAGE)
    }

    pub fn error(function: &str, message: impl Into<String>) -> Self {
        let mut argument = message_argument(message);
        argument.insert("function".to_owned(), Value::String(function.to_owned()));
        Self::new(ERROR_FUNCTION, argument)
    }

    pub fn is_reply(&self) -> bool {
        self.function == REPLY_FUNCTION
    }

    pub fn is_error(&self) -> bool {
        self.function == ERROR_FUNCTION
    }

    pub fn message(&self) -> Option<&str> {
        self.argument.get(MESSAGE_KEY).and_then(Value::as_str)
    }
}

pub fn message_argument(message: impl Into<String>) -> ArgumentMap {
    let mut argument = ArgumentMap::new();
    argument.insert(MESSAGE_KEY.to_owned(), Value::String(message.into()));
    argument
}

pub fn required<'a>(argument: &'a ArgumentMap, key: &str) -> Result<&'a Value, EnvelopeError> {
    argument.get(key).ok_or_else(|| EnvelopeError::MissingArgument {
        key: key.to_owned(),
    })
}

pub fn required_as<T: DeserializeOwned>(argument: &ArgumentMap, key: &str) -> Result<T, EnvelopeError> {
    let value = required(argument, key)?;
    serde_json::from_value(value.clone()).map_err(|source| EnvelopeError::InvalidArgument {
        key: key.to_owned(),
        reason: source.to_string(),
    })
}

pub fn optional_as<T: DeserializeOwned>(
    argument: &ArgumentMap,
    key: &str,
) -> Result<Option<T>, EnvelopeError> {
    match argument.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => required_as(argument, key).map(Some),
    }
}
