use std::fmt;
use std::io::{self, Cursor, Read, Write};

use serde_json::{Map, Value};

use crate::config::AppConfig;
use crate::wire::envelope::{ArgumentMap, BinaryPayload, Envelope};

pub const FRAME_HEADER_SIZE_BYTES: usize = 4;
pub const DEFAULT_MAX_FRAME_SIZE_BYTES: usize = 16 * 1024 * 1024;

const FUNCTION_KEY: &str = "fcn";
const ARGUMENT_KEY: &str = "arg";
const BINARY_KEY: &str = "bin";
const ENCODING_KEY: &str = "encoding";
const DIMENSIONS_KEY: &str = "dimensions";
const LENGTH_KEY: &str = "len";

#[derive(Debug)]
pub enum CodecError {
    Io(io::Error),
    ZeroLengthFrame,
    FrameTooLarge { size: usize, limit: usize },
    Truncated,
    TrailingData { bytes: usize },
    BodyNotJson(serde_json::Error),
    BodyMustBeObject,
    MissingFunction,
    FunctionMustBeString,
    ArgumentMustBeObject,
    InvalidBinaryHeader { reason: &'static str },
    BinaryLengthMismatch { declared: usize, actual: usize },
    Encode(serde_json::Error),
}

impl CodecError {
    /// Errors raised after a complete message was consumed; the stream is
    /// still aligned on a message boundary.
    ///
    /// An unusable `bin` header is not among them: the reader cannot tell
    /// whether a binary part follows, so the stream is lost.
    pub fn is_malformed_envelope(&self) -> bool {
        matches!(
            self,
            Self::Truncated
                | Self::TrailingData { .. }
                | Self::BodyNotJson(_)
                | Self::BodyMustBeObject
                | Self::MissingFunction
                | Self::FunctionMustBeString
                | Self::ArgumentMustBeObject
                | Self::BinaryLengthMismatch { .. }
        )
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "transport io error: {source}"),
            Self::ZeroLengthFrame => write!(f, "frame length cannot be zero"),
            Self::FrameTooLarge { size, limit } => {
                write!(f, "frame size {size} exceeds limit {limit}")
            }
            Self::Truncated => write!(f, "message ended before all declared parts were read"),
            Self::TrailingData { bytes } => {
                write!(f, "{bytes} trailing bytes after the last message part")
            }
            Self::BodyNotJson(source) => write!(f, "message body is not valid JSON: {source}"),
            Self::BodyMustBeObject => write!(f, "message body must be a JSON object"),
            Self::MissingFunction => write!(f, "message body is missing '{FUNCTION_KEY}'"),
            Self::FunctionMustBeString => write!(f, "'{FUNCTION_KEY}' must be a string"),
            Self::ArgumentMustBeObject => write!(f, "'{ARGUMENT_KEY}' must be a JSON object"),
            Self::InvalidBinaryHeader { reason } => {
                write!(f, "invalid '{BINARY_KEY}' metadata: {reason}")
            }
            Self::BinaryLengthMismatch { declared, actual } => write!(
                f,
                "binary part length mismatch: declared {declared} bytes, received {actual} bytes"
            ),
            Self::Encode(source) => write!(f, "failed to encode message body: {source}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<io::Error> for CodecError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_frame_size_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_frame_size_bytes: DEFAULT_MAX_FRAME_SIZE_BYTES,
        }
    }
}

struct BinaryHeader {
    encoding: String,
    dimensions: Vec<u64>,
    len: usize,
}

/// Multipart framing for [`Envelope`]s.
///
/// Each part is a 4-byte big-endian length followed by the part bytes. The
/// first part is the JSON body; when the body carries `bin` metadata exactly
/// one more part with the raw bytes follows.
#[derive(Clone, Debug)]
pub struct WireCodec {
    config: CodecConfig,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self::new(CodecConfig {
            max_frame_size_bytes: app_config.transport.max_frame_size_bytes as usize,
        })
    }

    pub fn max_frame_size_bytes(&self) -> usize {
        self.config.max_frame_size_bytes
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let mut encoded = Vec::new();
        self.write_envelope(&mut encoded, envelope)?;
        Ok(encoded)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        let mut cursor = Cursor::new(bytes);
        let envelope = self.read_envelope(&mut cursor).map_err(|error| match error {
            CodecError::Io(source) if source.kind() == io::ErrorKind::UnexpectedEof => {
                CodecError::Truncated
            }
            other => other,
        })?;

        let consumed = cursor.position() as usize;
        if consumed != bytes.len() {
            return Err(CodecError::TrailingData {
                bytes: bytes.len() - consumed,
            });
        }

        Ok(envelope)
    }

    /// Writes the body part and, if present, the binary part. Nothing is
    /// written when the body cannot be encoded. An empty binary payload is
    /// written as a body-only message.
    pub fn write_envelope<W: Write>(&self, writer: &mut W, envelope: &Envelope) -> Result<(), CodecError> {
        let body = self.encode_body(envelope)?;
        self.check_frame_len(body.len())?;
        let binary = sendable_binary(envelope);
        if let Some(binary) = binary {
            self.check_frame_len(binary.bytes.len())?;
        }

        write_frame(writer, &body)?;
        if let Some(binary) = binary {
            write_frame(writer, &binary.bytes)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads one complete message. The `bin` header is checked first and the
    /// binary part is consumed before the rest of the body is validated, so
    /// a malformed message never leaves the reader mid-message.
    pub fn read_envelope<R: Read>(&self, reader: &mut R) -> Result<Envelope, CodecError> {
        let body = self.read_frame(reader)?;
        let (fields, header) = split_body(&body)?;

        let binary = match header {
            Some(header) => Some(self.read_binary_part(reader, header)?),
            None => None,
        };

        let mut envelope = envelope_from_fields(fields)?;
        envelope.binary = binary;
        Ok(envelope)
    }

    pub fn encode_body(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let mut body = Map::new();
        body.insert(FUNCTION_KEY.to_owned(), Value::String(envelope.function.clone()));
        body.insert(
            ARGUMENT_KEY.to_owned(),
            Value::Object(envelope.argument.clone()),
        );

        if let Some(binary) = sendable_binary(envelope) {
            let mut header = Map::new();
            header.insert(ENCODING_KEY.to_owned(), Value::String(binary.encoding.clone()));
            header.insert(
                DIMENSIONS_KEY.to_owned(),
                Value::Array(binary.dimensions.iter().map(|d| Value::from(*d)).collect()),
            );
            header.insert(LENGTH_KEY.to_owned(), Value::from(binary.bytes.len() as u64));
            body.insert(BINARY_KEY.to_owned(), Value::Object(header));
        }

        serde_json::to_vec(&Value::Object(body)).map_err(CodecError::Encode)
    }

    fn read_binary_part<R: Read>(&self, reader: &mut R, header: BinaryHeader) -> Result<BinaryPayload, CodecError> {
        let bytes = match self.read_frame(reader) {
            Ok(bytes) => bytes,
            Err(CodecError::Io(source)) if source.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(CodecError::Truncated);
            }
            Err(error) => return Err(error),
        };
        if bytes.len() != header.len {
            return Err(CodecError::BinaryLengthMismatch {
                declared: header.len,
                actual: bytes.len(),
            });
        }

        Ok(BinaryPayload {
            encoding: header.encoding,
            dimensions: header.dimensions,
            bytes,
        })
    }

    fn read_frame<R: Read>(&self, reader: &mut R) -> Result<Vec<u8>, CodecError> {
        let mut header = [0_u8; FRAME_HEADER_SIZE_BYTES];
        reader.read_exact(&mut header)?;

        let declared_len = u32::from_be_bytes(header) as usize;
        self.check_frame_len(declared_len)?;

        let mut frame = vec![0_u8; declared_len];
        reader.read_exact(&mut frame)?;
        Ok(frame)
    }

    fn check_frame_len(&self, len: usize) -> Result<(), CodecError> {
        if len == 0 {
            return Err(CodecError::ZeroLengthFrame);
        }
        if len > self.config.max_frame_size_bytes {
            return Err(CodecError::FrameTooLarge {
                size: len,
                limit: self.config.max_frame_size_bytes,
            });
        }
        Ok(())
    }
}

fn write_frame<W: Write>(writer: &mut W, part: &[u8]) -> io::Result<()> {
    let len = part.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(part)
}

fn sendable_binary(envelope: &Envelope) -> Option<&BinaryPayload> {
    envelope
        .binary
        .as_ref()
        .filter(|binary| !binary.bytes.is_empty())
}

/// Parses the body and pulls out the `bin` header. A body that is not a JSON
/// object cannot announce a binary part, so none is expected after it.
fn split_body(body: &[u8]) -> Result<(Map<String, Value>, Option<BinaryHeader>), CodecError> {
    let value: Value = serde_json::from_slice(body).map_err(CodecError::BodyNotJson)?;
    let Value::Object(mut fields) = value else {
        return Err(CodecError::BodyMustBeObject);
    };

    let header = fields.remove(BINARY_KEY).map(parse_binary_header).transpose()?;
    Ok((fields, header))
}

fn envelope_from_fields(mut fields: Map<String, Value>) -> Result<Envelope, CodecError> {
    let function = match fields.remove(FUNCTION_KEY) {
        Some(Value::String(function)) => function,
        Some(_) => return Err(CodecError::FunctionMustBeString),
        None => return Err(CodecError::MissingFunction),
    };

    let argument = match fields.remove(ARGUMENT_KEY) {
        Some(Value::Object(argument)) => argument,
        None | Some(Value::Null) => ArgumentMap::new(),
        Some(_) => return Err(CodecError::ArgumentMustBeObject),
    };

    Ok(Envelope::new(function, argument))
}

fn parse_binary_header(value: Value) -> Result<BinaryHeader, CodecError> {
    let Value::Object(fields) = value else {
        return Err(CodecError::InvalidBinaryHeader {
            reason: "must be an object",
        });
    };

    let encoding = fields
        .get(ENCODING_KEY)
        .and_then(Value::as_str)
        .ok_or(CodecError::InvalidBinaryHeader {
            reason: "'encoding' must be a string",
        })?
        .to_owned();

    let dimensions = fields
        .get(DIMENSIONS_KEY)
        .and_then(Value::as_array)
        .ok_or(CodecError::InvalidBinaryHeader {
            reason: "'dimensions' must be an array",
        })?
        .iter()
        .map(|dimension| {
            dimension.as_u64().ok_or(CodecError::InvalidBinaryHeader {
                reason: "'dimensions' entries must be unsigned integers",
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let len = fields
        .get(LENGTH_KEY)
        .and_then(Value::as_u64)
        .ok_or(CodecError::InvalidBinaryHeader {
            reason: "'len' must be an unsigned integer",
        })? as usize;

    Ok(BinaryHeader {
        encoding,
        dimensions,
        len,
    })
}
