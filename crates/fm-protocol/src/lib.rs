// fm-protocol: Sensor telemetry wire format.
//
// Every message on the ingestion socket is a 4-byte little-endian length
// followed by that many bytes of UTF-8 JSON.  The JSON object maps a column
// name to either a scalar or an array of scalars; arrays are zipped
// positionally so a single message may carry a batch of samples.

use serde_json::{Map, Value};

/// Size of the length prefix in front of every payload.
pub const HEADER_LEN: usize = 4;

/// Column names of a record, in table order.
pub const COLUMNS: [&str; 3] = [TIMESTAMP, TEMP, RH];

pub const TIMESTAMP: &str = "timestamp";
pub const TEMP: &str = "temp";
pub const RH: &str = "rh";

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One sensor sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Device-reported timestamp; kept exactly as received.
    ///
    /// Numeric timestamps are stored as their JSON text.
    pub timestamp: String,
    /// Temperature in degrees Celsius.
    pub temp: f64,
    /// Relative humidity in percent.
    pub rh: f64,
}

impl Record {
    pub fn new(timestamp: impl Into<String>, temp: f64, rh: f64) -> Self {
        Record {
            timestamp: timestamp.into(),
            temp,
            rh,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload of {0} bytes does not fit a 4-byte length prefix")]
    PayloadTooLarge(usize),
}

/// Reasons a payload is rejected.  A rejected payload appends nothing.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("payload is missing column '{0}'")]
    MissingColumn(&'static str),
    #[error("column '{column}' has {found} values, expected {expected}")]
    LengthMismatch {
        column: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("column '{column}' value {index} is {found}, expected {expected}")]
    InvalidValue {
        column: &'static str,
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Decode the payload length announced by a frame header.
pub fn decode_header(header: [u8; HEADER_LEN]) -> u32 {
    u32::from_le_bytes(header)
}

/// Prefix `payload` with its little-endian length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// A decoded payload: the records it carries plus any keys that were not
/// record columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub records: Vec<Record>,
    pub ignored_keys: Vec<String>,
}

/// Decode a JSON payload into records.
///
/// Scalar values are treated as one-element arrays.  All three columns must
/// be present and carry the same number of values; anything else rejects the
/// whole payload.  Keys other than the record columns are ignored.
pub fn decode_payload(bytes: &[u8]) -> Result<Payload, PayloadError> {
    let text = std::str::from_utf8(bytes)?;
    let value: Value = serde_json::from_str(text)?;
    let object = match value {
        Value::Object(map) => map,
        other => return Err(PayloadError::NotAnObject(type_name(&other))),
    };

    let timestamps = column(&object, TIMESTAMP)?;
    let temps = column(&object, TEMP)?;
    let rhs = column(&object, RH)?;

    let rows = timestamps.len();
    for (name, values) in [(TEMP, &temps), (RH, &rhs)] {
        if values.len() != rows {
            return Err(PayloadError::LengthMismatch {
                column: name,
                expected: rows,
                found: values.len(),
            });
        }
    }

    let mut records = Vec::with_capacity(rows);
    for (index, ((ts, temp), rh)) in timestamps.iter().zip(&temps).zip(&rhs).enumerate() {
        records.push(Record {
            timestamp: timestamp_text(ts, index)?,
            temp: number(temp, TEMP, index)?,
            rh: number(rh, RH, index)?,
        });
    }

    let ignored_keys = object
        .keys()
        .filter(|k| !COLUMNS.contains(&k.as_str()))
        .cloned()
        .collect();

    Ok(Payload {
        records,
        ignored_keys,
    })
}

/// Encode records as a column-oriented JSON payload (arrays per column).
pub fn encode_payload(records: &[Record]) -> Vec<u8> {
    let timestamps: Vec<Value> = records
        .iter()
        .map(|r| Value::String(r.timestamp.clone()))
        .collect();
    let temps: Vec<Value> = records.iter().map(|r| Value::from(r.temp)).collect();
    let rhs: Vec<Value> = records.iter().map(|r| Value::from(r.rh)).collect();

    let mut map = Map::new();
    map.insert(TIMESTAMP.to_owned(), Value::Array(timestamps));
    map.insert(TEMP.to_owned(), Value::Array(temps));
    map.insert(RH.to_owned(), Value::Array(rhs));
    Value::Object(map).to_string().into_bytes()
}

fn column<'a>(object: &'a Map<String, Value>, name: &'static str) -> Result<Vec<&'a Value>, PayloadError> {
    match object.get(name) {
        None => Err(PayloadError::MissingColumn(name)),
        Some(Value::Array(values)) => Ok(values.iter().collect()),
        Some(scalar) => Ok(vec![scalar]),
    }
}

fn timestamp_text(value: &Value, index: usize) -> Result<String, PayloadError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(PayloadError::InvalidValue {
            column: TIMESTAMP,
            index,
            expected: "string or number",
            found: type_name(other),
        }),
    }
}

fn number(value: &Value, column: &'static str, index: usize) -> Result<f64, PayloadError> {
    value.as_f64().ok_or(PayloadError::InvalidValue {
        column,
        index,
        expected: "number",
        found: type_name(value),
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
