//! Length-prefixed frame codec
//!
//! A frame is `[part_count][size_1]..[size_n][part_1]..[part_n]`, every count
//! and size a big-endian `u32`. The first part is a one-byte kind
//! discriminator, so a command tag can never be mistaken for data.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::command::{Command, TAG_LEN};

/// Width of the part count and of every part size
pub const SIZE_PREFIX_LEN: usize = 4;

/// Largest payload accepted in a single frame (128 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 128 * 1024 * 1024;

/// Largest part count accepted in a single frame
pub const DEFAULT_MAX_PARTS: usize = 65_536;

/// Deepest list nesting accepted in a single frame
pub const DEFAULT_MAX_DEPTH: usize = 64;

mod kind {
    pub const COMMAND: u8 = 0;
    pub const NONE: u8 = 1;
    pub const BYTES: u8 = 2;
    pub const TEXT: u8 = 3;
    pub const BOOL: u8 = 4;
    pub const INT: u8 = 5;
    pub const FLOAT: u8 = 6;
    pub const LIST: u8 = 7;
    pub const ARRAY: u8 = 8;
}

/// Errors raised while encoding a message
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A part does not fit the size prefix
    #[error("part of {len} bytes exceeds the size prefix range")]
    PartTooLarge { len: usize },

    /// A frame holds more parts than the count prefix can express
    #[error("frame with {count} parts exceeds the size prefix range")]
    TooManyParts { count: usize },

    /// Array data length disagrees with its shape and element type
    #[error("array of {dtype} with shape {shape:?} needs {expected} bytes, got {actual}")]
    ShapeMismatch {
        dtype: DType,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    /// Element count of a shape overflows `usize`
    #[error("array shape {0:?} is too large")]
    ShapeOverflow(Vec<usize>),
}

/// Errors raised while decoding a frame. All of them are connection-fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame holds no parts")]
    EmptyFrame,

    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unknown value kind {0}")]
    UnknownKind(u8),

    #[error("unknown command tag {0:?}")]
    UnknownCommand(String),

    #[error("unknown array dtype code {0}")]
    UnknownDType(u8),

    #[error("malformed {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },

    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("frame declares {count} parts, limit is {limit}")]
    TooManyParts { count: usize, limit: usize },

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    #[error("lists nested deeper than {limit} levels")]
    TooDeep { limit: usize },
}

impl DecodeError {
    fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::InvalidPayload {
            kind,
            reason: reason.into(),
        }
    }
}

/// Element type of a numeric array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    pub const fn code(self) -> u8 {
        match self {
            DType::Bool => 0,
            DType::U8 => 1,
            DType::I32 => 2,
            DType::I64 => 3,
            DType::F32 => 4,
            DType::F64 => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<DType> {
        match code {
            0 => Some(DType::Bool),
            1 => Some(DType::U8),
            2 => Some(DType::I32),
            3 => Some(DType::I64),
            4 => Some(DType::F32),
            5 => Some(DType::F64),
            _ => None,
        }
    }

    /// Size of one element in bytes
    pub const fn size(self) -> usize {
        match self {
            DType::Bool | DType::U8 => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rectangular numeric array, elements stored little-endian in row-major order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl NdArray {
    /// Build an array from raw element bytes, checking them against the shape
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, EncodeError> {
        let expected = shape
            .iter()
            .try_fold(dtype.size(), |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| EncodeError::ShapeOverflow(shape.clone()))?;
        if expected != data.len() {
            return Err(EncodeError::ShapeMismatch {
                dtype,
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Result<Self, EncodeError> {
        Self::new(DType::F64, shape, values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, EncodeError> {
        Self::new(DType::F32, shape, values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub fn from_i64(shape: Vec<usize>, values: &[i64]) -> Result<Self, EncodeError> {
        Self::new(DType::I64, shape, values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub fn from_i32(shape: Vec<usize>, values: &[i32]) -> Result<Self, EncodeError> {
        Self::new(DType::I32, shape, values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub fn from_u8(shape: Vec<usize>, values: &[u8]) -> Result<Self, EncodeError> {
        Self::new(DType::U8, shape, values.to_vec())
    }

    pub fn from_bool(shape: Vec<usize>, values: &[bool]) -> Result<Self, EncodeError> {
        Self::new(DType::Bool, shape, values.iter().map(|v| u8::from(*v)).collect())
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Elements widened to `f64`. 64-bit integers beyond 2^53 lose precision.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        let chunks = self.data.chunks_exact(self.dtype.size());
        match self.dtype {
            DType::Bool | DType::U8 => self.data.iter().map(|b| f64::from(*b)).collect(),
            DType::I32 => chunks
                .map(|c| f64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
            DType::F32 => chunks
                .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
            DType::I64 => chunks
                .map(|c| i64::from_le_bytes(eight(c)) as f64)
                .collect(),
            DType::F64 => chunks.map(|c| f64::from_le_bytes(eight(c))).collect(),
        }
    }
}

fn eight(chunk: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&chunk[..8]);
    out
}

/// Every value the protocol can carry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    None,
    Bytes(Vec<u8>),
    Text(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    List(Vec<WireValue>),
    Array(NdArray),
}

impl WireValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            WireValue::None => "none",
            WireValue::Bytes(_) => "bytes",
            WireValue::Text(_) => "text",
            WireValue::Bool(_) => "bool",
            WireValue::Int(_) => "int",
            WireValue::Float(_) => "float",
            WireValue::List(_) => "list",
            WireValue::Array(_) => "array",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, WireValue::None)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            WireValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            WireValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            WireValue::Float(value) => Some(*value),
            WireValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            WireValue::Array(array) => Some(array),
            _ => None,
        }
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        WireValue::Text(value.to_owned())
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        WireValue::Text(value)
    }
}

impl From<bool> for WireValue {
    fn from(value: bool) -> Self {
        WireValue::Bool(value)
    }
}

impl From<i64> for WireValue {
    fn from(value: i64) -> Self {
        WireValue::Int(value)
    }
}

impl From<i32> for WireValue {
    fn from(value: i32) -> Self {
        WireValue::Int(i64::from(value))
    }
}

impl From<u32> for WireValue {
    fn from(value: u32) -> Self {
        WireValue::Int(i64::from(value))
    }
}

impl From<f64> for WireValue {
    fn from(value: f64) -> Self {
        WireValue::Float(value)
    }
}

impl From<NdArray> for WireValue {
    fn from(value: NdArray) -> Self {
        WireValue::Array(value)
    }
}

impl From<Vec<WireValue>> for WireValue {
    fn from(value: Vec<WireValue>) -> Self {
        WireValue::List(value)
    }
}

impl<T: Into<WireValue>> From<Option<T>> for WireValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(WireValue::None, Into::into)
    }
}

/// One decoded frame: either a control token or a value
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command(Command),
    Value(WireValue),
}

impl Message {
    /// Short description used in protocol errors
    pub fn describe(&self) -> String {
        match self {
            Message::Command(command) => format!("command '{}'", command),
            Message::Value(value) => format!("{} value", value.kind_name()),
        }
    }

    pub fn is_command(&self, command: Command) -> bool {
        matches!(self, Message::Command(c) if *c == command)
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Message::Command(command)
    }
}

impl From<WireValue> for Message {
    fn from(value: WireValue) -> Self {
        Message::Value(value)
    }
}

/// Bounds applied to incoming frames before any payload is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_frame_bytes: usize,
    pub max_parts: usize,
    /// Lists may hold lists up to this many levels
    pub max_depth: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_parts: DEFAULT_MAX_PARTS,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl FrameLimits {
    /// List elements are already bounded in size by their enclosing part;
    /// only the nesting depth carries over.
    fn for_elements(&self) -> FrameLimits {
        FrameLimits {
            max_frame_bytes: usize::MAX,
            max_parts: usize::MAX,
            max_depth: self.max_depth,
        }
    }

    pub fn check_parts(&self, count: usize) -> Result<(), DecodeError> {
        if count > self.max_parts {
            return Err(DecodeError::TooManyParts {
                count,
                limit: self.max_parts,
            });
        }
        Ok(())
    }

    pub fn check_frame(&self, size: usize) -> Result<(), DecodeError> {
        if size > self.max_frame_bytes {
            return Err(DecodeError::FrameTooLarge {
                size,
                limit: self.max_frame_bytes,
            });
        }
        Ok(())
    }
}

/// Encode a length as a size prefix
pub fn size_prefix(len: usize) -> Result<[u8; SIZE_PREFIX_LEN], EncodeError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| EncodeError::PartTooLarge { len })
}

/// Decode the size prefix at the front of `bytes`
pub fn size_from_prefix(bytes: &[u8]) -> Result<usize, DecodeError> {
    let raw: [u8; SIZE_PREFIX_LEN] = bytes
        .get(..SIZE_PREFIX_LEN)
        .and_then(|prefix| prefix.try_into().ok())
        .ok_or(DecodeError::Truncated {
            needed: SIZE_PREFIX_LEN,
            available: bytes.len(),
        })?;
    Ok(u32::from_be_bytes(raw) as usize)
}

/// Decode a table of `count` consecutive size prefixes
pub fn parse_size_table(bytes: &[u8], count: usize) -> Result<Vec<usize>, DecodeError> {
    let needed = count.saturating_mul(SIZE_PREFIX_LEN);
    if bytes.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    bytes[..needed]
        .chunks_exact(SIZE_PREFIX_LEN)
        .map(size_from_prefix)
        .collect()
}

/// Concatenate parts into a frame
pub fn frame_from_parts<P: AsRef<[u8]>>(parts: &[P]) -> Result<Bytes, EncodeError> {
    let count = u32::try_from(parts.len()).map_err(|_| EncodeError::TooManyParts {
        count: parts.len(),
    })?;
    let payload: usize = parts.iter().map(|part| part.as_ref().len()).sum();
    let mut frame = BytesMut::with_capacity(SIZE_PREFIX_LEN * (parts.len() + 1) + payload);
    frame.put_u32(count);
    for part in parts {
        frame.put_slice(&size_prefix(part.as_ref().len())?);
    }
    for part in parts {
        frame.put_slice(part.as_ref());
    }
    Ok(frame.freeze())
}

fn kind_part(kind: u8) -> Bytes {
    Bytes::copy_from_slice(&[kind])
}

/// Split a value into its frame parts
pub fn encode_value_parts(value: &WireValue) -> Result<Vec<Bytes>, EncodeError> {
    let parts = match value {
        WireValue::None => vec![kind_part(kind::NONE), Bytes::new()],
        WireValue::Bytes(bytes) => vec![kind_part(kind::BYTES), Bytes::copy_from_slice(bytes)],
        WireValue::Text(text) => vec![
            kind_part(kind::TEXT),
            Bytes::copy_from_slice(text.as_bytes()),
        ],
        WireValue::Bool(flag) => vec![kind_part(kind::BOOL), kind_part(u8::from(*flag))],
        WireValue::Int(int) => vec![
            kind_part(kind::INT),
            Bytes::copy_from_slice(&int.to_be_bytes()),
        ],
        WireValue::Float(float) => vec![
            kind_part(kind::FLOAT),
            Bytes::copy_from_slice(&float.to_be_bytes()),
        ],
        WireValue::List(items) => {
            let mut parts = Vec::with_capacity(items.len() + 1);
            parts.push(kind_part(kind::LIST));
            for item in items {
                parts.push(encode_value(item)?);
            }
            parts
        }
        WireValue::Array(array) => {
            let mut shape = BytesMut::with_capacity(array.shape.len() * 8);
            for dim in &array.shape {
                shape.put_u64(*dim as u64);
            }
            vec![
                kind_part(kind::ARRAY),
                Bytes::copy_from_slice(&array.data),
                kind_part(array.dtype.code()),
                shape.freeze(),
            ]
        }
    };
    Ok(parts)
}

/// Split a message into its frame parts
pub fn encode_parts(message: &Message) -> Result<Vec<Bytes>, EncodeError> {
    match message {
        Message::Command(command) => Ok(vec![
            kind_part(kind::COMMAND),
            Bytes::from_static(command.tag()),
        ]),
        Message::Value(value) => encode_value_parts(value),
    }
}

/// Encode a message as one complete frame
pub fn encode(message: &Message) -> Result<Bytes, EncodeError> {
    frame_from_parts(&encode_parts(message)?)
}

/// Encode a value as one complete frame
pub fn encode_value(value: &WireValue) -> Result<Bytes, EncodeError> {
    frame_from_parts(&encode_value_parts(value)?)
}

/// Encode a command as one complete frame
pub fn encode_command(command: Command) -> Result<Bytes, EncodeError> {
    frame_from_parts(&[kind_part(kind::COMMAND), Bytes::from_static(command.tag())])
}

/// Rebuild a message from the ordered parts of one frame
pub fn decode<P: AsRef<[u8]>>(parts: &[P]) -> Result<Message, DecodeError> {
    decode_with_limits(parts, &FrameLimits::default())
}

/// [`decode`] with the nesting depth taken from `limits`
pub fn decode_with_limits<P: AsRef<[u8]>>(parts: &[P], limits: &FrameLimits) -> Result<Message, DecodeError> {
    decode_at(parts, limits, 0)
}

fn decode_at<P: AsRef<[u8]>>(parts: &[P], limits: &FrameLimits, depth: usize) -> Result<Message, DecodeError> {
    let (head, payload) = parts.split_first().ok_or(DecodeError::EmptyFrame)?;
    let kind = match head.as_ref() {
        [kind] => *kind,
        other => {
            return Err(DecodeError::invalid(
                "kind",
                format!("expected 1 byte, got {}", other.len()),
            ))
        }
    };
    if kind == kind::COMMAND {
        let tag = single("command", payload)?;
        if tag.len() != TAG_LEN {
            return Err(DecodeError::UnknownCommand(
                String::from_utf8_lossy(tag).into_owned(),
            ));
        }
        return Command::from_tag(tag)
            .map(Message::Command)
            .ok_or_else(|| DecodeError::UnknownCommand(String::from_utf8_lossy(tag).into_owned()));
    }
    decode_value(kind, payload, limits, depth).map(Message::Value)
}

fn single<'a, P: AsRef<[u8]>>(kind: &'static str, payload: &'a [P]) -> Result<&'a [u8], DecodeError> {
    match payload {
        [part] => Ok(part.as_ref()),
        other => Err(DecodeError::invalid(
            kind,
            format!("expected 1 part, got {}", other.len()),
        )),
    }
}

fn fixed<const N: usize, P: AsRef<[u8]>>(kind: &'static str, payload: &[P]) -> Result<[u8; N], DecodeError> {
    let part = single(kind, payload)?;
    part.try_into().map_err(|_| {
        DecodeError::invalid(kind, format!("expected {} bytes, got {}", N, part.len()))
    })
}

fn decode_value<P: AsRef<[u8]>>(
    kind: u8,
    payload: &[P],
    limits: &FrameLimits,
    depth: usize,
) -> Result<WireValue, DecodeError> {
    match kind {
        kind::NONE => {
            let sentinel = single("none", payload)?;
            if !sentinel.is_empty() {
                return Err(DecodeError::invalid("none", "sentinel part must be empty"));
            }
            Ok(WireValue::None)
        }
        kind::BYTES => Ok(WireValue::Bytes(single("bytes", payload)?.to_vec())),
        kind::TEXT => {
            let text = std::str::from_utf8(single("text", payload)?)
                .map_err(|_| DecodeError::InvalidUtf8)?;
            Ok(WireValue::Text(text.to_owned()))
        }
        kind::BOOL => match fixed::<1, _>("bool", payload)? {
            [0] => Ok(WireValue::Bool(false)),
            [1] => Ok(WireValue::Bool(true)),
            [other] => Err(DecodeError::invalid("bool", format!("byte {}", other))),
        },
        kind::INT => Ok(WireValue::Int(i64::from_be_bytes(fixed("int", payload)?))),
        kind::FLOAT => Ok(WireValue::Float(f64::from_be_bytes(fixed("float", payload)?))),
        kind::LIST if depth >= limits.max_depth => Err(DecodeError::TooDeep {
            limit: limits.max_depth,
        }),
        kind::LIST => payload
            .iter()
            .map(|element| match decode_nested(element.as_ref(), &limits.for_elements(), depth + 1)? {
                Message::Value(value) => Ok(value),
                Message::Command(command) => Err(DecodeError::invalid(
                    "list",
                    format!("element is command '{}'", command),
                )),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(WireValue::List),
        kind::ARRAY => {
            let [data, dtype, shape] = payload else {
                return Err(DecodeError::invalid(
                    "array",
                    format!("expected 3 parts, got {}", payload.len()),
                ));
            };
            let dtype = match dtype.as_ref() {
                [code] => DType::from_code(*code).ok_or(DecodeError::UnknownDType(*code))?,
                other => {
                    return Err(DecodeError::invalid(
                        "array",
                        format!("dtype part of {} bytes", other.len()),
                    ))
                }
            };
            let shape = shape.as_ref();
            if shape.len() % 8 != 0 {
                return Err(DecodeError::invalid(
                    "array",
                    format!("shape part of {} bytes", shape.len()),
                ));
            }
            let shape = shape
                .chunks_exact(8)
                .map(|dim| {
                    usize::try_from(u64::from_be_bytes(eight(dim)))
                        .map_err(|_| DecodeError::invalid("array", "dimension overflows usize"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            NdArray::new(dtype, shape, data.as_ref().to_vec())
                .map(WireValue::Array)
                .map_err(|err| DecodeError::invalid("array", err.to_string()))
        }
        other => Err(DecodeError::UnknownKind(other)),
    }
}

/// Decode the frame at the front of `buf`, returning it with the number of
/// bytes it occupied.
pub fn decode_frame(buf: &[u8], limits: &FrameLimits) -> Result<(Message, usize), DecodeError> {
    decode_frame_at(buf, limits, 0)
}

fn decode_frame_at(buf: &[u8], limits: &FrameLimits, depth: usize) -> Result<(Message, usize), DecodeError> {
    let count = size_from_prefix(buf)?;
    limits.check_parts(count)?;
    let table_end = count
        .checked_mul(SIZE_PREFIX_LEN)
        .and_then(|table| table.checked_add(SIZE_PREFIX_LEN))
        .ok_or(DecodeError::TooManyParts {
            count,
            limit: limits.max_parts,
        })?;
    let table = buf.get(SIZE_PREFIX_LEN..table_end).ok_or(DecodeError::Truncated {
        needed: table_end,
        available: buf.len(),
    })?;
    let sizes = parse_size_table(table, count)?;
    let total = sizes
        .iter()
        .try_fold(0usize, |acc, size| acc.checked_add(*size))
        .ok_or(DecodeError::FrameTooLarge {
            size: usize::MAX,
            limit: limits.max_frame_bytes,
        })?;
    limits.check_frame(total)?;
    let end = table_end
        .checked_add(total)
        .ok_or(DecodeError::FrameTooLarge {
            size: total,
            limit: limits.max_frame_bytes,
        })?;
    if buf.len() < end {
        return Err(DecodeError::Truncated {
            needed: end,
            available: buf.len(),
        });
    }
    let mut offset = table_end;
    let parts: Vec<&[u8]> = sizes
        .iter()
        .map(|size| {
            let part = &buf[offset..offset + size];
            offset += size;
            part
        })
        .collect();
    Ok((decode_at(&parts, limits, depth)?, end))
}

/// Decode a buffer holding exactly one frame
pub fn decode_exact(buf: &[u8], limits: &FrameLimits) -> Result<Message, DecodeError> {
    decode_nested(buf, limits, 0)
}

fn decode_nested(buf: &[u8], limits: &FrameLimits, depth: usize) -> Result<Message, DecodeError> {
    let (message, used) = decode_frame_at(buf, limits, depth)?;
    if used != buf.len() {
        return Err(DecodeError::TrailingBytes(buf.len() - used));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(value: WireValue) -> WireValue {
        let frame = encode_value(&value).unwrap();
        match decode_exact(&frame, &FrameLimits::default()).unwrap() {
            Message::Value(decoded) => decoded,
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn test_command_frame_layout() {
        let frame = encode_command(Command::Step).unwrap();
        assert_eq!(
            frame.as_ref(),
            &[0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 4, 0, b's', b't', b'e', b'p'][..]
        );
        assert_eq!(
            decode_exact(&frame, &FrameLimits::default()).unwrap(),
            Message::Command(Command::Step)
        );
    }

    #[test]
    fn test_none_is_zero_length_sentinel() {
        let parts = encode_value_parts(&WireValue::None).unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[1].is_empty());
        assert_eq!(round_trip(WireValue::None), WireValue::None);
    }

    #[test]
    fn test_text_that_looks_like_a_command_stays_text() {
        let value = WireValue::Text("done".to_string());
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_float_is_bit_exact() {
        for value in [0.1f64, -0.0, f64::MIN_POSITIVE, f64::MAX, f64::INFINITY] {
            match round_trip(WireValue::Float(value)) {
                WireValue::Float(decoded) => assert_eq!(decoded.to_bits(), value.to_bits()),
                other => panic!("decoded {:?}", other),
            }
        }
    }

    #[test]
    fn test_rank4_array_keeps_shape_and_dtype() {
        let values: Vec<i32> = (0..24).collect();
        let array = NdArray::from_i32(vec![2, 3, 2, 2], &values).unwrap();
        let decoded = round_trip(WireValue::Array(array.clone()));
        assert_eq!(decoded, WireValue::Array(array));
        let decoded = decoded.as_array().unwrap().clone();
        assert_eq!(decoded.dtype(), DType::I32);
        assert_eq!(decoded.shape(), &[2, 3, 2, 2]);
        assert_eq!(decoded.to_f64_vec()[23], 23.0);
    }

    #[test]
    fn test_array_shape_mismatch_rejected() {
        let err = NdArray::from_f64(vec![2, 2], &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, EncodeError::ShapeMismatch { expected: 32, actual: 24, .. }));
    }

    #[test]
    fn test_nested_list() {
        let value = WireValue::List(vec![
            WireValue::Int(1),
            WireValue::List(vec![WireValue::Text("a".into()), WireValue::None]),
            WireValue::Bool(true),
        ]);
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_invalid_bool_byte() {
        let parts = vec![kind_part(kind::BOOL), kind_part(7)];
        assert!(matches!(
            decode(&parts),
            Err(DecodeError::InvalidPayload { kind: "bool", .. })
        ));
    }

    #[test]
    fn test_unknown_kind_and_command() {
        let parts = vec![kind_part(42), Bytes::new()];
        assert_eq!(decode(&parts), Err(DecodeError::UnknownKind(42)));

        let parts = vec![kind_part(kind::COMMAND), Bytes::from_static(b"halt")];
        assert_eq!(decode(&parts), Err(DecodeError::UnknownCommand("halt".into())));
    }

    #[test]
    fn test_empty_frame() {
        let parts: Vec<Bytes> = Vec::new();
        assert_eq!(decode(&parts), Err(DecodeError::EmptyFrame));
    }

    #[test]
    fn test_frame_limits_enforced() {
        let frame = encode_value(&WireValue::Bytes(vec![0; 2048])).unwrap();
        let limits = FrameLimits {
            max_frame_bytes: 1024,
            max_parts: 8,
            ..FrameLimits::default()
        };
        assert!(matches!(
            decode_frame(&frame, &limits),
            Err(DecodeError::FrameTooLarge { limit: 1024, .. })
        ));

        let list = WireValue::List(vec![WireValue::Int(0); 10]);
        let frame = encode_value(&list).unwrap();
        assert!(matches!(
            decode_frame(&frame, &limits),
            Err(DecodeError::TooManyParts { count: 11, limit: 8 })
        ));
    }

    /// A frame of `depth` lists, each holding the next, around an int.
    /// Built by hand so no deep `WireValue` is ever materialised.
    fn nested_list_frame(depth: usize) -> Vec<u8> {
        let mut frame = encode_value(&WireValue::Int(1)).unwrap().to_vec();
        for _ in 0..depth {
            let mut outer = Vec::with_capacity(frame.len() + 13);
            outer.extend_from_slice(&2u32.to_be_bytes());
            outer.extend_from_slice(&1u32.to_be_bytes());
            outer.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            outer.push(kind::LIST);
            outer.extend_from_slice(&frame);
            frame = outer;
        }
        frame
    }

    #[test]
    fn test_list_depth_limit() {
        let limits = FrameLimits::default();
        let within = nested_list_frame(DEFAULT_MAX_DEPTH);
        assert!(decode_exact(&within, &limits).is_ok());

        let beyond = nested_list_frame(DEFAULT_MAX_DEPTH + 1);
        assert_eq!(
            decode_exact(&beyond, &limits),
            Err(DecodeError::TooDeep { limit: DEFAULT_MAX_DEPTH })
        );

        let shallow = FrameLimits {
            max_depth: 2,
            ..FrameLimits::default()
        };
        assert!(decode_exact(&nested_list_frame(2), &shallow).is_ok());
        assert!(matches!(
            decode_exact(&nested_list_frame(3), &shallow),
            Err(DecodeError::TooDeep { limit: 2 })
        ));
    }

    #[test]
    fn test_very_deep_list_is_an_error_not_a_crash() {
        let frame = nested_list_frame(20_000);
        assert_eq!(
            decode_exact(&frame, &FrameLimits::default()),
            Err(DecodeError::TooDeep { limit: DEFAULT_MAX_DEPTH })
        );
    }

    #[test]
    fn test_trailing_bytes() {
        let mut frame = encode_value(&WireValue::Int(3)).unwrap().to_vec();
        frame.push(0);
        assert_eq!(
            decode_exact(&frame, &FrameLimits::default()),
            Err(DecodeError::TrailingBytes(1))
        );
    }

    fn array_strategy() -> impl Strategy<Value = NdArray> {
        prop::collection::vec(1usize..4, 0..=4).prop_flat_map(|shape| {
            let len: usize = shape.iter().product();
            prop_oneof![
                prop::collection::vec(-1.0e6f64..1.0e6, len)
                    .prop_map({
                        let shape = shape.clone();
                        move |values| NdArray::from_f64(shape.clone(), &values).unwrap()
                    }),
                prop::collection::vec(any::<i32>(), len)
                    .prop_map(move |values| NdArray::from_i32(shape.clone(), &values).unwrap()),
            ]
        })
    }

    fn value_strategy() -> impl Strategy<Value = WireValue> {
        let leaf = prop_oneof![
            Just(WireValue::None),
            any::<bool>().prop_map(WireValue::Bool),
            any::<i64>().prop_map(WireValue::Int),
            any::<f64>()
                .prop_filter("NaN never compares equal", |v| !v.is_nan())
                .prop_map(WireValue::Float),
            ".{0,32}".prop_map(WireValue::Text),
            prop::collection::vec(any::<u8>(), 0..64).prop_map(WireValue::Bytes),
            array_strategy().prop_map(WireValue::Array),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop::collection::vec(inner, 0..6).prop_map(WireValue::List)
        })
    }

    proptest! {
        #[test]
        fn prop_value_round_trip(value in value_strategy()) {
            let frame = encode_value(&value).unwrap();
            let (decoded, used) = decode_frame(&frame, &FrameLimits::default()).unwrap();
            prop_assert_eq!(used, frame.len());
            prop_assert_eq!(decoded, Message::Value(value));
        }

        #[test]
        fn prop_declared_sizes_match_payload(value in value_strategy()) {
            let frame = encode_value(&value).unwrap();
            let count = size_from_prefix(&frame).unwrap();
            let sizes = parse_size_table(&frame[SIZE_PREFIX_LEN..], count).unwrap();
            let declared: usize = sizes.iter().sum();
            prop_assert_eq!(declared, frame.len() - SIZE_PREFIX_LEN * (count + 1));
        }

        #[test]
        fn prop_truncated_frame_never_decodes(value in value_strategy(), cut in any::<prop::sample::Index>()) {
            let frame = encode_value(&value).unwrap();
            let keep = cut.index(frame.len());
            prop_assert!(decode_frame(&frame[..keep], &FrameLimits::default()).is_err());
        }
    }
}
