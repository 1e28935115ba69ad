//! Wire protocol for simbatch
//! 
//! This crate provides the length-prefixed frame codec, the command vocabulary,
//! the byte transports (cooperative and blocking) and the connection endpoint
//! shared by the coordinator and its workers.

pub mod codec;
pub mod command;
pub mod endpoint;
pub mod error;
pub mod field;
pub mod transport;

// Re-export commonly used types
pub use codec::{
    DType, DecodeError, EncodeError, FrameLimits, Message, NdArray, WireValue,
    SIZE_PREFIX_LEN,
};
pub use command::Command;
pub use endpoint::{
    CommandContext, CommandHandler, Connection, DefaultHandler, DICT_NAME_LABEL, INSTANCE_ID_LABEL,
    NESTED_DICT_LABEL, PREDICTION_INPUT_LABEL, PREDICTION_OUTPUT_LABEL,
};
pub use error::IpcError;
pub use field::{field_map_from_json, Field, FieldMap};
pub use transport::{
    BlockingListener, BlockingTransport, FrameListener, FrameTransport, ReadInterrupt,
    StreamTransport, TokioListener, TokioTransport, READ_CHUNK_TIERS,
};
