use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("unknown event name: {0}")]
    UnknownEvent(String),
    #[error("session already running")]
    AlreadyRunning,
    #[error("session not ready: {0}")]
    NotReady(String),
}

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("invalid bluetooth address: {0}")]
    InvalidAddress(String),
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("rfcomm connection failed: {0}")]
    Connection(String),
}

/// A candidate frame that was rejected by the reassembler.
///
/// Never fatal: the parser counts it and resynchronises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("checksum mismatch (expected {expected:#04X}, received {received:#04X})")]
    Checksum { expected: u8, received: u8 },
    #[error("declared payload length {0} exceeds the protocol maximum")]
    OversizedLength(u8),
}

/// A checksum-valid payload whose rows do not fit inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("row {code:#04X} at offset {offset} needs {needed} bytes, {available} available")]
    Truncated {
        code: u8,
        offset: usize,
        needed: usize,
        available: usize,
    },
}

pub type Result<T> = std::result::Result<T, DriverError>;
