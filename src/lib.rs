//! NeuroSky MindWave (ThinkGear) client with Python bindings.
//!
//! The headset streams `AA AA <len> <payload> <checksum>` frames at 57600
//! baud over Bluetooth RFCOMM or a serial dongle. This crate reassembles those
//! frames from arbitrary read chunks, decodes each payload into typed records
//! (raw EEG samples, attention and meditation levels, signal quality, blink
//! strength, power bands) and hands every record to the callback registered
//! for its event.
//!
//! # Layers
//!
//! 1. [`FrameParser`]: bounded buffer that yields checksum-valid packets and
//!    resynchronises on corrupt input.
//! 2. [`decode`]: turns one packet into [`Record`]s using a [`CodeTable`].
//! 3. [`HandlerRegistry`]: one callback per [`Event`], failures isolated.
//! 4. [`MindWave`]: owns a [`ByteSource`] and runs the read loop on its own
//!    thread.
//!
//! ```ignore
//! use _core::{ClientConfig, Event, MindWave, Value};
//!
//! let mut mw = MindWave::connect_serial("/dev/rfcomm0", ClientConfig::default())?;
//! mw.register(Event::Meditation, |v: Value| -> anyhow::Result<()> {
//!     println!("Meditation: {:?}", v.as_level());
//!     Ok(())
//! });
//! let report = mw.run()?;
//! ```
//!
//! Build with the `python` feature for the `MindWave` Python class.

mod bluetooth;
mod decoder;
mod errors;
mod framing;
pub mod logging;
mod mindwave;
mod registry;
mod source;
mod types;

#[cfg(feature = "python")]
mod python;

pub use bluetooth::{BluetoothConnector, RfcommStream};
pub use decoder::{decode, decode_into, decode_payload, CodeEntry, CodeTable, ValueKind};
pub use errors::*;
pub use framing::{
    checksum, encode_frame, FrameParser, FramingStats, Packet, DEFAULT_BUFFER_CAPACITY,
    MAX_PAYLOAD_LEN, SYNC,
};
pub use mindwave::{ClientConfig, MindWave, SessionEnd, SessionReport, SessionStats, StopHandle};
pub use registry::{Dispatch, Handler, HandlerRegistry};
pub use source::{open_serial, ByteSource, ChannelSource, IoSource, ReadStatus, BAUD_RATE};
pub use types::{DisconnectReason, Event, PowerBands, Record, Value};

/// ThinkGear data codes and the EXCODE marker.
pub mod codes {
    pub use crate::decoder::{
        CODE_ASIC_EEG_POWER, CODE_ATTENTION, CODE_BLINK_STRENGTH, CODE_EEG_POWER,
        CODE_HEART_RATE, CODE_MEDITATION, CODE_POOR_SIGNAL, CODE_RAW_8BIT, CODE_RAW_MARKER,
        CODE_RAW_WAVE, CODE_RR_INTERVAL, EXCODE, MULTI_BYTE_CODE,
    };
}
