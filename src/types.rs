//! Decoded values and the event names they are delivered under.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::errors::DriverError;

/// Semantic event a decoded record is routed to.
///
/// The string forms (`eeg`, `attention`, `meditation`, `signalQuality`,
/// `blinkStrength`, `powerBands`, `unknown`, `disconnected`) are the names
/// accepted by [`HandlerRegistry::register_named`](crate::HandlerRegistry::register_named)
/// and by the Python `set_callback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Event {
    /// Raw EEG sample (512 Hz on MindWave hardware).
    Eeg,
    /// eSense attention level, 0-100.
    Attention,
    /// eSense meditation level, 0-100.
    Meditation,
    /// Poor-signal level, 0 (good contact) to 200 (no contact).
    SignalQuality,
    /// Strength of a detected eye blink, 1-255.
    BlinkStrength,
    /// The eight ASIC EEG power bands, about once per second.
    PowerBands,
    /// Any code the active code table does not map.
    Unknown,
    /// The byte source ended or failed; terminal for the session.
    Disconnected,
}

impl Event {
    pub const ALL: [Event; 8] = [
        Event::Eeg,
        Event::Attention,
        Event::Meditation,
        Event::SignalQuality,
        Event::BlinkStrength,
        Event::PowerBands,
        Event::Unknown,
        Event::Disconnected,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Event::Eeg => "eeg",
            Event::Attention => "attention",
            Event::Meditation => "meditation",
            Event::SignalQuality => "signalQuality",
            Event::BlinkStrength => "blinkStrength",
            Event::PowerBands => "powerBands",
            Event::Unknown => "unknown",
            Event::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Event {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Event::ALL
            .into_iter()
            .find(|e| e.name() == s)
            .ok_or_else(|| DriverError::UnknownEvent(s.to_string()))
    }
}

/// ASIC EEG power bands. Values are relative magnitudes without units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PowerBands {
    pub delta: u32,
    pub theta: u32,
    pub low_alpha: u32,
    pub high_alpha: u32,
    pub low_beta: u32,
    pub high_beta: u32,
    pub low_gamma: u32,
    pub mid_gamma: u32,
}

impl PowerBands {
    pub const COUNT: usize = 8;

    /// Build from band values in wire order (delta first, mid gamma last).
    pub fn from_array(v: [u32; 8]) -> Self {
        Self {
            delta: v[0],
            theta: v[1],
            low_alpha: v[2],
            high_alpha: v[3],
            low_beta: v[4],
            high_beta: v[5],
            low_gamma: v[6],
            mid_gamma: v[7],
        }
    }

    pub fn to_array(self) -> [u32; 8] {
        [
            self.delta,
            self.theta,
            self.low_alpha,
            self.high_alpha,
            self.low_beta,
            self.high_beta,
            self.low_gamma,
            self.mid_gamma,
        ]
    }

    /// Band names in wire order, matching [`to_array`](Self::to_array).
    pub fn names() -> [&'static str; 8] {
        [
            "delta",
            "theta",
            "lowAlpha",
            "highAlpha",
            "lowBeta",
            "highBeta",
            "lowGamma",
            "midGamma",
        ]
    }
}

/// Why a session ended without being asked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DisconnectReason {
    /// The byte source reported end of stream.
    EndOfStream,
    /// No data arrived within the configured idle timeout.
    Timeout,
    /// The byte source failed.
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::EndOfStream => f.write_str("end of stream"),
            DisconnectReason::Timeout => f.write_str("no data before idle timeout"),
            DisconnectReason::Error(e) => write!(f, "read error: {e}"),
        }
    }
}

/// A decoded value, handed to handlers by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Value {
    /// Single-byte scalar (attention, meditation, poor signal, blink strength, ...).
    Level(u8),
    /// Signed 16-bit raw EEG sample.
    Raw(i16),
    PowerBands(PowerBands),
    /// Undecoded row data.
    Bytes(Vec<u8>),
    Disconnected(DisconnectReason),
}

impl Value {
    pub fn as_level(&self) -> Option<u8> {
        match self {
            Value::Level(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<i16> {
        match self {
            Value::Raw(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_power_bands(&self) -> Option<&PowerBands> {
        match self {
            Value::PowerBands(v) => Some(v),
            _ => None,
        }
    }
}

/// One decoded row of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    /// Code byte as it appeared on the wire.
    pub code: u8,
    /// Number of `0x55` extended-code bytes preceding the code.
    pub excode_level: u8,
    pub event: Event,
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_round_trip() {
        for event in Event::ALL {
            assert_eq!(event.name().parse::<Event>().unwrap(), event);
            assert_eq!(event.to_string(), event.name());
        }
    }

    #[test]
    fn test_unknown_event_name_is_rejected() {
        let err = "blink".parse::<Event>().unwrap_err();
        assert!(matches!(err, DriverError::UnknownEvent(ref name) if name == "blink"));
    }

    #[test]
    fn test_power_bands_array_order() {
        let bands = PowerBands::from_array([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bands.delta, 1);
        assert_eq!(bands.mid_gamma, 8);
        assert_eq!(bands.to_array(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(PowerBands::names()[2], "lowAlpha");
    }
}
