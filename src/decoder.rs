//! ThinkGear payload decoding.
//!
//! A payload is a sequence of data rows:
//!
//! ```text
//! [0x55 ...][CODE][VLENGTH][VALUE ...]   (CODE >= 0x80)
//! [0x55 ...][CODE][VALUE]                (CODE <  0x80)
//! ```
//!
//! Each leading `0x55` raises the row's extended code level. Codes below 0x80
//! carry exactly one data byte, codes from 0x80 up declare their own length.
//!
//! Which code means what is vendor specific, so the mapping lives in a
//! [`CodeTable`]. [`CodeTable::thinkgear`] holds the codes published for
//! MindWave hardware; anything the table does not map (or maps to a kind whose
//! size does not match the row) is passed through as [`Event::Unknown`].

use log::debug;

use crate::errors::{DecodeError, DriverError, Result};
use crate::framing::Packet;
use crate::types::{Event, PowerBands, Record, Value};

/// Extended code prefix byte.
pub const EXCODE: u8 = 0x55;

/// First code that carries an explicit length byte.
pub const MULTI_BYTE_CODE: u8 = 0x80;

// ThinkGear codes
pub const CODE_POOR_SIGNAL: u8 = 0x02;
pub const CODE_HEART_RATE: u8 = 0x03;
pub const CODE_ATTENTION: u8 = 0x04;
pub const CODE_MEDITATION: u8 = 0x05;
pub const CODE_RAW_8BIT: u8 = 0x06;
pub const CODE_RAW_MARKER: u8 = 0x07;
pub const CODE_BLINK_STRENGTH: u8 = 0x16;
pub const CODE_RAW_WAVE: u8 = 0x80;
pub const CODE_EEG_POWER: u8 = 0x81;
pub const CODE_ASIC_EEG_POWER: u8 = 0x83;
pub const CODE_RR_INTERVAL: u8 = 0x86;

/// How the data bytes of a mapped code are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// One unsigned byte. The only kind allowed below [`MULTI_BYTE_CODE`].
    Level,
    /// Two bytes, big-endian signed.
    Raw16,
    /// Eight big-endian unsigned values of `width` bytes each (1-4).
    PowerBands { width: u8 },
    /// Data passed through untouched.
    Bytes,
}

impl ValueKind {
    /// Interpret `data`, or `None` if its size does not fit this kind.
    fn read(self, data: &[u8]) -> Option<Value> {
        match self {
            ValueKind::Level => match data {
                [v] => Some(Value::Level(*v)),
                _ => None,
            },
            ValueKind::Raw16 => match data {
                [hi, lo] => Some(Value::Raw(i16::from_be_bytes([*hi, *lo]))),
                _ => None,
            },
            ValueKind::PowerBands { width } => {
                let width = width as usize;
                if !(1..=4).contains(&width) || data.len() != width * PowerBands::COUNT {
                    return None;
                }
                let mut bands = [0u32; PowerBands::COUNT];
                for (band, chunk) in bands.iter_mut().zip(data.chunks_exact(width)) {
                    *band = chunk.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
                }
                Some(Value::PowerBands(PowerBands::from_array(bands)))
            }
            ValueKind::Bytes => Some(Value::Bytes(data.to_vec())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeEntry {
    pub event: Event,
    pub kind: ValueKind,
}

/// Mapping from code byte to event and value kind.
#[derive(Debug, Clone)]
pub struct CodeTable {
    entries: [Option<CodeEntry>; 256],
}

impl Default for CodeTable {
    fn default() -> Self {
        Self::thinkgear()
    }
}

impl CodeTable {
    /// A table that maps nothing; every row decodes as [`Event::Unknown`].
    pub fn empty() -> Self {
        Self {
            entries: [None; 256],
        }
    }

    /// Codes published for NeuroSky ThinkGear (MindWave, MindWave Mobile).
    pub fn thinkgear() -> Self {
        let mut table = Self::empty();
        table.set(CODE_POOR_SIGNAL, Event::SignalQuality, ValueKind::Level);
        table.set(CODE_ATTENTION, Event::Attention, ValueKind::Level);
        table.set(CODE_MEDITATION, Event::Meditation, ValueKind::Level);
        table.set(CODE_BLINK_STRENGTH, Event::BlinkStrength, ValueKind::Level);
        table.set(CODE_RAW_WAVE, Event::Eeg, ValueKind::Raw16);
        table.set(
            CODE_ASIC_EEG_POWER,
            Event::PowerBands,
            ValueKind::PowerBands { width: 3 },
        );
        table
    }

    /// Map `code` to `event`, replacing any previous mapping.
    ///
    /// Fails if the kind cannot be carried by the code (single-byte codes are
    /// always [`ValueKind::Level`], multi-byte codes never are), if `code` is
    /// the extended-code prefix, or if `event` is [`Event::Disconnected`].
    pub fn with_code(mut self, code: u8, event: Event, kind: ValueKind) -> Result<Self> {
        if code == EXCODE {
            return Err(DriverError::Protocol(format!(
                "{EXCODE:#04X} is the extended code prefix and cannot be mapped"
            )));
        }
        if event == Event::Disconnected {
            return Err(DriverError::Protocol(
                "disconnected is not a payload event".into(),
            ));
        }
        let single_byte = code < MULTI_BYTE_CODE;
        if single_byte != (kind == ValueKind::Level) {
            return Err(DriverError::Protocol(format!(
                "code {code:#04X} cannot carry a {kind:?} value"
            )));
        }
        self.set(code, event, kind);
        Ok(self)
    }

    /// Remove the mapping for `code`; it will decode as [`Event::Unknown`].
    pub fn without_code(mut self, code: u8) -> Self {
        self.entries[code as usize] = None;
        self
    }

    pub fn lookup(&self, code: u8) -> Option<CodeEntry> {
        self.entries[code as usize]
    }

    fn set(&mut self, code: u8, event: Event, kind: ValueKind) {
        self.entries[code as usize] = Some(CodeEntry { event, kind });
    }
}

/// Decode a verified packet into its records, in payload order.
pub fn decode(
    table: &CodeTable,
    packet: &Packet<'_>,
) -> std::result::Result<Vec<Record>, DecodeError> {
    decode_payload(table, packet.payload())
}

/// Decode raw payload bytes into their records, in payload order.
pub fn decode_payload(
    table: &CodeTable,
    payload: &[u8],
) -> std::result::Result<Vec<Record>, DecodeError> {
    let mut records = Vec::new();
    decode_into(table, payload, &mut records)?;
    Ok(records)
}

/// Append the records of `payload` to `out`.
///
/// On error `out` is left as it was: a packet is decoded entirely or not at all.
pub fn decode_into(
    table: &CodeTable,
    payload: &[u8],
    out: &mut Vec<Record>,
) -> std::result::Result<(), DecodeError> {
    let mark = out.len();
    let result = decode_rows(table, payload, out);
    if result.is_err() {
        out.truncate(mark);
    }
    result
}

fn decode_rows(
    table: &CodeTable,
    payload: &[u8],
    out: &mut Vec<Record>,
) -> std::result::Result<(), DecodeError> {
    let mut i = 0;
    while i < payload.len() {
        let offset = i;
        let mut excode_level = 0u8;
        while payload.get(i) == Some(&EXCODE) {
            excode_level = excode_level.saturating_add(1);
            i += 1;
        }

        let Some(&code) = payload.get(i) else {
            return Err(DecodeError::Truncated {
                code: EXCODE,
                offset,
                needed: 1,
                available: 0,
            });
        };
        i += 1;

        let len = if code < MULTI_BYTE_CODE {
            1
        } else {
            let Some(&len) = payload.get(i) else {
                return Err(DecodeError::Truncated {
                    code,
                    offset,
                    needed: 1,
                    available: 0,
                });
            };
            i += 1;
            len as usize
        };

        let available = payload.len() - i;
        if len > available {
            return Err(DecodeError::Truncated {
                code,
                offset,
                needed: len,
                available,
            });
        }

        out.push(decode_row(table, code, excode_level, &payload[i..i + len]));
        i += len;
    }
    Ok(())
}

fn decode_row(table: &CodeTable, code: u8, excode_level: u8, data: &[u8]) -> Record {
    let entry = if excode_level == 0 {
        table.lookup(code)
    } else {
        None
    };

    if let Some(entry) = entry {
        if let Some(value) = entry.kind.read(data) {
            return Record {
                code,
                excode_level,
                event: entry.event,
                value,
            };
        }
        debug!(
            "code {:#04X} carried {} bytes, not a {:?}; passing through as unknown",
            code,
            data.len(),
            entry.kind
        );
    }

    let value = match data {
        [v] if code < MULTI_BYTE_CODE => Value::Level(*v),
        _ => Value::Bytes(data.to_vec()),
    };
    Record {
        code,
        excode_level,
        event: Event::Unknown,
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameParser;

    fn attention_on_0x02() -> CodeTable {
        CodeTable::thinkgear()
            .with_code(0x02, Event::Attention, ValueKind::Level)
            .unwrap()
    }

    #[test]
    fn test_single_byte_attention() {
        let records = decode_payload(&attention_on_0x02(), &[0x02, 0x64]).unwrap();
        assert_eq!(
            records,
            vec![Record {
                code: 0x02,
                excode_level: 0,
                event: Event::Attention,
                value: Value::Level(100),
            }]
        );
    }

    #[test]
    fn test_raw_wave_sample() {
        let records = decode_payload(&CodeTable::thinkgear(), &[0x80, 0x02, 0x01, 0x90]).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, Event::Eeg);
        assert_eq!(records[0].value, Value::Raw(400));

        let negative = decode_payload(&CodeTable::thinkgear(), &[0x80, 0x02, 0xFF, 0x38]).unwrap();
        assert_eq!(negative[0].value, Value::Raw(-200));
    }

    #[test]
    fn test_typical_once_a_second_payload() {
        // poor signal, ASIC power, attention, meditation, as sent by MindWave Mobile
        let mut payload = vec![0x02, 0x00, 0x83, 0x18];
        for band in 1u32..=8 {
            payload.extend_from_slice(&(band * 0x010203).to_be_bytes()[1..]);
        }
        payload.extend_from_slice(&[0x04, 0x3C, 0x05, 0x28]);

        let records = decode_payload(&CodeTable::thinkgear(), &payload).unwrap();
        let events: Vec<Event> = records.iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![
                Event::SignalQuality,
                Event::PowerBands,
                Event::Attention,
                Event::Meditation
            ]
        );
        let bands = records[1].value.as_power_bands().unwrap();
        assert_eq!(bands.delta, 0x010203);
        assert_eq!(bands.mid_gamma, 8 * 0x010203);
        assert_eq!(records[2].value.as_level(), Some(60));
        assert_eq!(records[3].value.as_level(), Some(40));
    }

    #[test]
    fn test_four_byte_power_bands() {
        let table = CodeTable::thinkgear()
            .with_code(0x81, Event::PowerBands, ValueKind::PowerBands { width: 4 })
            .unwrap();
        let mut payload = vec![0x81, 0x20];
        for band in 0u32..8 {
            payload.extend_from_slice(&((band << 24) | 7).to_be_bytes());
        }
        let records = decode_payload(&table, &payload).unwrap();
        let bands = records[0].value.as_power_bands().unwrap();
        assert_eq!(bands.delta, 7);
        assert_eq!(bands.theta, (1 << 24) | 7);
    }

    #[test]
    fn test_unmapped_codes_pass_through_as_unknown() {
        let payload = [CODE_HEART_RATE, 0x48, CODE_RR_INTERVAL, 0x02, 0x03, 0x20];
        let records = decode_payload(&CodeTable::thinkgear(), &payload).unwrap();
        assert_eq!(records[0].event, Event::Unknown);
        assert_eq!(records[0].value, Value::Level(0x48));
        assert_eq!(records[1].event, Event::Unknown);
        assert_eq!(records[1].code, CODE_RR_INTERVAL);
        assert_eq!(records[1].value, Value::Bytes(vec![0x03, 0x20]));
    }

    #[test]
    fn test_size_mismatch_passes_through_as_unknown() {
        let records =
            decode_payload(&CodeTable::thinkgear(), &[0x80, 0x03, 0x01, 0x02, 0x03]).unwrap();
        assert_eq!(records[0].event, Event::Unknown);
        assert_eq!(records[0].value, Value::Bytes(vec![0x01, 0x02, 0x03]));
    }

    #[test]
    fn test_extended_code_rows_are_unknown() {
        let payload = [0x55, 0x55, 0x04, 0x10, 0x04, 0x11];
        let records = decode_payload(&CodeTable::thinkgear(), &payload).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].excode_level, 2);
        assert_eq!(records[0].event, Event::Unknown);
        assert_eq!(records[1].excode_level, 0);
        assert_eq!(records[1].event, Event::Attention);
    }

    #[test]
    fn test_truncated_rows_fail_the_packet() {
        let table = CodeTable::thinkgear();
        assert_eq!(
            decode_payload(&table, &[0x04, 0x10, 0x80, 0x02, 0x01]),
            Err(DecodeError::Truncated {
                code: 0x80,
                offset: 2,
                needed: 2,
                available: 1
            })
        );
        assert!(decode_payload(&table, &[0x04]).is_err());
        assert!(decode_payload(&table, &[0x83]).is_err());
        assert!(decode_payload(&table, &[0x04, 0x10, 0x55]).is_err());

        let mut out = vec![];
        assert!(decode_into(&table, &[0x04, 0x10, 0x05], &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_parser_packets_decode_like_raw_payloads() {
        let payload = [0x04, 0x3C, 0x16, 0x7F];
        let mut parser = FrameParser::new();
        parser.feed(&crate::framing::encode_frame(&payload).unwrap());

        let table = CodeTable::thinkgear();
        let packet = parser.next_packet().unwrap();
        assert_eq!(decode(&table, &packet), decode_payload(&table, &payload));
        assert_eq!(decode(&table, &packet).unwrap().len(), 2);
    }

    #[test]
    fn test_decoding_is_idempotent() {
        let table = CodeTable::thinkgear();
        let payload = [0x02, 0x1A, 0x80, 0x02, 0x00, 0x10, 0x16, 0x30];
        let packet = Packet::new(&payload);
        assert_eq!(decode(&table, &packet), decode(&table, &packet));
        assert_eq!(decode(&table, &Packet::new(&[])), Ok(vec![]));
    }

    #[test]
    fn test_table_rejects_impossible_mappings() {
        assert!(CodeTable::empty()
            .with_code(0x10, Event::Eeg, ValueKind::Raw16)
            .is_err());
        assert!(CodeTable::empty()
            .with_code(0x90, Event::Attention, ValueKind::Level)
            .is_err());
        assert!(CodeTable::empty()
            .with_code(EXCODE, Event::Attention, ValueKind::Level)
            .is_err());
        assert!(CodeTable::empty()
            .with_code(0x04, Event::Disconnected, ValueKind::Level)
            .is_err());

        let table = CodeTable::thinkgear().without_code(CODE_ATTENTION);
        assert_eq!(table.lookup(CODE_ATTENTION), None);
        assert_eq!(
            table.lookup(CODE_MEDITATION).map(|e| e.event),
            Some(Event::Meditation)
        );
    }
}
