//! Protocol codec
//!
//! Pure, stateless translation between typed requests/messages and raw
//! frames. Unit conversions between raw wire values and engineering units
//! are driven by the parameter table, never hardcoded per call site.
//!
//! Payload layout: one type-marker byte followed by the body. Response
//! markers are the request marker with the high bit set. A frame whose
//! marker or body does not match expectations is a `Decode` error, never a
//! silently defaulted value.

use byteorder::{BigEndian, ByteOrder};

use super::{Frame, ProtocolError};
use crate::dtc;
use crate::maps::MapId;
use crate::params::{ParameterTable, Pid};

const REQ_READ_PARAMETER: u8 = 0x01;
const REQ_READ_DTC: u8 = 0x02;
const REQ_CLEAR_DTC: u8 = 0x03;
const REQ_READ_FREEZE_FRAME: u8 = 0x04;
const REQ_WRITE_MAP_CELL: u8 = 0x05;
const REQ_READ_MAP_CELL: u8 = 0x06;
const REQ_HEARTBEAT: u8 = 0x07;

const RSP_READING: u8 = 0x81;
const RSP_DTC_REPORT: u8 = 0x82;
const RSP_DTC_CLEARED: u8 = 0x83;
const RSP_MAP_ACK: u8 = 0x85;
const RSP_MAP_CELL: u8 = 0x86;
const RSP_HEARTBEAT: u8 = 0x87;

/// A diagnostic or tuning request to the ECU
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Read a live parameter value
    ReadParameter(Pid),
    /// Read stored diagnostic trouble codes (with freeze frame, if any)
    ReadDtc,
    /// Clear stored trouble codes
    ClearDtc,
    /// Read the freeze frame captured with the most recent code
    ReadFreezeFrame,
    /// Write one tuning map cell
    WriteMapCell {
        /// Target map
        map: MapId,
        /// RPM axis index
        rpm_idx: u8,
        /// Load axis index
        load_idx: u8,
        /// Cell value in engineering units
        value: f64,
    },
    /// Read one tuning map cell back from the ECU
    ReadMapCell {
        /// Target map
        map: MapId,
        /// RPM axis index
        rpm_idx: u8,
        /// Load axis index
        load_idx: u8,
    },
    /// Keep-alive sent on the idle timer
    Heartbeat,
}

/// One freeze-frame parameter captured when a code was set
#[derive(Debug, Clone, PartialEq)]
pub struct FreezeFrameEntry {
    /// Parameter id
    pub pid: Pid,
    /// Channel name from the parameter table
    pub name: String,
    /// Value in engineering units
    pub value: f64,
}

/// A typed, decoded ECU response
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A live parameter reading
    Reading {
        /// Parameter id
        pid: Pid,
        /// Value in engineering units
        value: f64,
        /// Engineering unit label
        unit: String,
    },
    /// Stored trouble codes plus the freeze frame captured with them
    DtcReport {
        /// Decoded code strings, e.g. "P0234"
        codes: Vec<String>,
        /// Parameters captured at the moment the code was set
        freeze_frame: Vec<FreezeFrameEntry>,
    },
    /// Acknowledgement of a clear-codes request
    DtcCleared {
        /// Whether the ECU accepted the clear
        ok: bool,
    },
    /// Acknowledgement of a map cell write
    MapAck {
        /// Map the write targeted
        map: MapId,
        /// Whether the ECU accepted the value
        ok: bool,
    },
    /// A map cell read back from the ECU
    MapCell {
        /// Source map
        map: MapId,
        /// RPM axis index
        rpm_idx: u8,
        /// Load axis index
        load_idx: u8,
        /// Cell value in engineering units
        value: f64,
    },
    /// Heartbeat acknowledgement
    Heartbeat,
}

/// Encode a request into a frame
pub fn encode(request: &Request) -> Frame {
    let payload = match request {
        Request::ReadParameter(pid) => vec![REQ_READ_PARAMETER, pid.0],
        Request::ReadDtc => vec![REQ_READ_DTC],
        Request::ClearDtc => vec![REQ_CLEAR_DTC],
        Request::ReadFreezeFrame => vec![REQ_READ_FREEZE_FRAME],
        Request::WriteMapCell {
            map,
            rpm_idx,
            load_idx,
            value,
        } => {
            let mut p = vec![REQ_WRITE_MAP_CELL, map.wire_byte(), *rpm_idx, *load_idx];
            let mut raw = [0u8; 2];
            BigEndian::write_i16(&mut raw, cell_to_raw(*map, *value));
            p.extend_from_slice(&raw);
            p
        }
        Request::ReadMapCell {
            map,
            rpm_idx,
            load_idx,
        } => vec![REQ_READ_MAP_CELL, map.wire_byte(), *rpm_idx, *load_idx],
        Request::Heartbeat => vec![REQ_HEARTBEAT],
    };
    Frame::new(payload)
}

/// Decode a response frame into a typed message.
///
/// The parameter table supplies per-PID raw-to-engineering conversions and
/// unit labels.
pub fn decode(frame: &Frame, table: &ParameterTable) -> Result<Message, ProtocolError> {
    let payload = &frame.payload;
    let marker = *payload
        .first()
        .ok_or_else(|| ProtocolError::Decode("empty payload".to_string()))?;

    match marker {
        RSP_READING => {
            need(payload, 4, "Reading")?;
            let pid = Pid(payload[1]);
            let raw = BigEndian::read_u16(&payload[2..4]);
            let def = table.get(pid).ok_or(ProtocolError::UnknownPid(pid.0))?;
            Ok(Message::Reading {
                pid,
                value: def.to_engineering(raw),
                unit: def.unit.clone(),
            })
        }
        RSP_DTC_REPORT => decode_dtc_report(payload, table),
        RSP_DTC_CLEARED => {
            need(payload, 2, "DtcCleared")?;
            Ok(Message::DtcCleared {
                ok: payload[1] != 0,
            })
        }
        RSP_MAP_ACK => {
            need(payload, 3, "MapAck")?;
            let map = MapId::from_wire(payload[1]).ok_or(ProtocolError::UnknownMap(payload[1]))?;
            Ok(Message::MapAck {
                map,
                ok: payload[2] != 0,
            })
        }
        RSP_MAP_CELL => {
            need(payload, 6, "MapCell")?;
            let map = MapId::from_wire(payload[1]).ok_or(ProtocolError::UnknownMap(payload[1]))?;
            let raw = BigEndian::read_i16(&payload[4..6]);
            Ok(Message::MapCell {
                map,
                rpm_idx: payload[2],
                load_idx: payload[3],
                value: raw_to_cell(map, raw),
            })
        }
        RSP_HEARTBEAT => Ok(Message::Heartbeat),
        other => Err(ProtocolError::Decode(format!(
            "unexpected message marker {other:#04x}"
        ))),
    }
}

fn decode_dtc_report(payload: &[u8], table: &ParameterTable) -> Result<Message, ProtocolError> {
    need(payload, 2, "DtcReport")?;
    let n_codes = payload[1] as usize;
    let codes_end = 2 + n_codes * 2;
    need(payload, codes_end, "DtcReport codes")?;

    let mut codes = Vec::with_capacity(n_codes);
    for i in 0..n_codes {
        let off = 2 + i * 2;
        codes.push(dtc::unpack([payload[off], payload[off + 1]]));
    }

    need(payload, codes_end + 1, "DtcReport freeze frame count")?;
    let n_entries = payload[codes_end] as usize;
    let entries_end = codes_end + 1 + n_entries * 3;
    need(payload, entries_end, "DtcReport freeze frame")?;

    let mut freeze_frame = Vec::with_capacity(n_entries);
    for i in 0..n_entries {
        let off = codes_end + 1 + i * 3;
        let pid = Pid(payload[off]);
        let raw = BigEndian::read_u16(&payload[off + 1..off + 3]);
        let def = table.get(pid).ok_or(ProtocolError::UnknownPid(pid.0))?;
        freeze_frame.push(FreezeFrameEntry {
            pid,
            name: def.name.clone(),
            value: def.to_engineering(raw),
        });
    }

    Ok(Message::DtcReport {
        codes,
        freeze_frame,
    })
}

/// Decode a request frame back into a typed request.
///
/// Used by the demo ECU and by tests; a real ECU is the usual consumer of
/// request frames.
pub fn decode_request(frame: &Frame) -> Result<Request, ProtocolError> {
    let payload = &frame.payload;
    let marker = *payload
        .first()
        .ok_or_else(|| ProtocolError::Decode("empty payload".to_string()))?;

    match marker {
        REQ_READ_PARAMETER => {
            need(payload, 2, "ReadParameter")?;
            Ok(Request::ReadParameter(Pid(payload[1])))
        }
        REQ_READ_DTC => Ok(Request::ReadDtc),
        REQ_CLEAR_DTC => Ok(Request::ClearDtc),
        REQ_READ_FREEZE_FRAME => Ok(Request::ReadFreezeFrame),
        REQ_WRITE_MAP_CELL => {
            need(payload, 6, "WriteMapCell")?;
            let map = MapId::from_wire(payload[1]).ok_or(ProtocolError::UnknownMap(payload[1]))?;
            let raw = BigEndian::read_i16(&payload[4..6]);
            Ok(Request::WriteMapCell {
                map,
                rpm_idx: payload[2],
                load_idx: payload[3],
                value: raw_to_cell(map, raw),
            })
        }
        REQ_READ_MAP_CELL => {
            need(payload, 4, "ReadMapCell")?;
            let map = MapId::from_wire(payload[1]).ok_or(ProtocolError::UnknownMap(payload[1]))?;
            Ok(Request::ReadMapCell {
                map,
                rpm_idx: payload[2],
                load_idx: payload[3],
            })
        }
        REQ_HEARTBEAT => Ok(Request::Heartbeat),
        other => Err(ProtocolError::Decode(format!(
            "unexpected request marker {other:#04x}"
        ))),
    }
}

/// Encode a message into a response frame.
///
/// The inverse of [`decode`]; used by the demo ECU and round-trip tests.
pub fn encode_message(message: &Message, table: &ParameterTable) -> Result<Frame, ProtocolError> {
    let payload = match message {
        Message::Reading { pid, value, .. } => {
            let def = table.get(*pid).ok_or(ProtocolError::UnknownPid(pid.0))?;
            let mut p = vec![RSP_READING, pid.0];
            let mut raw = [0u8; 2];
            BigEndian::write_u16(&mut raw, def.to_raw(*value));
            p.extend_from_slice(&raw);
            p
        }
        Message::DtcReport {
            codes,
            freeze_frame,
        } => {
            let mut p = vec![RSP_DTC_REPORT, codes.len() as u8];
            for code in codes {
                let bytes = dtc::pack(code)
                    .ok_or_else(|| ProtocolError::Decode(format!("unencodable DTC '{code}'")))?;
                p.extend_from_slice(&bytes);
            }
            p.push(freeze_frame.len() as u8);
            for entry in freeze_frame {
                let def = table
                    .get(entry.pid)
                    .ok_or(ProtocolError::UnknownPid(entry.pid.0))?;
                p.push(entry.pid.0);
                let mut raw = [0u8; 2];
                BigEndian::write_u16(&mut raw, def.to_raw(entry.value));
                p.extend_from_slice(&raw);
            }
            p
        }
        Message::DtcCleared { ok } => vec![RSP_DTC_CLEARED, *ok as u8],
        Message::MapAck { map, ok } => vec![RSP_MAP_ACK, map.wire_byte(), *ok as u8],
        Message::MapCell {
            map,
            rpm_idx,
            load_idx,
            value,
        } => {
            let mut p = vec![RSP_MAP_CELL, map.wire_byte(), *rpm_idx, *load_idx];
            let mut raw = [0u8; 2];
            BigEndian::write_i16(&mut raw, cell_to_raw(*map, *value));
            p.extend_from_slice(&raw);
            p
        }
        Message::Heartbeat => vec![RSP_HEARTBEAT],
    };
    Ok(Frame::new(payload))
}

fn cell_to_raw(map: MapId, value: f64) -> i16 {
    let raw = value / map.value_scale();
    raw.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

fn raw_to_cell(map: MapId, raw: i16) -> f64 {
    raw as f64 * map.value_scale()
}

fn need(payload: &[u8], len: usize, what: &str) -> Result<(), ProtocolError> {
    if payload.len() < len {
        return Err(ProtocolError::Decode(format!(
            "truncated {what}: {} bytes, need {len}",
            payload.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encode_decode_roundtrip() {
        let requests = [
            Request::ReadParameter(Pid(0x0C)),
            Request::ReadDtc,
            Request::ClearDtc,
            Request::ReadFreezeFrame,
            Request::WriteMapCell {
                map: MapId::BoostTarget,
                rpm_idx: 3,
                load_idx: 4,
                value: 152.5,
            },
            Request::ReadMapCell {
                map: MapId::IgnitionTiming,
                rpm_idx: 1,
                load_idx: 0,
            },
            Request::Heartbeat,
        ];

        for request in requests {
            let frame = encode(&request);
            let decoded = decode_request(&frame).expect("should decode");
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn test_reading_uses_table_conversion() {
        let table = ParameterTable::builtin();
        let frame = encode_message(
            &Message::Reading {
                pid: Pid(0x0C),
                value: 3500.0,
                unit: "rpm".to_string(),
            },
            &table,
        )
        .unwrap();

        match decode(&frame, &table).unwrap() {
            Message::Reading { pid, value, unit } => {
                assert_eq!(pid, Pid(0x0C));
                assert_eq!(value, 3500.0);
                assert_eq!(unit, "rpm");
            }
            other => panic!("expected Reading, got {other:?}"),
        }
    }

    #[test]
    fn test_negative_timing_cell() {
        let frame = encode(&Request::WriteMapCell {
            map: MapId::IgnitionTiming,
            rpm_idx: 0,
            load_idx: 4,
            value: -2.5,
        });
        match decode_request(&frame).unwrap() {
            Request::WriteMapCell { value, .. } => assert_eq!(value, -2.5),
            other => panic!("expected WriteMapCell, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_marker_rejected() {
        let table = ParameterTable::builtin();
        let frame = Frame::new(vec![0x7F, 0x00]);
        assert!(matches!(
            decode(&frame, &table),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let table = ParameterTable::builtin();
        // Reading marker but no value bytes
        let frame = Frame::new(vec![RSP_READING, 0x0C]);
        assert!(matches!(
            decode(&frame, &table),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_unknown_pid_rejected_not_defaulted() {
        let table = ParameterTable::builtin();
        let frame = Frame::new(vec![RSP_READING, 0xEE, 0x00, 0x10]);
        assert!(matches!(
            decode(&frame, &table),
            Err(ProtocolError::UnknownPid(0xEE))
        ));
    }

    #[test]
    fn test_dtc_report_roundtrip() {
        let table = ParameterTable::builtin();
        let message = Message::DtcReport {
            codes: vec!["P0234".to_string(), "P0300".to_string()],
            freeze_frame: vec![FreezeFrameEntry {
                pid: Pid(0x0C),
                name: "rpm".to_string(),
                value: 5200.0,
            }],
        };
        let frame = encode_message(&message, &table).unwrap();
        let decoded = decode(&frame, &table).unwrap();
        assert_eq!(decoded, message);
    }
}
