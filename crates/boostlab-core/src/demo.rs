//! Demo ECU
//!
//! In-process ECU simulator behind the [`CommunicationChannel`] trait, so
//! the full stack (framing, codec, channel, sampler, maps) runs without
//! hardware. The engine model is driven by a seeded RNG: the same seed
//! produces the same drive cycle. Fault injection hooks let tests exercise
//! the corrupt-frame and timeout paths deliberately.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::maps::{default_boost_map, default_timing_map, MapId, TuningMap};
use crate::params::{ParameterTable, Pid};
use crate::protocol::{
    codec, CommunicationChannel, Frame, Message, ProtocolError, Request, FRAME_OVERHEAD,
    START_MARKER,
};

/// A stored trouble code with its captured freeze frame
#[derive(Debug, Clone)]
struct StoredDtc {
    code: String,
    freeze_frame: Vec<(Pid, f64)>,
}

/// Engine state evolved one step per parameter poll
struct EngineModel {
    rng: StdRng,
    phase: f64,
    throttle: f64,
    rpm: f64,
}

impl EngineModel {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            phase: 0.0,
            throttle: 0.1,
            rpm: 850.0,
        }
    }

    fn step(&mut self) {
        self.phase += 0.02;
        // Slow throttle sweep with jitter: idle, part throttle, WOT
        let target = (0.5 + 0.5 * self.phase.sin()).clamp(0.02, 1.0);
        self.throttle += (target - self.throttle) * 0.2 + self.rng.gen_range(-0.01..0.01);
        self.throttle = self.throttle.clamp(0.02, 1.0);

        let target_rpm = 850.0 + self.throttle * 5650.0;
        self.rpm += (target_rpm - self.rpm) * 0.15 + self.rng.gen_range(-25.0..25.0);
        self.rpm = self.rpm.clamp(850.0, 6800.0);
    }

    fn load_pct(&self) -> f64 {
        (self.throttle * 100.0).clamp(0.0, 100.0)
    }

    fn map_kpa(&mut self, boost_map: &TuningMap) -> f64 {
        if self.throttle < 0.3 {
            // Vacuum at light throttle
            30.0 + self.throttle * 150.0 + self.rng.gen_range(-2.0..2.0)
        } else {
            let target = boost_map.value_at(self.rpm, self.load_pct());
            target + self.rng.gen_range(-3.0..3.0)
        }
    }

    fn afr(&mut self) -> f64 {
        if self.load_pct() > 80.0 {
            11.5 + self.rng.gen_range(-0.3..0.3)
        } else {
            14.7 + self.rng.gen_range(-0.2..0.2)
        }
    }

    fn knock_retard(&mut self) -> f64 {
        // Occasional knock event at high load
        if self.load_pct() > 85.0 && self.rng.gen_bool(0.05) {
            self.rng.gen_range(0.25..1.5)
        } else {
            0.0
        }
    }
}

/// The simulated ECU
pub struct DemoEcu {
    table: Arc<ParameterTable>,
    engine: EngineModel,
    boost_map: TuningMap,
    timing_map: TuningMap,
    dtcs: Vec<StoredDtc>,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    corrupt_next: u32,
    drop_next: u32,
}

impl DemoEcu {
    /// Build a simulator with a fixed RNG seed
    pub fn new(seed: u64) -> Self {
        Self {
            table: Arc::new(ParameterTable::builtin()),
            engine: EngineModel::new(seed),
            boost_map: default_boost_map(),
            timing_map: default_timing_map(),
            dtcs: Vec::new(),
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            corrupt_next: 0,
            drop_next: 0,
        }
    }

    /// Corrupt the checksum of the next response frame. Calling this `n`
    /// times corrupts the next `n` responses.
    pub fn corrupt_next_response(&mut self) {
        self.corrupt_next += 1;
    }

    /// Swallow the next request entirely, producing a caller-side timeout.
    /// Calling this `n` times swallows the next `n` requests.
    pub fn drop_next_response(&mut self) {
        self.drop_next += 1;
    }

    /// Store a trouble code, capturing the current engine state as its
    /// freeze frame
    pub fn inject_dtc(&mut self, code: &str) {
        let map_kpa = self.engine.map_kpa(&self.boost_map);
        let freeze_frame = vec![
            (Pid(0x0C), self.engine.rpm),
            (Pid(0x04), self.engine.load_pct()),
            (Pid(0x0B), map_kpa),
        ];
        self.dtcs.push(StoredDtc {
            code: code.to_string(),
            freeze_frame,
        });
    }

    /// Current cell value of a simulator-side map
    pub fn map_cell(&self, map: MapId, rpm_idx: usize, load_idx: usize) -> Option<f64> {
        let m = match map {
            MapId::BoostTarget => &self.boost_map,
            MapId::IgnitionTiming => &self.timing_map,
        };
        m.cell(rpm_idx, load_idx).ok()
    }

    fn parameter_value(&mut self, pid: Pid) -> Option<f64> {
        self.engine.step();
        let value = match pid {
            Pid(0x0C) => self.engine.rpm,
            Pid(0x04) => self.engine.load_pct(),
            Pid(0x0B) => self.engine.map_kpa(&self.boost_map),
            Pid(0x0D) => self.engine.rpm / 40.0,
            Pid(0x0E) => self.timing_map.value_at(self.engine.rpm, self.engine.load_pct()),
            Pid(0x05) => 92.0 + self.engine.rng.gen_range(-1.0..1.0),
            Pid(0x0F) => 35.0 + self.engine.load_pct() / 8.0,
            Pid(0x10) => self.engine.rpm * self.engine.load_pct() / 2500.0,
            Pid(0x11) => self.engine.throttle * 100.0,
            Pid(0x34) => self.engine.afr(),
            Pid(0xA0) => self.engine.knock_retard(),
            Pid(0xA1) => self.boost_map.value_at(self.engine.rpm, self.engine.load_pct()),
            _ => return None,
        };
        Some(value)
    }

    fn respond(&mut self, request: Request) -> Option<Message> {
        match request {
            Request::ReadParameter(pid) => {
                let value = self.parameter_value(pid)?;
                let def = self.table.get(pid)?;
                Some(Message::Reading {
                    pid,
                    value,
                    unit: def.unit.clone(),
                })
            }
            Request::ReadDtc => Some(self.dtc_report()),
            Request::ClearDtc => {
                self.dtcs.clear();
                Some(Message::DtcCleared { ok: true })
            }
            Request::ReadFreezeFrame => {
                let mut report = self.dtc_report();
                if let Message::DtcReport { codes, .. } = &mut report {
                    codes.clear();
                }
                Some(report)
            }
            Request::WriteMapCell {
                map,
                rpm_idx,
                load_idx,
                value,
            } => {
                let target = match map {
                    MapId::BoostTarget => &mut self.boost_map,
                    MapId::IgnitionTiming => &mut self.timing_map,
                };
                let ok = match target
                    .values
                    .get_mut(rpm_idx as usize)
                    .and_then(|row| row.get_mut(load_idx as usize))
                {
                    Some(cell) => {
                        *cell = value;
                        true
                    }
                    None => false,
                };
                Some(Message::MapAck { map, ok })
            }
            Request::ReadMapCell {
                map,
                rpm_idx,
                load_idx,
            } => {
                let value = self.map_cell(map, rpm_idx as usize, load_idx as usize)?;
                Some(Message::MapCell {
                    map,
                    rpm_idx,
                    load_idx,
                    value,
                })
            }
            Request::Heartbeat => Some(Message::Heartbeat),
        }
    }

    fn dtc_report(&mut self) -> Message {
        let codes = self.dtcs.iter().map(|d| d.code.clone()).collect();
        let freeze_frame = self
            .dtcs
            .last()
            .map(|d| {
                d.freeze_frame
                    .iter()
                    .filter_map(|(pid, value)| {
                        let def = self.table.get(*pid)?;
                        Some(crate::protocol::FreezeFrameEntry {
                            pid: *pid,
                            name: def.name.clone(),
                            value: *value,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Message::DtcReport {
            codes,
            freeze_frame,
        }
    }

    /// Process every complete request frame buffered so far
    fn process_inbound(&mut self) {
        loop {
            match self.inbound.iter().position(|&b| b == START_MARKER) {
                Some(0) => {}
                Some(pos) => {
                    self.inbound.drain(..pos);
                }
                None => {
                    self.inbound.clear();
                    return;
                }
            }
            if self.inbound.len() < 2 {
                return;
            }
            let total = self.inbound[1] as usize + FRAME_OVERHEAD;
            if self.inbound.len() < total {
                return;
            }

            let frame_bytes: Vec<u8> = self.inbound.drain(..total).collect();
            let request = match Frame::from_bytes(&frame_bytes) {
                Ok((frame, _)) => match codec::decode_request(&frame) {
                    Ok(request) => request,
                    Err(e) => {
                        debug!(error = %e, "demo ECU ignoring undecodable request");
                        continue;
                    }
                },
                Err(ProtocolError::FrameCorrupt(fault)) => {
                    debug!(%fault, "demo ECU ignoring corrupt request frame");
                    continue;
                }
                Err(_) => continue,
            };

            if self.drop_next > 0 {
                self.drop_next -= 1;
                trace!(?request, "demo ECU dropping request");
                continue;
            }

            let Some(message) = self.respond(request) else {
                continue;
            };
            let Ok(frame) = codec::encode_message(&message, &self.table) else {
                continue;
            };
            let mut bytes = frame.to_bytes();
            if self.corrupt_next > 0 {
                self.corrupt_next -= 1;
                let last = bytes.len() - 1;
                bytes[last] ^= 0xFF;
                trace!("demo ECU corrupting response checksum");
            }
            self.outbound.extend(bytes);
        }
    }
}

impl Read for DemoEcu {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outbound.is_empty() {
            // Mirrors a serial read timeout with nothing on the wire
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.outbound.len());
        for slot in buf.iter_mut().take(n) {
            if let Some(byte) = self.outbound.pop_front() {
                *slot = byte;
            }
        }
        Ok(n)
    }
}

impl Write for DemoEcu {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inbound.extend_from_slice(buf);
        self.process_inbound();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for DemoEcu {
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.outbound.clear();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.outbound.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{decode, encode};
    use crate::protocol::FrameFault;

    fn exchange(ecu: &mut DemoEcu, request: &Request) -> Vec<u8> {
        ecu.write_all(&encode(request).to_bytes()).unwrap();
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        while let Ok(n) = ecu.read(&mut chunk) {
            out.extend_from_slice(&chunk[..n]);
        }
        out
    }

    #[test]
    fn test_parameter_read_roundtrip() {
        let mut ecu = DemoEcu::new(42);
        let table = ParameterTable::builtin();

        let bytes = exchange(&mut ecu, &Request::ReadParameter(Pid(0x0C)));
        let (frame, _) = Frame::from_bytes(&bytes).unwrap();
        match decode(&frame, &table).unwrap() {
            Message::Reading { pid, value, .. } => {
                assert_eq!(pid, Pid(0x0C));
                assert!((850.0..=6800.0).contains(&value));
            }
            other => panic!("expected Reading, got {other:?}"),
        }
    }

    #[test]
    fn test_same_seed_same_trace() {
        let table = ParameterTable::builtin();
        let read = |ecu: &mut DemoEcu| -> Vec<f64> {
            (0..20)
                .map(|_| {
                    let bytes = exchange(ecu, &Request::ReadParameter(Pid(0x0C)));
                    let (frame, _) = Frame::from_bytes(&bytes).unwrap();
                    match decode(&frame, &table).unwrap() {
                        Message::Reading { value, .. } => value,
                        other => panic!("expected Reading, got {other:?}"),
                    }
                })
                .collect()
        };

        let a = read(&mut DemoEcu::new(7));
        let b = read(&mut DemoEcu::new(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_map_write_and_readback() {
        let mut ecu = DemoEcu::new(1);
        let table = ParameterTable::builtin();

        let bytes = exchange(
            &mut ecu,
            &Request::WriteMapCell {
                map: MapId::BoostTarget,
                rpm_idx: 2,
                load_idx: 3,
                value: 152.5,
            },
        );
        let (frame, _) = Frame::from_bytes(&bytes).unwrap();
        assert!(matches!(
            decode(&frame, &table).unwrap(),
            Message::MapAck { ok: true, .. }
        ));

        let bytes = exchange(
            &mut ecu,
            &Request::ReadMapCell {
                map: MapId::BoostTarget,
                rpm_idx: 2,
                load_idx: 3,
            },
        );
        let (frame, _) = Frame::from_bytes(&bytes).unwrap();
        match decode(&frame, &table).unwrap() {
            Message::MapCell { value, .. } => assert_eq!(value, 152.5),
            other => panic!("expected MapCell, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_cell_nacked() {
        let mut ecu = DemoEcu::new(1);
        let table = ParameterTable::builtin();
        let bytes = exchange(
            &mut ecu,
            &Request::WriteMapCell {
                map: MapId::BoostTarget,
                rpm_idx: 99,
                load_idx: 0,
                value: 120.0,
            },
        );
        let (frame, _) = Frame::from_bytes(&bytes).unwrap();
        assert!(matches!(
            decode(&frame, &table).unwrap(),
            Message::MapAck { ok: false, .. }
        ));
    }

    #[test]
    fn test_dtc_lifecycle() {
        let mut ecu = DemoEcu::new(1);
        let table = ParameterTable::builtin();
        ecu.inject_dtc("P0234");

        let bytes = exchange(&mut ecu, &Request::ReadDtc);
        let (frame, _) = Frame::from_bytes(&bytes).unwrap();
        match decode(&frame, &table).unwrap() {
            Message::DtcReport {
                codes,
                freeze_frame,
            } => {
                assert_eq!(codes, vec!["P0234".to_string()]);
                assert!(!freeze_frame.is_empty());
            }
            other => panic!("expected DtcReport, got {other:?}"),
        }

        let bytes = exchange(&mut ecu, &Request::ClearDtc);
        let (frame, _) = Frame::from_bytes(&bytes).unwrap();
        assert!(matches!(
            decode(&frame, &table).unwrap(),
            Message::DtcCleared { ok: true }
        ));

        let bytes = exchange(&mut ecu, &Request::ReadDtc);
        let (frame, _) = Frame::from_bytes(&bytes).unwrap();
        match decode(&frame, &table).unwrap() {
            Message::DtcReport { codes, .. } => assert!(codes.is_empty()),
            other => panic!("expected DtcReport, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_injection_breaks_checksum() {
        let mut ecu = DemoEcu::new(1);
        ecu.corrupt_next_response();
        let bytes = exchange(&mut ecu, &Request::Heartbeat);
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(ProtocolError::FrameCorrupt(FrameFault::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_dropped_request_produces_silence() {
        let mut ecu = DemoEcu::new(1);
        ecu.drop_next_response();
        let bytes = exchange(&mut ecu, &Request::Heartbeat);
        assert!(bytes.is_empty());
    }
}
