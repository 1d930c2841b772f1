//! Link-level tests against the demo ECU: framing, corrupt-reply retry,
//! and timeout handling over a real byte channel.

use boostlab_core::demo::DemoEcu;
use boostlab_core::params::{ParameterTable, Pid};
use boostlab_core::protocol::{
    codec, CommunicationChannel, Link, LinkConfig, LinkEvent, LinkState, Message, ProtocolError,
    Request,
};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Channel wrapper that keeps a handle on the simulator for fault injection
#[derive(Clone)]
struct SharedEcu(Arc<Mutex<DemoEcu>>);

impl SharedEcu {
    fn new(seed: u64) -> Self {
        Self(Arc::new(Mutex::new(DemoEcu::new(seed))))
    }
}

impl Read for SharedEcu {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.lock().unwrap().read(buf)
    }
}

impl Write for SharedEcu {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

impl CommunicationChannel for SharedEcu {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.0.lock().unwrap().set_timeout(timeout)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().clear_input_buffer()
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.0.lock().unwrap().bytes_to_read()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> LinkConfig {
    init_tracing();
    LinkConfig {
        frame_timeout: Duration::from_millis(100),
        ..LinkConfig::default()
    }
}

#[test]
fn test_request_reply_end_to_end() {
    let ecu = SharedEcu::new(42);
    let mut link = Link::from_channel(Box::new(ecu), test_config());
    let table = ParameterTable::builtin();

    let reply = link
        .request(&codec::encode(&Request::ReadParameter(Pid(0x0C))))
        .expect("exchange should succeed");
    match codec::decode(&reply, &table).unwrap() {
        Message::Reading { pid, value, .. } => {
            assert_eq!(pid, Pid(0x0C));
            assert!((850.0..=6800.0).contains(&value));
        }
        other => panic!("expected Reading, got {other:?}"),
    }
    assert_eq!(link.state(), LinkState::Connected);
}

#[test]
fn test_corrupt_reply_retried_once() {
    let ecu = SharedEcu::new(42);
    let handle = ecu.clone();
    let mut link = Link::from_channel(Box::new(ecu), test_config());
    let mut events = link.subscribe_events();

    handle.0.lock().unwrap().corrupt_next_response();

    // First reply fails the checksum; the re-sent request gets a clean one
    let reply = link
        .request(&codec::encode(&Request::Heartbeat))
        .expect("retry should recover from one corrupt reply");
    let table = ParameterTable::builtin();
    assert!(matches!(
        codec::decode(&reply, &table).unwrap(),
        Message::Heartbeat
    ));

    assert!(matches!(
        events.try_recv(),
        Ok(LinkEvent::FrameCorrupt(_))
    ));
    assert_eq!(link.state(), LinkState::Connected);
}

#[test]
fn test_two_corrupt_replies_become_timeout() {
    let ecu = SharedEcu::new(42);
    let handle = ecu.clone();
    let mut link = Link::from_channel(Box::new(ecu), test_config());

    // Corrupt the original reply and the retry's reply
    {
        let mut guard = handle.0.lock().unwrap();
        guard.corrupt_next_response();
        guard.corrupt_next_response();
    }

    let result = link.request(&codec::encode(&Request::Heartbeat));
    assert!(matches!(result, Err(ProtocolError::Timeout)));
    assert_eq!(link.state(), LinkState::Degraded);

    // The next clean exchange resyncs past the leftover garbage
    let reply = link.request(&codec::encode(&Request::Heartbeat));
    assert!(reply.is_ok());
    assert_eq!(link.state(), LinkState::Connected);
}

#[test]
fn test_silent_ecu_times_out_and_degrades() {
    let ecu = SharedEcu::new(42);
    let handle = ecu.clone();
    let mut link = Link::from_channel(Box::new(ecu), test_config());

    handle.0.lock().unwrap().drop_next_response();

    let result = link.request(&codec::encode(&Request::Heartbeat));
    assert!(matches!(result, Err(ProtocolError::Timeout)));
    assert_eq!(link.state(), LinkState::Degraded);

    // A successful exchange afterwards restores the link
    let reply = link.request(&codec::encode(&Request::Heartbeat));
    assert!(reply.is_ok());
    assert_eq!(link.state(), LinkState::Connected);
}

#[test]
fn test_channel_link_reports_disconnected_not_reconnecting() {
    let ecu = SharedEcu::new(42);
    let mut link = Link::from_channel(Box::new(ecu), test_config());
    assert!(!link.needs_reconnect());
    assert!(matches!(
        link.try_reconnect(),
        Err(ProtocolError::Disconnected)
    ));
}
