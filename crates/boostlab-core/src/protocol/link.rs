//! Link transport
//!
//! Owns the byte channel to the ECU adapter: frames outgoing requests,
//! scans the inbound stream for valid frames, and tracks link health
//! through an explicit Connected -> Degraded -> Reconnecting state machine
//! with bounded exponential backoff. Corrupt frames are discarded and
//! surfaced as events, never as crashes of dependents.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::frame::{Frame, FrameFault, START_MARKER};
use super::serial::{clear_buffers, configure_port, open_port};
use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Abstraction over the byte channel (serial port, demo ECU, test double)
pub trait CommunicationChannel: Read + Write + Send {
    /// Set the timeout for individual read operations
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard any unread inbound bytes
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Number of bytes available to read without blocking
    fn bytes_to_read(&mut self) -> io::Result<u32>;
}

/// Serial port wrapper implementing [`CommunicationChannel`]
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an open serial port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl CommunicationChannel for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port
            .bytes_to_read()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Link configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Timeout for one request/reply exchange
    pub frame_timeout: Duration,
    /// Idle time after which a heartbeat is due
    pub heartbeat_idle: Duration,
    /// Base reconnect backoff
    pub reconnect_base: Duration,
    /// Reconnect backoff cap
    pub reconnect_cap: Duration,
    /// How many times a request is re-sent after a corrupt reply
    pub corrupt_retries: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            frame_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            heartbeat_idle: Duration::from_secs(2),
            reconnect_base: Duration::from_millis(200),
            reconnect_cap: Duration::from_secs(5),
            corrupt_retries: 1,
        }
    }
}

/// Link health state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Healthy, request/reply cycles succeeding
    Connected,
    /// Recent failures; still usable but staleness expected downstream
    Degraded,
    /// Channel lost; reopen attempts in progress with backoff
    Reconnecting,
}

/// Non-fatal link notifications broadcast to listeners
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A frame failed validation and was discarded
    FrameCorrupt(FrameFault),
    /// The link entered the degraded state
    Degraded,
    /// A reconnect attempt is about to run
    Reconnecting {
        /// Attempt counter since the link was lost
        attempt: u32,
        /// Backoff applied before this attempt
        backoff: Duration,
    },
    /// The channel was reopened successfully
    Reconnected,
}

type ReopenFn = Box<dyn Fn() -> Result<Box<dyn CommunicationChannel>, ProtocolError> + Send>;

/// The link transport
pub struct Link {
    channel: Option<Box<dyn CommunicationChannel>>,
    reopen: Option<ReopenFn>,
    config: LinkConfig,
    state: LinkState,
    rx_buf: Vec<u8>,
    last_activity: Instant,
    reconnect_attempt: u32,
    events: broadcast::Sender<LinkEvent>,
}

impl Link {
    /// Open the configured serial port and wrap it in a link.
    ///
    /// Fails with `LinkUnavailable` if the port cannot be opened.
    pub fn open(config: LinkConfig) -> Result<Self, ProtocolError> {
        let port_name = config.port_name.clone();
        let baud = config.baud_rate;
        let reopen: ReopenFn = Box::new(move || {
            let mut port = open_port(&port_name, Some(baud))?;
            configure_port(port.as_mut())?;
            clear_buffers(port.as_mut())?;
            Ok(Box::new(SerialChannel::new(port)) as Box<dyn CommunicationChannel>)
        });

        let channel = reopen()?;
        Ok(Self::build(channel, Some(reopen), config))
    }

    /// Wrap an already-open channel (demo ECU, tests).
    ///
    /// Such links cannot reconnect after a disconnect.
    pub fn from_channel(channel: Box<dyn CommunicationChannel>, config: LinkConfig) -> Self {
        Self::build(channel, None, config)
    }

    fn build(channel: Box<dyn CommunicationChannel>, reopen: Option<ReopenFn>, config: LinkConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            channel: Some(channel),
            reopen,
            config,
            state: LinkState::Connected,
            rx_buf: Vec::new(),
            last_activity: Instant::now(),
            reconnect_attempt: 0,
            events,
        }
    }

    /// Subscribe to link events
    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Link configuration
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Whether the idle window has elapsed and a heartbeat is due
    pub fn heartbeat_due(&self) -> bool {
        self.last_activity.elapsed() >= self.config.heartbeat_idle
    }

    fn emit(&self, event: LinkEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn channel_mut(&mut self) -> Result<&mut Box<dyn CommunicationChannel>, ProtocolError> {
        self.channel.as_mut().ok_or(ProtocolError::Disconnected)
    }

    /// Send a single frame
    pub fn send_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let bytes = frame.to_bytes();
        let channel = self.channel_mut()?;
        match channel.write_all(&bytes).and_then(|_| channel.flush()) {
            Ok(()) => {
                self.last_activity = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.on_channel_lost();
                Err(ProtocolError::from(e))
            }
        }
    }

    /// Receive one frame, waiting up to the frame timeout.
    ///
    /// Garbage before a start marker is skipped silently; a frame that fails
    /// checksum validation is discarded, reported via [`LinkEvent::FrameCorrupt`],
    /// and surfaced as a `FrameCorrupt` error for the caller to retry.
    pub fn receive_frame(&mut self) -> Result<Frame, ProtocolError> {
        let deadline = Instant::now() + self.config.frame_timeout;
        let mut chunk = [0u8; 256];

        loop {
            // Drop garbage ahead of the next start marker
            match self.rx_buf.iter().position(|&b| b == START_MARKER) {
                Some(0) => {}
                Some(pos) => {
                    debug!(skipped = pos, "skipping bytes before start marker");
                    self.rx_buf.drain(..pos);
                }
                None => self.rx_buf.clear(),
            }

            if self.rx_buf.len() >= 2 {
                let total = self.rx_buf[1] as usize + super::frame::FRAME_OVERHEAD;
                if self.rx_buf.len() >= total {
                    match Frame::from_bytes(&self.rx_buf[..total]) {
                        Ok((frame, consumed)) => {
                            self.rx_buf.drain(..consumed);
                            self.last_activity = Instant::now();
                            if self.state == LinkState::Degraded {
                                self.state = LinkState::Connected;
                            }
                            return Ok(frame);
                        }
                        Err(ProtocolError::FrameCorrupt(fault)) => {
                            warn!(%fault, "discarding corrupt frame");
                            // Resync one byte past the bad marker
                            self.rx_buf.drain(..1);
                            self.emit(LinkEvent::FrameCorrupt(fault));
                            return Err(ProtocolError::FrameCorrupt(fault));
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(ProtocolError::Timeout);
            }

            let channel = self.channel_mut()?;
            match channel.read(&mut chunk) {
                Ok(0) => {
                    self.on_channel_lost();
                    return Err(ProtocolError::Disconnected);
                }
                Ok(n) => self.rx_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.on_channel_lost();
                    return Err(ProtocolError::from(e));
                }
            }
        }
    }

    /// One half-duplex request/reply exchange.
    ///
    /// A corrupt reply discards the frame and re-sends the request up to the
    /// configured retry count; with no valid reply after that the exchange
    /// surfaces a timeout.
    pub fn request(&mut self, frame: &Frame) -> Result<Frame, ProtocolError> {
        let attempts = 1 + self.config.corrupt_retries;
        let mut last_err = ProtocolError::Timeout;

        for attempt in 0..attempts {
            if attempt > 0 {
                debug!(attempt, "retrying request after corrupt reply");
            }
            self.send_frame(frame)?;
            match self.receive_frame() {
                Ok(reply) => return Ok(reply),
                Err(e @ ProtocolError::FrameCorrupt(_)) => {
                    last_err = e;
                    continue;
                }
                Err(ProtocolError::Timeout) => {
                    self.mark_degraded();
                    return Err(ProtocolError::Timeout);
                }
                Err(e) => return Err(e),
            }
        }

        self.mark_degraded();
        // All retries consumed without a valid reply
        match last_err {
            ProtocolError::FrameCorrupt(_) => Err(ProtocolError::Timeout),
            other => Err(other),
        }
    }

    /// Flag the link degraded and notify listeners
    pub fn mark_degraded(&mut self) {
        if self.state == LinkState::Connected {
            warn!("link degraded");
            self.state = LinkState::Degraded;
            self.emit(LinkEvent::Degraded);
        }
    }

    fn on_channel_lost(&mut self) {
        self.channel = None;
        self.state = LinkState::Reconnecting;
        self.rx_buf.clear();
        self.emit(LinkEvent::Degraded);
    }

    /// Backoff to apply before the next reconnect attempt
    pub fn next_backoff(&self) -> Duration {
        let exp = self.reconnect_attempt.min(16);
        let backoff = self.config.reconnect_base.saturating_mul(1u32 << exp);
        backoff.min(self.config.reconnect_cap)
    }

    /// Whether the channel needs to be reopened
    pub fn needs_reconnect(&self) -> bool {
        self.channel.is_none()
    }

    /// Attempt to reopen the channel.
    ///
    /// The caller is responsible for sleeping [`Link::next_backoff`] between
    /// attempts; this keeps the transport itself clock-free and testable.
    pub fn try_reconnect(&mut self) -> Result<(), ProtocolError> {
        let Some(reopen) = self.reopen.as_ref() else {
            return Err(ProtocolError::Disconnected);
        };

        self.reconnect_attempt += 1;
        self.emit(LinkEvent::Reconnecting {
            attempt: self.reconnect_attempt,
            backoff: self.next_backoff(),
        });

        match reopen() {
            Ok(channel) => {
                debug!(attempt = self.reconnect_attempt, "link reconnected");
                self.channel = Some(channel);
                self.rx_buf.clear();
                self.state = LinkState::Connected;
                self.reconnect_attempt = 0;
                self.last_activity = Instant::now();
                self.emit(LinkEvent::Reconnected);
                Ok(())
            }
            Err(e) => {
                debug!(attempt = self.reconnect_attempt, error = %e, "reconnect attempt failed");
                Err(e)
            }
        }
    }
}
