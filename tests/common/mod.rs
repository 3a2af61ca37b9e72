#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use odrive_control_lib::config::{ProtocolSettings, SerialSettings};
use odrive_control_lib::serial::engine::EngineEvent;
use odrive_control_lib::serial::{
    OdriveProtocol, PortDescriptor, PortOpener, PortStream, SerialError, SerialInterface, TransportEvent,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

pub const MOCK_PORT: &str = "/dev/ttyACM0";

/// Hands out in-memory streams; the device end of each opened port is sent
/// over a channel so the test can play the controller.
pub struct MockPortOpener {
    ports: Vec<PortDescriptor>,
    device_tx: mpsc::UnboundedSender<MockDevice>,
    opens: AtomicUsize,
    failing: AtomicBool,
}

impl MockPortOpener {
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Make every following open fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl PortOpener for MockPortOpener {
    fn enumerate(&self) -> Vec<PortDescriptor> {
        self.ports.clone()
    }

    async fn open(&self, port_name: &str) -> Result<Box<dyn PortStream>, SerialError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SerialError::ConnectionFailed(format!("{}: no such device", port_name)));
        }
        let (host, device) = tokio::io::duplex(4096);
        let _ = self.device_tx.send(MockDevice::new(device));
        Ok(Box::new(host))
    }
}

pub fn odrive_port() -> PortDescriptor {
    PortDescriptor {
        port_name: MOCK_PORT.to_string(),
        vid: Some(0x1209),
        pid: Some(0x0D32),
        serial_number: Some("3473385A3235".to_string()),
        manufacturer: Some("ODrive Robotics".to_string()),
        product: Some("ODrive v3.6 CDC Interface".to_string()),
    }
}

pub fn mock_opener(ports: Vec<PortDescriptor>) -> (Arc<MockPortOpener>, mpsc::UnboundedReceiver<MockDevice>) {
    let (device_tx, device_rx) = mpsc::unbounded_channel();
    let opener = MockPortOpener { ports, device_tx, opens: AtomicUsize::new(0), failing: AtomicBool::new(false) };
    (Arc::new(opener), device_rx)
}

/// Controller side of a mock link
pub struct MockDevice {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl MockDevice {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self { lines: BufReader::new(reader).lines(), writer }
    }

    /// Next line written by the host, without the terminator
    pub async fn next_line(&mut self) -> String {
        self.lines.next_line().await.unwrap().expect("host closed the link")
    }

    /// Like `next_line`, but `None` once the host side is gone
    pub async fn try_next_line(&mut self) -> Option<String> {
        self.lines.next_line().await.ok().flatten()
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Read one tagged request and answer it with `body`. Returns the request.
    pub async fn answer(&mut self, body: &str) -> String {
        let request = self.next_line().await;
        let tag = tag_of(&request).unwrap_or_else(|| panic!("untagged request '{}'", request));
        self.send_line(&format!("{} #{}", body, tag)).await;
        request
    }
}

/// `req_N` of a tagged request line
pub fn tag_of(line: &str) -> Option<String> {
    line.rsplit_once(" #").map(|(_, tag)| tag.to_string()).filter(|tag| tag.starts_with("req_"))
}

pub struct Harness {
    pub protocol: OdriveProtocol,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub opener: Arc<MockPortOpener>,
    pub devices: mpsc::UnboundedReceiver<MockDevice>,
}

impl Harness {
    pub fn new() -> Self {
        let (opener, devices) = mock_opener(vec![odrive_port()]);
        let (interface, transport_rx) = SerialInterface::spawn(opener.clone(), SerialSettings::default());
        let (protocol, events) = OdriveProtocol::spawn(interface, transport_rx, ProtocolSettings::default(), 100.0);
        Self { protocol, events, opener, devices }
    }

    /// Connect to the mock port and return the controller end.
    pub async fn connect(&mut self) -> MockDevice {
        self.protocol.interface().connect(MOCK_PORT).await.unwrap();
        self.devices.recv().await.unwrap()
    }

    /// Skip events until one matches.
    pub async fn wait_for_event(&mut self, matches: impl Fn(&EngineEvent) -> bool) -> EngineEvent {
        loop {
            let event = self.events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    }
}

/// Collect transport events until one matches (inclusive).
pub async fn collect_transport_until(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    last: impl Fn(&TransportEvent) -> bool,
) -> Vec<TransportEvent> {
    let mut seen = Vec::new();
    loop {
        let event = events.recv().await.expect("transport channel closed");
        let done = last(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}
