//! Serial transport: owns the one open port, frames it into lines and
//! reconnects after unexpected loss.
//!
//! All port state lives in a single actor task. [`SerialInterface`] is a cheap
//! cloneable handle that talks to it over a command channel; line and
//! connection events flow out through one unbounded channel to a single
//! consumer (normally the protocol engine).

use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tokio_util::codec::FramedRead;

use super::codec::LineCodec;
use super::port::{PortOpener, PortStream};
use super::{PortDescriptor, Result, SerialError};
use crate::config::SerialSettings;

/// Physical link state as seen by the transport actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Closed,
    Open,
    /// Link lost; a reconnect attempt is scheduled or running
    Reconnecting,
}

/// Snapshot of the connection owned by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Current port, or the last one used while reconnecting / after loss
    pub port: Option<PortDescriptor>,
    pub state: LinkState,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
}

/// Events emitted by the transport actor
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected(PortDescriptor),
    Disconnected { port: String, unexpected: bool },
    /// One complete, trimmed, non-empty line from the wire
    Line(String),
    Error(String),
    ReconnectAttempt { attempt: u32, max: u32 },
    ReconnectFailed { attempt: u32, error: String },
    ReconnectExhausted { attempts: u32 },
}

#[derive(Debug)]
enum TransportCommand {
    Connect { port: String, responder: oneshot::Sender<Result<PortDescriptor>> },
    Disconnect { responder: oneshot::Sender<()> },
    Send { data: Vec<u8>, responder: oneshot::Sender<Result<()>> },
}

/// Handle to the transport actor
#[derive(Clone)]
pub struct SerialInterface {
    cmd_tx: mpsc::Sender<TransportCommand>,
    connection_rx: watch::Receiver<Connection>,
    opener: Arc<dyn PortOpener>,
}

impl SerialInterface {
    /// Spawn the transport actor on the current tokio runtime.
    ///
    /// Returns the handle and the receiving end of the event channel. The
    /// actor stops once every handle clone has been dropped.
    pub fn spawn(
        opener: Arc<dyn PortOpener>,
        settings: SerialSettings,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = watch::channel(Connection {
            port: None,
            state: LinkState::Closed,
            reconnect_attempts: 0,
            max_reconnect_attempts: settings.max_reconnect_attempts,
        });

        let actor = TransportActor {
            opener: opener.clone(),
            settings,
            events_tx,
            connection_tx,
            link: None,
            last_port: None,
            attempts: 0,
            retry_at: None,
        };
        tokio::spawn(actor.run(cmd_rx));

        (Self { cmd_tx, connection_rx, opener }, events_rx)
    }

    /// List serial ports currently attached
    pub fn enumerate(&self) -> Vec<PortDescriptor> {
        self.opener.enumerate()
    }

    /// Open `port_name`, closing any existing link first
    pub async fn connect(&self, port_name: &str) -> Result<PortDescriptor> {
        let (tx, rx) = oneshot::channel();
        self.request(TransportCommand::Connect { port: port_name.to_string(), responder: tx }).await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Close the link and cancel any pending reconnect. Idempotent.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.request(TransportCommand::Disconnect { responder: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Write raw bytes to the open link
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(TransportCommand::Send { data: data.to_vec(), responder: tx }).await?;
        rx.await.map_err(|_| stopped())?
    }

    pub fn is_connected(&self) -> bool {
        self.connection_rx.borrow().state == LinkState::Open
    }

    pub fn connection(&self) -> Connection {
        self.connection_rx.borrow().clone()
    }

    pub fn connection_receiver(&self) -> watch::Receiver<Connection> {
        self.connection_rx.clone()
    }

    async fn request(&self, cmd: TransportCommand) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| stopped())
    }
}

fn stopped() -> SerialError {
    SerialError::ProtocolError("Transport task stopped".into())
}

struct Link {
    frames: FramedRead<ReadHalf<Box<dyn PortStream>>, LineCodec>,
    writer: WriteHalf<Box<dyn PortStream>>,
    descriptor: PortDescriptor,
    opened_at: Instant,
}

struct TransportActor {
    opener: Arc<dyn PortOpener>,
    settings: SerialSettings,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    connection_tx: watch::Sender<Connection>,
    link: Option<Link>,
    last_port: Option<PortDescriptor>,
    attempts: u32,
    /// The single reconnect timer; `None` when no retry is scheduled
    retry_at: Option<Instant>,
}

impl TransportActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<TransportCommand>) {
        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                },
                frame = next_frame(&mut self.link), if self.link.is_some() => {
                    match frame {
                        Some(Ok(line)) => self.emit(TransportEvent::Line(line)),
                        Some(Err(e)) => self.link_lost(Some(e.to_string())),
                        None => self.link_lost(None),
                    }
                },
                _ = retry_timer(self.retry_at), if self.retry_at.is_some() => {
                    self.attempt_reconnect().await;
                },
            }
        }

        if let Some(link) = self.link.take() {
            log::debug!("Transport shutting down, closing {}", link.descriptor.port_name);
        }
    }

    async fn handle_command(&mut self, cmd: TransportCommand) {
        match cmd {
            TransportCommand::Connect { port, responder } => {
                self.retry_at = None;
                self.attempts = 0;
                self.close_link();

                let result = self.open_link(&port).await;
                match &result {
                    Ok(descriptor) => {
                        log::info!("Connected to {}", descriptor.port_name);
                        self.emit(TransportEvent::Connected(descriptor.clone()));
                    }
                    Err(e) => {
                        log::error!("Failed to open {}: {}", port, e);
                        self.emit(TransportEvent::Error(e.to_string()));
                        self.publish(LinkState::Closed);
                    }
                }
                let _ = responder.send(result);
            }
            TransportCommand::Disconnect { responder } => {
                self.retry_at = None;
                self.attempts = 0;
                self.close_link();
                self.publish(LinkState::Closed);
                let _ = responder.send(());
            }
            TransportCommand::Send { data, responder } => {
                let result = match self.link.as_mut() {
                    None => Err(SerialError::NotConnected),
                    Some(link) => write_frame(&mut link.writer, &data, self.settings.write_timeout()).await,
                };
                let failure = match &result {
                    Err(SerialError::IoError(e)) => Some(e.to_string()),
                    Err(SerialError::Timeout) => {
                        Some(format!("write not accepted within {:?}", self.settings.write_timeout()))
                    }
                    _ => None,
                };
                let _ = responder.send(result);
                if let Some(error) = failure {
                    self.link_lost(Some(error));
                }
            }
        }
    }

    async fn open_link(&mut self, port_name: &str) -> Result<PortDescriptor> {
        let stream = self.opener.open(port_name).await?;
        let descriptor = self
            .opener
            .enumerate()
            .into_iter()
            .find(|d| d.port_name == port_name)
            .unwrap_or_else(|| PortDescriptor::from_path(port_name));

        let (reader, writer) = tokio::io::split(stream);
        self.link = Some(Link {
            frames: FramedRead::new(reader, LineCodec::with_max_length(self.settings.max_line_length)),
            writer,
            descriptor: descriptor.clone(),
            opened_at: Instant::now(),
        });
        self.last_port = Some(descriptor.clone());
        self.publish(LinkState::Open);
        Ok(descriptor)
    }

    /// Explicit close; never triggers a reconnect
    fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            log::info!("Disconnecting from {}", link.descriptor.port_name);
            self.emit(TransportEvent::Disconnected {
                port: link.descriptor.port_name,
                unexpected: false,
            });
        }
    }

    fn link_lost(&mut self, error: Option<String>) {
        let Some(link) = self.link.take() else { return };
        let port = link.descriptor.port_name.clone();

        match &error {
            Some(e) => log::warn!("Serial link on {} failed: {}", port, e),
            None => log::warn!("Serial link on {} closed unexpectedly", port),
        }
        if let Some(e) = error {
            self.emit(TransportEvent::Error(e));
        }
        self.emit(TransportEvent::Disconnected { port, unexpected: true });

        if link.opened_at.elapsed() >= self.settings.reconnect_stable_after() {
            self.attempts = 0;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.attempts >= self.settings.max_reconnect_attempts {
            log::error!("Reconnect budget exhausted after {} attempts", self.attempts);
            self.retry_at = None;
            self.emit(TransportEvent::ReconnectExhausted { attempts: self.attempts });
            self.publish(LinkState::Closed);
            return;
        }
        self.retry_at = Some(Instant::now() + self.settings.reconnect_delay());
        self.publish(LinkState::Reconnecting);
    }

    async fn attempt_reconnect(&mut self) {
        self.retry_at = None;
        let Some(port) = self.last_port.as_ref().map(|p| p.port_name.clone()) else {
            self.publish(LinkState::Closed);
            return;
        };

        self.attempts += 1;
        let max = self.settings.max_reconnect_attempts;
        log::info!("Reconnect attempt {}/{} on {}", self.attempts, max, port);
        self.emit(TransportEvent::ReconnectAttempt { attempt: self.attempts, max });

        match self.open_link(&port).await {
            Ok(descriptor) => {
                log::info!("Reconnected to {}", descriptor.port_name);
                self.emit(TransportEvent::Connected(descriptor));
            }
            Err(e) => {
                log::warn!("Reconnect attempt {} failed: {}", self.attempts, e);
                self.emit(TransportEvent::ReconnectFailed { attempt: self.attempts, error: e.to_string() });
                self.schedule_reconnect();
            }
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    fn publish(&self, state: LinkState) {
        self.connection_tx.send_replace(Connection {
            port: self.last_port.clone(),
            state,
            reconnect_attempts: self.attempts,
            max_reconnect_attempts: self.settings.max_reconnect_attempts,
        });
    }
}

async fn next_frame(link: &mut Option<Link>) -> Option<std::io::Result<String>> {
    match link.as_mut() {
        Some(link) => link.frames.next().await,
        None => std::future::pending().await,
    }
}

async fn retry_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Write and flush one frame. A port that stops draining fails with `Timeout`.
async fn write_frame(writer: &mut WriteHalf<Box<dyn PortStream>>, data: &[u8], limit: Duration) -> Result<()> {
    let write = async {
        writer.write_all(data).await?;
        writer.flush().await
    };
    match timeout(limit, write).await {
        Ok(result) => result.map_err(SerialError::IoError),
        Err(_) => Err(SerialError::Timeout),
    }
}
