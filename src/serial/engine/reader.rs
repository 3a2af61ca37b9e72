//! The protocol engine task.
//!
//! One task owns the pending table, the tag counter and the telemetry
//! scheduler. It multiplexes handle commands, transport events, request
//! deadlines and telemetry ticks in a single `select!` loop, so none of that
//! state needs a lock.
//!
//! Writes go through a separate queue task in submission order. The loop only
//! learns their outcome afterwards, so a port that stops draining cannot hold
//! up deadlines or line routing.

use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, watch};

use super::pending::{PendingTable, TagAllocator};
use super::types::*;
use crate::serial::{Result, SerialError, SerialInterface, TransportEvent};
use crate::telemetry::TelemetryScheduler;

/// One line queued for the writer task
enum Outbound {
    Request { tag: String, line: String },
    Telemetry { generation: u64, line: String },
}

/// Outcome of a queued write, reported back to the engine loop
enum WriteDone {
    Request { tag: String, result: Result<()> },
    Telemetry { generation: u64, result: Result<()> },
}

pub(crate) struct Engine {
    interface: SerialInterface,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    written_rx: mpsc::UnboundedReceiver<WriteDone>,
    /// A batch is queued or being written; ticks are skipped until it settles
    telemetry_in_flight: bool,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    metrics_tx: watch::Sender<EngineMetrics>,
    metrics: EngineMetrics,
    request_timeout: Duration,
    tags: TagAllocator,
    pending: PendingTable,
    telemetry: TelemetryScheduler,
}

impl Engine {
    pub(crate) fn new(
        interface: SerialInterface,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
        metrics_tx: watch::Sender<EngineMetrics>,
        request_timeout: Duration,
        max_rate_hz: f64,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_queue(interface.clone(), outbound_rx, written_tx));

        Self {
            interface,
            outbound_tx,
            written_rx,
            telemetry_in_flight: false,
            events_tx,
            metrics_tx,
            metrics: EngineMetrics::default(),
            request_timeout,
            tags: TagAllocator::default(),
            pending: PendingTable::new(),
            telemetry: TelemetryScheduler::new(max_rate_hz),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut transport_open = true;

        loop {
            select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(EngineCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                },
                maybe_event = transport_rx.recv(), if transport_open => {
                    match maybe_event {
                        Some(event) => self.handle_transport(event),
                        None => {
                            log::error!("Transport event channel closed");
                            transport_open = false;
                        }
                    }
                },
                Some(done) = self.written_rx.recv() => {
                    self.handle_write_done(done);
                },
                (tag, command) = self.pending.next_expired(), if !self.pending.is_empty() => {
                    self.metrics.timeouts += 1;
                    log::warn!("Request {} ('{}') timed out after {:?}", tag, command, self.request_timeout);
                },
                _ = self.telemetry.tick() => {
                    self.queue_telemetry_batch();
                },
            }
            self.publish_metrics();
        }

        self.telemetry.stop();
        self.pending.drain("engine stopped");
        self.publish_metrics();
        log::debug!("Protocol engine stopped");
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Request { command, responder } => {
                // checked before a tag is spent
                if !self.interface.is_connected() {
                    let _ = responder.send(Err(SerialError::NotConnected));
                    return;
                }

                let tag = self.tags.next_tag();
                let line = format!("{} #{}\n", command.trim(), tag);
                log::debug!("-> {}", line.trim_end());
                self.pending.insert(tag.clone(), command, self.request_timeout, responder);

                if self.outbound_tx.send(Outbound::Request { tag: tag.clone(), line }).is_err() {
                    self.pending.reject(&tag, SerialError::ProtocolError("writer stopped".into()));
                }
            }
            EngineCommand::StartTelemetry { keys, rate_hz, responder } => {
                let was_running = self.telemetry.is_running();
                match self.telemetry.start(keys, rate_hz) {
                    Ok(rate) => {
                        if was_running {
                            self.emit(EngineEvent::TelemetryStopped);
                        }
                        log::info!("Telemetry started at {} Hz for {:?}", rate, self.telemetry.keys());
                        self.emit(EngineEvent::TelemetryStarted {
                            keys: self.telemetry.keys().to_vec(),
                            rate_hz: rate,
                        });
                        let _ = responder.send(Ok(rate));
                    }
                    Err(e) => {
                        let _ = responder.send(Err(e));
                    }
                }
            }
            EngineCommand::StopTelemetry { responder } => {
                if self.telemetry.stop() {
                    log::info!("Telemetry stopped");
                }
                self.emit(EngineEvent::TelemetryStopped);
                let _ = responder.send(());
            }
            EngineCommand::Shutdown => {}
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        let forwarded = match event {
            TransportEvent::Line(line) => {
                self.handle_line(&line);
                return;
            }
            TransportEvent::Connected(descriptor) => EngineEvent::Connected(descriptor),
            TransportEvent::Disconnected { port, unexpected } => EngineEvent::Disconnected { port, unexpected },
            TransportEvent::Error(message) => EngineEvent::TransportError(message),
            TransportEvent::ReconnectAttempt { attempt, max } => EngineEvent::Reconnecting { attempt, max },
            TransportEvent::ReconnectFailed { attempt, error } => EngineEvent::ReconnectFailed { attempt, error },
            TransportEvent::ReconnectExhausted { attempts } => EngineEvent::ReconnectExhausted { attempts },
        };
        self.emit(forwarded);
    }

    fn handle_line(&mut self, line: &str) {
        self.metrics.lines_read += 1;
        match classify_line(line) {
            LineKind::Reply { tag, body } => {
                if self.pending.resolve(&tag, parse_response(&body)) {
                    self.metrics.replies_matched += 1;
                } else {
                    self.metrics.stray_replies += 1;
                    log::debug!("Dropping reply for unknown or expired {}: {}", tag, body);
                }
            }
            LineKind::Telemetry => match self.telemetry.decode(line) {
                Some(sample) => {
                    self.metrics.telemetry_frames += 1;
                    self.emit(EngineEvent::Telemetry(sample));
                }
                None => {
                    self.metrics.telemetry_dropped += 1;
                    log::debug!("Dropping telemetry frame '{}'", line);
                }
            },
            LineKind::Unrecognized => {
                self.metrics.unclassified_lines += 1;
                log::debug!("Unclassified line: {}", line);
            }
        }
    }

    fn queue_telemetry_batch(&mut self) {
        if self.telemetry_in_flight {
            log::trace!("Previous telemetry batch still queued, skipping tick");
            return;
        }
        let write = Outbound::Telemetry {
            generation: self.telemetry.generation(),
            line: self.telemetry.batch_request(),
        };
        self.telemetry_in_flight = self.outbound_tx.send(write).is_ok();
    }

    fn handle_write_done(&mut self, done: WriteDone) {
        match done {
            WriteDone::Request { result: Ok(()), .. } => self.metrics.requests_sent += 1,
            WriteDone::Request { tag, result: Err(e) } => {
                log::warn!("Failed to send {}: {}", tag, e);
                self.pending.reject(&tag, e);
            }
            WriteDone::Telemetry { generation, result } => {
                self.telemetry_in_flight = false;
                match result {
                    Ok(()) => self.telemetry.batch_sent(generation),
                    Err(e) => log::debug!("Telemetry batch not sent: {}", e),
                }
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    fn publish_metrics(&mut self) {
        self.metrics.pending = self.pending.len();
        if *self.metrics_tx.borrow() != self.metrics {
            self.metrics_tx.send_replace(self.metrics.clone());
        }
    }
}

/// Drain queued writes one at a time so lines reach the port in the order the
/// engine issued them.
async fn write_queue(
    interface: SerialInterface,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    written_tx: mpsc::UnboundedSender<WriteDone>,
) {
    while let Some(write) = outbound_rx.recv().await {
        let done = match write {
            Outbound::Request { tag, line } => {
                let result = interface.send(line.as_bytes()).await;
                WriteDone::Request { tag, result }
            }
            Outbound::Telemetry { generation, line } => {
                let result = interface.send(line.as_bytes()).await;
                WriteDone::Telemetry { generation, result }
            }
        };
        if written_tx.send(done).is_err() {
            break;
        }
    }
}
