//! Outstanding requests keyed by correlation tag.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::poll_fn;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};

use super::types::DeviceResponse;
use crate::serial::{Result, SerialError};

/// Issues `req_0`, `req_1`, ... for the lifetime of one engine.
#[derive(Debug, Default)]
pub struct TagAllocator {
    next: u64,
}

impl TagAllocator {
    pub fn next_tag(&mut self) -> String {
        let tag = format!("req_{}", self.next);
        self.next = self.next.wrapping_add(1);
        tag
    }
}

struct PendingRequest {
    command: String,
    sent_at: Instant,
    deadline: delay_queue::Key,
    responder: oneshot::Sender<Result<DeviceResponse>>,
}

/// Pending table plus the deadline queue that expires its entries.
///
/// Every completion path removes the entry before firing the responder, so a
/// request completes exactly once and anything arriving later finds nothing.
pub struct PendingTable {
    entries: HashMap<String, PendingRequest>,
    deadlines: DelayQueue<String>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self { entries: HashMap::new(), deadlines: DelayQueue::new() }
    }

    pub fn insert(
        &mut self,
        tag: String,
        command: String,
        timeout: Duration,
        responder: oneshot::Sender<Result<DeviceResponse>>,
    ) {
        let deadline = self.deadlines.insert(tag.clone(), timeout);
        let request = PendingRequest { command, sent_at: Instant::now(), deadline, responder };
        if let Some(previous) = self.entries.insert(tag, request) {
            // tags are never reused while in flight; keep the queue consistent anyway
            self.deadlines.remove(&previous.deadline);
        }
    }

    /// Complete `tag` with a reply. Returns false when nothing was waiting.
    pub fn resolve(&mut self, tag: &str, response: DeviceResponse) -> bool {
        let Some(request) = self.entries.remove(tag) else { return false };
        self.deadlines.remove(&request.deadline);
        log::trace!("{} answered after {:?}", tag, request.sent_at.elapsed());
        let _ = request.responder.send(Ok(response));
        true
    }

    /// Complete `tag` with an error. Returns false when nothing was waiting.
    pub fn reject(&mut self, tag: &str, error: SerialError) -> bool {
        let Some(request) = self.entries.remove(tag) else { return false };
        self.deadlines.remove(&request.deadline);
        let _ = request.responder.send(Err(error));
        true
    }

    /// Wait for the next deadline, fail that request with `Timeout` and return
    /// its tag and command. Never resolves while the table is empty.
    pub async fn next_expired(&mut self) -> (String, String) {
        loop {
            let expired = poll_fn(|cx| self.deadlines.poll_expired(cx)).await;
            let Some(expired) = expired else {
                return std::future::pending().await;
            };
            let tag = expired.into_inner();
            if let Some(request) = self.entries.remove(&tag) {
                let _ = request.responder.send(Err(SerialError::Timeout));
                return (tag, request.command);
            }
        }
    }

    /// Fail every outstanding request.
    pub fn drain(&mut self, reason: &str) {
        for (_, request) in self.entries.drain() {
            let _ = request.responder.send(Err(SerialError::ProtocolError(reason.to_string())));
        }
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
