//! Client-side tracking of calls awaiting a reply.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::{RelayError, Result};
use crate::frame::{Frame, UNTRACKED_ID};
use crate::message::{MessageType, Method};

/// Where the reply to a call is delivered.
pub type ReplySender = oneshot::Sender<Result<Frame>>;

// ── PendingCall ──────────────────────────────────────────────────

#[derive(Debug)]
pub struct PendingCall {
    pub method: Method,
    pub sent_at: Instant,
    /// After this the caller has given up; the entry is swept.
    pub deadline: Instant,
    reply: ReplySender,
}

impl PendingCall {
    /// How long this call has been in flight.
    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }
}

// ── PendingCalls ─────────────────────────────────────────────────

/// Outstanding calls keyed by request id.
#[derive(Debug)]
pub struct PendingCalls {
    next_id: u64,
    calls: HashMap<u64, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            next_id: UNTRACKED_ID + 1,
            calls: HashMap::new(),
        }
    }

    /// Allocate an id and register the call under it, to be swept once
    /// `timeout` has passed.
    pub fn track(&mut self, method: Method, timeout: Duration) -> (u64, oneshot::Receiver<Result<Frame>>) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == UNTRACKED_ID {
            self.next_id += 1;
        }

        let (reply, rx) = oneshot::channel();
        let sent_at = Instant::now();
        self.calls.insert(
            id,
            PendingCall {
                method,
                sent_at,
                deadline: sent_at + timeout,
                reply,
            },
        );
        (id, rx)
    }

    /// Deliver a response or fault frame to its caller.
    ///
    /// Returns `false` when no call waits on the frame's id, e.g. because
    /// it already timed out.
    pub fn resolve(&mut self, frame: Frame) -> bool {
        let Some(call) = self.calls.remove(&frame.request_id()) else {
            return false;
        };

        let result = match frame.message_type() {
            MessageType::Response if frame.method() == call.method => Ok(frame),
            MessageType::Fault => Err(RelayError::Remote {
                method: frame.method().to_string(),
                message: String::from_utf8_lossy(frame.payload()).into_owned(),
            }),
            other => Err(RelayError::UnexpectedReply(format!(
                "{other} {} for a {} call",
                frame.method(),
                call.method
            ))),
        };
        // the caller may have given up already
        let _ = call.reply.send(result);
        true
    }

    /// Forget a call whose caller stopped waiting.
    pub fn cancel(&mut self, request_id: u64) -> Option<PendingCall> {
        self.calls.remove(&request_id)
    }

    /// Drop every call whose deadline is before `now`, failing it with a
    /// timeout in case its caller is still waiting. Covers callers that
    /// stopped waiting without cancelling, e.g. a dropped future.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .calls
            .iter()
            .filter(|(_, call)| call.deadline < now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(call) = self.calls.remove(id) {
                tracing::debug!(method = %call.method, request_id = id, "pending call expired");
                let _ = call.reply.send(Err(RelayError::Timeout(call.deadline - call.sent_at)));
            }
        }
        expired.len()
    }

    /// Fail every outstanding call, e.g. when the session drops.
    pub fn fail_all(&mut self, error: impl Fn() -> RelayError) -> usize {
        let count = self.calls.len();
        for (_, call) in self.calls.drain() {
            let _ = call.reply.send(Err(error()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.calls.len()
    }

    pub fn is_pending(&self, request_id: u64) -> bool {
        self.calls.contains_key(&request_id)
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────
