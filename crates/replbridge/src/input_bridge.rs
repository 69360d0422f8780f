//! Worker side of the synchronous input rendezvous.
//!
//! The interpreter asks for input synchronously and cannot suspend, while the
//! answer comes from an asynchronous user action on the other side of a
//! message-only boundary. The bridge closes that gap:
//!
//! 1. post an `input` event carrying the prompt and a fresh request id;
//! 2. block on bounded reads of the shared buffer until a line stamped with
//!    that request id appears (the controller clears the buffer when it
//!    receives the request, then writes the user's line);
//! 3. return the line to the interpreter.
//!
//! A line stamped with any other request id answers a prompt that has
//! already ended, typically one that timed out. It is skipped, so a late
//! answer never satisfies a later `input()` call.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    error::HostIoError,
    protocol::WorkerEvent,
    shared_buffer::{BufferContent, SharedBuffer},
    worker::EventSink,
};

/// Blocking reader over the shared buffer, one per booted interpreter.
#[derive(Debug)]
pub struct InputBridge {
    buffer: Arc<dyn SharedBuffer>,
    /// Id the next input request will carry.
    next_request: u64,
    /// Sequence of the last line read, answered or skipped.
    last_sequence: Option<u64>,
    /// Bound on one rendezvous, if any.
    timeout: Option<Duration>,
    /// Length of one bounded read; cancellation is checked between reads.
    slice: Duration,
}

impl InputBridge {
    #[must_use]
    pub fn new(buffer: Arc<dyn SharedBuffer>, timeout: Option<Duration>, slice: Duration) -> Self {
        Self {
            buffer,
            next_request: 0,
            last_sequence: None,
            timeout,
            slice: slice.max(Duration::from_millis(1)),
        }
    }

    /// Sequence of the most recently read line, including skipped ones.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Notifies the controller that a line is needed, then blocks until one
    /// arrives.
    pub fn request_line(&mut self, prompt: Option<&str>, sink: &dyn EventSink) -> Result<String, HostIoError> {
        let request = self.next_request;
        self.next_request += 1;
        let event = WorkerEvent::Input {
            request,
            text: prompt.filter(|text| !text.is_empty()).map(str::to_owned),
        };
        if sink.post(event).is_err() {
            return Err(if sink.is_terminated() {
                HostIoError::Terminated
            } else {
                HostIoError::Disconnected
            });
        }
        self.await_line(request, || sink.is_terminated())
    }

    /// Blocks until a line answering `request` is written.
    ///
    /// `terminated` is checked between bounded reads so a worker that has
    /// been cancelled stops waiting within one slice.
    pub fn await_line(&mut self, request: u64, terminated: impl Fn() -> bool) -> Result<String, HostIoError> {
        let started = Instant::now();
        loop {
            if terminated() {
                return Err(HostIoError::Terminated);
            }
            let wait = match self.timeout {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        return Err(HostIoError::InputTimeout(limit));
                    }
                    self.slice.min(limit - elapsed)
                }
                None => self.slice,
            };
            match self.buffer.read_newer(self.last_sequence, wait)? {
                Some(BufferContent::Line {
                    request: answered,
                    sequence,
                    text,
                }) => {
                    self.last_sequence = Some(sequence);
                    if answered == request {
                        tracing::debug!(request, sequence, "input rendezvous completed");
                        return Ok(text);
                    }
                    tracing::debug!(request, answered, sequence, "skipping answer to an earlier request");
                }
                Some(BufferContent::Closed) => return Err(HostIoError::BufferClosed),
                Some(BufferContent::Empty) | None => {}
            }
        }
    }
}
