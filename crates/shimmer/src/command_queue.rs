//! Instruction queue and the request / ACK / response state machine.
//!
//! Exactly one command is in flight at a time. The queue only tracks the
//! protocol exchange; what a completed or timed-out command means for the
//! session is decided by the worker.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::protocol::{parse_response, Expectation, PendingCommand, Response, ACK};
use crate::types::HardwareGeneration;

/// Single-shot deadline, re-armed for every exchange step.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseTimer {
    deadline: Option<Instant>,
}

impl ResponseTimer {
    pub fn arm(&mut self, now: Instant, timeout: Duration) {
        self.deadline = Some(now + timeout);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |d| now >= d)
    }

    /// Time left, if armed.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingAck,
    AwaitingResponse(u8),
}

/// A command that finished its exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub command: PendingCommand,
    pub response: Option<Response>,
}

#[derive(Debug)]
pub struct InstructionQueue {
    queue: VecDeque<PendingCommand>,
    in_flight: Option<PendingCommand>,
    phase: Phase,
    timer: ResponseTimer,
    response_buf: Vec<u8>,
    response_timeout: Duration,
}

impl InstructionQueue {
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: None,
            phase: Phase::Idle,
            timer: ResponseTimer::default(),
            response_buf: Vec::new(),
            response_timeout,
        }
    }

    pub fn enqueue(&mut self, command: PendingCommand) {
        trace!("Queued opcode 0x{:02X}", command.opcode());
        self.queue.push_back(command);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn in_flight(&self) -> Option<&PendingCommand> {
        self.in_flight.as_ref()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Nothing in flight and nothing queued.
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    pub fn awaiting_ack(&self) -> bool {
        self.phase == Phase::AwaitingAck
    }

    pub fn timer(&self) -> &ResponseTimer {
        &self.timer
    }

    /// Start the next command if none is in flight. Returns the bytes to
    /// write.
    pub fn dispatch_next(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.in_flight.is_some() {
            return None;
        }
        let command = self.queue.pop_front()?;
        debug!(
            "Sending {:?} (opcode 0x{:02X}, timeout {:?})",
            command.kind,
            command.opcode(),
            command.timeout
        );
        self.timer.arm(now, command.timeout);
        self.phase = Phase::AwaitingAck;
        self.response_buf.clear();
        let bytes = command.bytes.clone();
        self.in_flight = Some(command);
        Some(bytes)
    }

    /// Remove the next queued command without sending it, if nothing is in
    /// flight and `reject` holds for it.
    pub fn take_next_if(&mut self, reject: impl Fn(&PendingCommand) -> bool) -> Option<PendingCommand> {
        if self.in_flight.is_some() || !reject(self.queue.front()?) {
            return None;
        }
        self.queue.pop_front()
    }

    /// Handle an ACK. Completes ACK-only commands; moves the others on to
    /// waiting for their response.
    pub fn on_ack(&mut self, now: Instant) -> Option<Completion> {
        if self.phase != Phase::AwaitingAck {
            trace!("Ignoring unexpected ACK");
            return None;
        }
        let expects = self.in_flight.as_ref()?.expects;
        match expects {
            Expectation::AckOnly => self.complete(None),
            Expectation::AckThenResponse(type_byte) => {
                self.phase = Phase::AwaitingResponse(type_byte);
                self.timer.arm(now, self.response_timeout);
                None
            }
        }
    }

    /// Feed one byte received while not streaming.
    pub fn on_byte(&mut self, byte: u8, generation: HardwareGeneration, now: Instant) -> Option<Completion> {
        match self.phase {
            Phase::Idle => {
                trace!("Discarding stray byte 0x{:02X}", byte);
                None
            }
            Phase::AwaitingAck => {
                if byte == ACK {
                    self.on_ack(now)
                } else {
                    trace!("Discarding 0x{:02X} while waiting for ACK", byte);
                    None
                }
            }
            Phase::AwaitingResponse(type_byte) => {
                if self.response_buf.is_empty() && byte != type_byte {
                    trace!(
                        "Discarding 0x{:02X} while waiting for response 0x{:02X}",
                        byte,
                        type_byte
                    );
                    return None;
                }
                self.response_buf.push(byte);
                match parse_response(generation, &self.response_buf) {
                    Ok(None) => None,
                    Ok(Some((response, used))) => {
                        if used < self.response_buf.len() {
                            trace!("{} trailing bytes after response", self.response_buf.len() - used);
                        }
                        self.complete(Some(response))
                    }
                    Err(e) => {
                        warn!("Dropping malformed response: {}", e);
                        self.response_buf.clear();
                        None
                    }
                }
            }
        }
    }

    fn complete(&mut self, response: Option<Response>) -> Option<Completion> {
        self.timer.disarm();
        self.phase = Phase::Idle;
        self.response_buf.clear();
        let command = self.in_flight.take()?;
        trace!("Completed opcode 0x{:02X}", command.opcode());
        Some(Completion { command, response })
    }

    /// If the in-flight command ran out of time, abandon and return it.
    pub fn check_timeout(&mut self, now: Instant) -> Option<PendingCommand> {
        if !self.timer.expired(now) {
            return None;
        }
        self.timer.disarm();
        self.phase = Phase::Idle;
        self.response_buf.clear();
        self.in_flight.take()
    }

    /// Drop the in-flight command and everything queued.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len() + usize::from(self.in_flight.is_some());
        self.queue.clear();
        self.in_flight = None;
        self.phase = Phase::Idle;
        self.timer.disarm();
        self.response_buf.clear();
        dropped
    }
}
