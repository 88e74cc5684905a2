//! Device Session for the nanofactory controller
//!
//! Owns the transport, runs the handshake, and enforces the
//! one-command-in-flight discipline: a command is submitted, then exactly one
//! terminal outcome (ack, nack or timeout) is collected before the next one
//! may go out. The session is also the only writer of the mirrored machine
//! state and the single place where failures are classified as transient or
//! fatal.

use crate::codec::{
    Codec, CodecError, Command, CommandFrame, CorrelationId, DeviceStatus, Exposure, ResponseFrame,
    ResponseStatus,
};
use crate::config::{Config, SessionConfig, TransportConfig};
use crate::transport::{TransportAdapter, TransportError};
use crate::units::{Power, StagePosition};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Idle,
    Executing,
    Faulted,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Idle => "idle",
            SessionState::Executing => "executing",
            SessionState::Faulted => "faulted",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Send failed: {0}")]
    Send(#[source] TransportError),

    #[error("No response to {opcode} within {after:?}")]
    Timeout { opcode: &'static str, after: Duration },

    #[error("{opcode} rejected by controller ({status:?}): {reason}")]
    Nack {
        opcode: &'static str,
        status: ResponseStatus,
        reason: String,
    },

    #[error(transparent)]
    Malformed(#[from] CodecError),

    #[error("Transport failure: {0}")]
    Transport(#[source] TransportError),

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Recovery failed, session closed: {0}")]
    RecoveryFailed(String),
}

impl SessionError {
    /// Whether retrying the same command can succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::Send(_) | SessionError::Timeout { .. } | SessionError::Nack { .. }
        )
    }
}

/// Machine state as last confirmed by the controller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachineState {
    /// Unknown until a move is acknowledged or a status query answers
    pub position: Option<StagePosition>,
    pub power: Option<Power>,
    pub armed: bool,
    pub firmware_version: Option<String>,
}

/// How one command exchange ended
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOutcome {
    Pending,
    Ack(String),
    Nack { status: ResponseStatus, reason: String },
    Timeout,
    Malformed(String),
    SendFailed(String),
    TransportFailed(String),
}

/// Command history entry
#[derive(Debug, Clone)]
pub struct Exchange {
    pub id: CorrelationId,
    pub command: Command,
    pub outcome: ExchangeOutcome,
    pub sent_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub round_trip: Option<Duration>,
}

struct Outstanding {
    frame: CommandFrame,
    started: Instant,
}

pub struct Session {
    id: Uuid,
    transport: TransportAdapter,
    transport_config: TransportConfig,
    config: SessionConfig,
    codec: Codec,
    state: SessionState,
    machine: MachineState,
    next_id: CorrelationId,
    outstanding: Option<Outstanding>,
    history: VecDeque<Exchange>,
}

impl Session {
    /// Create a session over `transport`; nothing is opened until [`Session::connect`]
    pub fn new(transport: TransportAdapter, config: &Config) -> crate::Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            transport,
            transport_config: config.transport.clone(),
            config: config.session.clone(),
            codec: Codec::new()?,
            state: SessionState::Disconnected,
            machine: MachineState::default(),
            next_id: 1,
            outstanding: None,
            history: VecDeque::new(),
        })
    }

    /// Create a session over the transport selected in the configuration
    pub fn from_config(config: &Config) -> crate::Result<Self> {
        Self::new(TransportAdapter::from_config(&config.transport)?, config)
    }

    /// Open the transport and perform the `HELLO` handshake
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Disconnected, "connect")?;
        info!("Connecting session {} via {}", self.id, self.transport_config.describe());
        self.transition(SessionState::Connecting);

        if let Err(e) = self.transport.open(&self.transport_config).await {
            error!("Failed to open transport: {}", e);
            self.transition(SessionState::Disconnected);
            return Err(SessionError::Connection(e.to_string()));
        }

        let handshake = self.config.handshake_timeout();
        let result = match self.send_frame(Command::Hello).await {
            Ok(()) => self.receive_reply(handshake).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(reply) if reply.is_ack() => {
                info!("Controller firmware: {}", reply.data);
                self.machine.firmware_version = Some(reply.data);
                self.transition(SessionState::Idle);
                Ok(())
            }
            Ok(reply) => {
                self.transition(SessionState::Faulted);
                Err(SessionError::Connection(format!("handshake rejected: {}", reply.data)))
            }
            Err(e) => {
                error!("Handshake failed: {}", e);
                self.transition(SessionState::Faulted);
                Err(SessionError::Connection(format!("handshake failed: {}", e)))
            }
        }
    }

    /// Transmit one command. The session is `Executing` until
    /// [`Session::await_response`] collects its outcome.
    pub async fn submit(&mut self, command: Command) -> Result<CorrelationId, SessionError> {
        self.require(SessionState::Idle, "submit a command")?;
        self.transition(SessionState::Executing);
        match self.send_frame(command).await {
            Ok(()) => Ok(self.outstanding.as_ref().map_or(0, |o| o.frame.id)),
            Err(e) => {
                match &e {
                    SessionError::Send(cause) if cause.is_untransmitted() => {
                        self.transition(SessionState::Idle)
                    }
                    SessionError::InvalidState { .. } => self.transition(SessionState::Idle),
                    // Part of the frame may be on the wire
                    _ => self.transition(SessionState::Faulted),
                }
                Err(e)
            }
        }
    }

    /// Wait up to `timeout` for the outcome of the submitted command
    pub async fn await_response(&mut self, timeout: Duration) -> Result<ResponseFrame, SessionError> {
        self.require(SessionState::Executing, "await a response")?;
        let opcode = self
            .outstanding
            .as_ref()
            .map_or("?", |o| o.frame.command.opcode());

        let reply = match self.receive_reply(timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("{} failed: {}", opcode, e);
                self.transition(SessionState::Faulted);
                return Err(e);
            }
        };

        if !reply.is_ack() {
            warn!("{} rejected: {}", opcode, reply.data);
            self.transition(SessionState::Faulted);
            return Err(SessionError::Nack {
                opcode,
                status: reply.status,
                reason: reply.data,
            });
        }

        self.transition(SessionState::Idle);
        Ok(reply)
    }

    /// Submit `command` and wait for its acknowledgement
    pub async fn execute(&mut self, command: Command, timeout: Duration) -> Result<ResponseFrame, SessionError> {
        self.submit(command).await?;
        self.await_response(timeout).await
    }

    /// Timeout for `command`: the base acknowledgement timeout plus the time
    /// the controller is expected to be busy with it. Motion is measured from
    /// `from`, or from the mirrored position when the caller has none.
    pub fn command_timeout(&self, command: &Command, from: Option<StagePosition>) -> Duration {
        let from = from.or(self.machine.position).unwrap_or_default();
        self.config.command_timeout(command.expected_duration(&from))
    }

    /// Refresh the mirrored machine state from the controller
    pub async fn query_status(&mut self) -> Result<DeviceStatus, SessionError> {
        let reply = self.execute(Command::Status, self.config.ack_timeout()).await?;
        // Mirror was updated from the same data when the ack arrived
        Ok(DeviceStatus::parse(&reply.data)?)
    }

    /// Clear a fault with `RESET`. If the controller does not acknowledge the
    /// reset the session is closed.
    pub async fn recover(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Faulted, "recover")?;
        info!("Recovering session {}", self.id);

        let result = match self.send_frame(Command::Reset).await {
            Ok(()) => self.receive_reply(self.config.ack_timeout()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(reply) if reply.is_ack() => {
                // Motion may have been interrupted anywhere
                self.machine.position = None;
                self.transition(SessionState::Idle);
                info!("Session recovered");
                Ok(())
            }
            Ok(reply) => self.fail_recovery(format!("reset rejected: {}", reply.data)).await,
            Err(e) => self.fail_recovery(e.to_string()).await,
        }
    }

    /// Release the transport. The session cannot be used afterwards.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if let Some(outstanding) = self.outstanding.take() {
            warn!(
                "Closing with {} still outstanding",
                outstanding.frame.command.opcode()
            );
            self.finish(outstanding.frame.id, ExchangeOutcome::Timeout);
        }
        self.transition(SessionState::Closed);
        self.transport.close().await.map_err(SessionError::Transport)?;
        info!("Session {} closed", self.id);
        Ok(())
    }

    /// Get the session identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if the session accepts a new command
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Idle
    }

    /// Get the machine state mirrored from acknowledgements
    pub fn machine(&self) -> &MachineState {
        &self.machine
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Recent command exchanges, oldest first
    pub fn history(&self) -> impl Iterator<Item = &Exchange> {
        self.history.iter()
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    fn require(&self, expected: SessionState, operation: &'static str) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("Session state {} -> {}", self.state, next);
            self.state = next;
        }
    }

    async fn fail_recovery(&mut self, reason: String) -> Result<(), SessionError> {
        error!("Recovery failed: {}", reason);
        self.transition(SessionState::Closed);
        if let Err(e) = self.transport.close().await {
            warn!("Failed to close transport after failed recovery: {}", e);
        }
        Err(SessionError::RecoveryFailed(reason))
    }

    fn allocate_id(&mut self) -> CorrelationId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    async fn send_frame(&mut self, command: Command) -> Result<(), SessionError> {
        if self.outstanding.is_some() {
            return Err(SessionError::InvalidState {
                operation: "send while a command is outstanding",
                state: self.state,
            });
        }

        let frame = CommandFrame {
            id: self.allocate_id(),
            command,
        };
        let bytes = self.codec.encode_command(&frame);
        self.record(frame);

        match self.transport.send(&bytes).await {
            Ok(()) => {
                self.outstanding = Some(Outstanding {
                    frame,
                    started: Instant::now(),
                });
                Ok(())
            }
            Err(e) => {
                self.finish(frame.id, ExchangeOutcome::SendFailed(e.to_string()));
                if e.is_link_lost() {
                    Err(SessionError::Transport(e))
                } else {
                    Err(SessionError::Send(e))
                }
            }
        }
    }

    /// Collect the terminal outcome of the outstanding frame. Replies carrying
    /// another correlation id answer commands that already timed out and are
    /// dropped.
    async fn receive_reply(&mut self, timeout: Duration) -> Result<ResponseFrame, SessionError> {
        let Some(outstanding) = self.outstanding.take() else {
            return Err(SessionError::InvalidState {
                operation: "receive without an outstanding command",
                state: self.state,
            });
        };
        let id = outstanding.frame.id;
        let command = outstanding.frame.command;
        let deadline = outstanding.started + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.finish(id, ExchangeOutcome::Timeout);
                return Err(SessionError::Timeout {
                    opcode: command.opcode(),
                    after: timeout,
                });
            }

            let bytes = match self.transport.receive(remaining).await {
                Ok(bytes) => bytes,
                Err(TransportError::Timeout(_)) => continue,
                Err(e) => {
                    self.finish(id, ExchangeOutcome::TransportFailed(e.to_string()));
                    return Err(SessionError::Transport(e));
                }
            };

            let reply = match self.codec.decode_response(&bytes) {
                Ok(reply) => reply,
                Err(e) => {
                    self.finish(id, ExchangeOutcome::Malformed(e.to_string()));
                    return Err(SessionError::Malformed(e));
                }
            };

            if reply.id != id {
                warn!("Discarding stale response {:04X} while waiting for {:04X}", reply.id, id);
                continue;
            }

            if reply.is_ack() {
                if let Err(e) = self.mirror(&command, &reply.data) {
                    self.finish(id, ExchangeOutcome::Malformed(e.to_string()));
                    return Err(SessionError::Malformed(e));
                }
                self.finish(id, ExchangeOutcome::Ack(reply.data.clone()));
            } else {
                self.finish(
                    id,
                    ExchangeOutcome::Nack {
                        status: reply.status,
                        reason: reply.data.clone(),
                    },
                );
            }
            return Ok(reply);
        }
    }

    /// Apply an acknowledged command to the mirrored machine state
    fn mirror(&mut self, command: &Command, data: &str) -> Result<(), CodecError> {
        match command {
            Command::MoveTo { target, .. }
            | Command::Expose { exposure: Exposure::Path { target, .. } } => {
                self.machine.position = Some(*target);
            }
            Command::SetPower { power } => self.machine.power = Some(*power),
            Command::Arm => self.machine.armed = true,
            Command::Disarm => self.machine.armed = false,
            Command::Status => {
                let status = DeviceStatus::parse(data)?;
                self.machine.position = Some(status.position);
                self.machine.power = Some(status.power);
                self.machine.armed = status.armed;
            }
            _ => {}
        }
        Ok(())
    }

    fn record(&mut self, frame: CommandFrame) {
        if self.history.len() >= self.config.history_limit() {
            self.history.pop_front();
        }
        self.history.push_back(Exchange {
            id: frame.id,
            command: frame.command,
            outcome: ExchangeOutcome::Pending,
            sent_at: Utc::now(),
            completed_at: None,
            round_trip: None,
        });
    }

    fn finish(&mut self, id: CorrelationId, outcome: ExchangeOutcome) {
        if let Some(exchange) = self.history.iter_mut().rev().find(|e| e.id == id) {
            let now = Utc::now();
            exchange.round_trip = (now - exchange.sent_at).to_std().ok();
            exchange.completed_at = Some(now);
            exchange.outcome = outcome;
        }
    }
}
