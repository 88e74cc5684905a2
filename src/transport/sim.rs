//! In-process simulated controller
//!
//! Decodes every frame it is sent, applies it to a small machine model and
//! queues the response. Faults can be injected through a [`SimulatorHandle`]
//! to exercise retry and recovery paths without hardware, and the CLI uses it
//! for dry runs.

use super::{Transport, TransportError};
use crate::codec::{
    Codec, Command, CommandFrame, DeviceStatus, Exposure, ResponseFrame, ResponseStatus,
};
use crate::config::{TransportConfig, MAX_COMMAND_TIMEOUT};
use crate::units::{Power, StagePosition};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Version string reported in the handshake
pub const SIMULATOR_VERSION: &str = "NANOFAB-SIM 1.0.0";

/// Machine model of the simulated controller
#[derive(Debug, Clone, Default)]
pub struct SimulatedMachine {
    pub position: StagePosition,
    pub power: Power,
    pub armed: bool,
    /// Total time the laser has been on
    pub exposure_time: Duration,
    pub resets: u32,
}

#[derive(Debug, Default)]
struct Faults {
    refuse_connections: bool,
    fail_sends: u32,
    link_severed: bool,
    nack_next: u32,
    corrupt_next: u32,
    stale_next: u32,
    silent_opcodes: Vec<&'static str>,
    silent_after: Option<usize>,
    realtime: bool,
}

#[derive(Debug, Default)]
struct SimState {
    machine: SimulatedMachine,
    faults: Faults,
    received: Vec<CommandFrame>,
    send_attempts: usize,
    /// Encoded responses and when each becomes readable
    outbox: VecDeque<(Instant, Vec<u8>)>,
}

/// Shared view of a [`SimulatedTransport`] for inspection and fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatorHandle {
    /// Refuse the next `open`
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().faults.refuse_connections = refuse;
    }

    /// Fail the next `count` sends with a write timeout. `RESET` always gets
    /// through so a faulted session can always be recovered.
    pub fn fail_sends(&self, count: u32) {
        self.state.lock().faults.fail_sends = count;
    }

    /// Fail every later send as if the controller dropped the connection
    pub fn sever_link(&self) {
        self.state.lock().faults.link_severed = true;
    }

    /// Answer the next `count` commands with a fault return code. `RESET` is
    /// never refused so a faulted session can always be recovered.
    pub fn nack_next(&self, count: u32) {
        self.state.lock().faults.nack_next = count;
    }

    /// Flip the checksum of the next `count` responses
    pub fn corrupt_next(&self, count: u32) {
        self.state.lock().faults.corrupt_next = count;
    }

    /// Precede the next `count` responses with a reply to an older command
    pub fn stale_next(&self, count: u32) {
        self.state.lock().faults.stale_next = count;
    }

    /// Never answer commands with this opcode
    pub fn silence_opcode(&self, opcode: &'static str) {
        self.state.lock().faults.silent_opcodes.push(opcode);
    }

    /// Stop answering anything once `count` commands have been received
    pub fn go_silent_after(&self, count: usize) {
        self.state.lock().faults.silent_after = Some(count);
    }

    /// Hold each acknowledgement until the command's motion, exposure or
    /// settle time has passed, like a real controller
    pub fn realtime(&self, enabled: bool) {
        self.state.lock().faults.realtime = enabled;
    }

    /// Every command the controller decoded, in arrival order
    pub fn received(&self) -> Vec<CommandFrame> {
        self.state.lock().received.clone()
    }

    /// Decoded commands without the correlation ids
    pub fn received_commands(&self) -> Vec<Command> {
        self.state.lock().received.iter().map(|frame| frame.command).collect()
    }

    /// Number of send calls, failed ones included
    pub fn send_attempts(&self) -> usize {
        self.state.lock().send_attempts
    }

    pub fn machine(&self) -> SimulatedMachine {
        self.state.lock().machine.clone()
    }
}

pub struct SimulatedTransport {
    codec: Codec,
    handle: SimulatorHandle,
    open: bool,
}

impl SimulatedTransport {
    pub fn new() -> Result<Self, regex::Error> {
        Self::with_handle(SimulatorHandle::default())
    }

    /// Simulator sharing the device model behind `handle`, e.g. to reconnect
    /// to the same controller
    pub fn with_handle(handle: SimulatorHandle) -> Result<Self, regex::Error> {
        Ok(Self {
            codec: Codec::new()?,
            handle,
            open: false,
        })
    }

    pub fn handle(&self) -> SimulatorHandle {
        self.handle.clone()
    }
}

/// Apply one decoded command to the machine model
fn apply(machine: &mut SimulatedMachine, frame: &CommandFrame) -> ResponseFrame {
    let id = frame.id;
    match frame.command {
        Command::Hello => ResponseFrame::ack(id, SIMULATOR_VERSION),
        Command::Reset => {
            machine.resets += 1;
            ResponseFrame::ack(id, "")
        }
        Command::Status => {
            let status = DeviceStatus {
                position: machine.position,
                power: machine.power,
                armed: machine.armed,
            };
            ResponseFrame::ack(id, status.to_data())
        }
        Command::Arm => {
            machine.armed = true;
            ResponseFrame::ack(id, "")
        }
        Command::Disarm => {
            machine.armed = false;
            ResponseFrame::ack(id, "")
        }
        Command::MoveTo { target, .. } => {
            machine.position = target;
            ResponseFrame::ack(id, "")
        }
        Command::SetPower { power } => {
            machine.power = power;
            ResponseFrame::ack(id, "")
        }
        Command::Expose { exposure } => {
            if !machine.armed {
                return ResponseFrame::nack(id, ResponseStatus::Fault, "laser interlock not armed");
            }
            let from = machine.position;
            machine.exposure_time += frame.command.expected_duration(&from);
            if let Exposure::Path { target, .. } = exposure {
                machine.position = target;
            }
            ResponseFrame::ack(id, "")
        }
        Command::WaitSettle { .. } => ResponseFrame::ack(id, ""),
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn open(&mut self, _config: &TransportConfig) -> Result<(), TransportError> {
        let mut state = self.handle.state.lock();
        if state.faults.refuse_connections {
            return Err(TransportError::Connection("simulated controller refused connection".to_string()));
        }
        state.outbox.clear();
        self.open = true;
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let mut state = self.handle.state.lock();
        state.send_attempts += 1;

        if state.faults.link_severed {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated controller closed the connection",
            )));
        }

        let decoded = match self.codec.decode_command(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Simulator rejected frame: {}", e);
                let reply = ResponseFrame::nack(0, ResponseStatus::Invalid, e.to_string());
                let bytes = self.codec.encode_response(&reply);
                state.outbox.push_back((Instant::now(), bytes));
                return Ok(());
            }
        };
        if state.faults.fail_sends > 0 && decoded.command != Command::Reset {
            state.faults.fail_sends -= 1;
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "simulated write timeout",
            )));
        }
        state.received.push(decoded);

        let silenced = state.faults.silent_opcodes.contains(&decoded.command.opcode())
            || state
                .faults
                .silent_after
                .map_or(false, |limit| state.received.len() > limit);
        if silenced {
            return Ok(());
        }

        let ready_at = if state.faults.realtime {
            let busy = decoded.command.expected_duration(&state.machine.position);
            Instant::now() + busy.min(MAX_COMMAND_TIMEOUT)
        } else {
            Instant::now()
        };

        let response = if state.faults.nack_next > 0 && decoded.command != Command::Reset {
            state.faults.nack_next -= 1;
            ResponseFrame::nack(decoded.id, ResponseStatus::Fault, "injected fault")
        } else {
            apply(&mut state.machine, &decoded)
        };

        if state.faults.stale_next > 0 {
            state.faults.stale_next -= 1;
            let stale = ResponseFrame::ack(decoded.id.wrapping_sub(1), "");
            let bytes = self.codec.encode_response(&stale);
            state.outbox.push_back((Instant::now(), bytes));
        }

        let mut bytes = self.codec.encode_response(&response);
        if state.faults.corrupt_next > 0 {
            state.faults.corrupt_next -= 1;
            // Last checksum digit sits right before the terminator
            let index = bytes.len() - 2;
            bytes[index] = if bytes[index] == b'0' { b'1' } else { b'0' };
        }
        state.outbox.push_back((ready_at, bytes));
        Ok(())
    }

    async fn receive(&mut self, max_wait: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let deadline = Instant::now() + max_wait;
        let ready_at = self.handle.state.lock().outbox.front().map(|(at, _)| *at);
        match ready_at {
            Some(at) if at <= deadline => {
                tokio::time::sleep_until(at).await;
                let next = self.handle.state.lock().outbox.pop_front();
                next.map(|(_, frame)| frame).ok_or(TransportError::Timeout(max_wait))
            }
            _ => {
                tokio::time::sleep_until(deadline).await;
                Err(TransportError::Timeout(max_wait))
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}
