//! Command Codec for the nanofactory controller wire protocol
//!
//! Frames are single ASCII lines. Commands start with `>`, responses start
//! with one of the controller return-code characters (`%` success, `!`
//! invalid, `#` fault). Every frame carries a 16 bit correlation id in hex and
//! ends with an XOR checksum over the bytes between the start character and
//! the `*` separator:
//!
//! ```text
//! >002A MOVE 1200 -50 300 5000*5C
//! %002A*17
//! ```
//!
//! All numeric fields are scaled integers in device units (see [`crate::units`]).

use crate::units::{duration_to_micros, Decimicron, FeedRate, Power, StagePosition};
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Longest frame the controller accepts, terminator included
pub const MAX_FRAME_LEN: usize = 256;

/// Frame terminator
pub const FRAME_TERMINATOR: u8 = b'\n';

const COMMAND_START: char = '>';

/// Correlation identifier matching a response to its command
pub type CorrelationId = u16;

/// Decoding failures. Every variant is a malformed frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed frame: checksum mismatch (expected {expected:02X}, found {found:02X})")]
    ChecksumMismatch { expected: u8, found: u8 },

    #[error("Malformed frame: length mismatch ({0})")]
    LengthMismatch(String),

    #[error("Malformed frame: {0}")]
    Syntax(String),
}

/// How an exposure is bounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exposure {
    /// Expose in place for a fixed time
    Timed { duration: Duration },
    /// Expose while moving the stage in a straight line to `target`
    Path { target: StagePosition, feed: FeedRate },
}

/// Primitive controller commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Handshake, acknowledged with the firmware version
    Hello,
    /// Acknowledge and clear all controller faults
    Reset,
    /// Query position, power and interlock state
    Status,
    /// Enable the laser interlock
    Arm,
    /// Disable the laser interlock
    Disarm,
    MoveTo { target: StagePosition, feed: FeedRate },
    SetPower { power: Power },
    Expose { exposure: Exposure },
    WaitSettle { duration: Duration },
}

impl Command {
    /// Wire mnemonic
    pub fn opcode(&self) -> &'static str {
        match self {
            Command::Hello => "HELLO",
            Command::Reset => "RESET",
            Command::Status => "STATUS",
            Command::Arm => "ARM",
            Command::Disarm => "DISARM",
            Command::MoveTo { .. } => "MOVE",
            Command::SetPower { .. } => "POWER",
            Command::Expose { .. } => "EXPOSE",
            Command::WaitSettle { .. } => "SETTLE",
        }
    }

    /// How long the controller needs before it can acknowledge this command,
    /// given the stage starts at `from`
    pub fn expected_duration(&self, from: &StagePosition) -> Duration {
        match self {
            Command::MoveTo { target, feed } => feed.travel_time(from.distance_microns(target)),
            Command::Expose { exposure: Exposure::Timed { duration } } => *duration,
            Command::Expose { exposure: Exposure::Path { target, feed } } => {
                feed.travel_time(from.distance_microns(target))
            }
            Command::WaitSettle { duration } => *duration,
            _ => Duration::ZERO,
        }
    }

    /// Whether this command moves the stage
    pub fn target(&self) -> Option<StagePosition> {
        match self {
            Command::MoveTo { target, .. } => Some(*target),
            Command::Expose { exposure: Exposure::Path { target, .. } } => Some(*target),
            _ => None,
        }
    }

    fn body(&self) -> String {
        let opcode = self.opcode();
        match self {
            Command::MoveTo { target, feed } => format!(
                "{} {} {} {} {}",
                opcode, target.x.0, target.y.0, target.z.0, feed.0
            ),
            Command::SetPower { power } => format!("{} {}", opcode, power.0),
            Command::Expose { exposure: Exposure::Timed { duration } } => {
                format!("{} T {}", opcode, duration_to_micros(*duration))
            }
            Command::Expose { exposure: Exposure::Path { target, feed } } => format!(
                "{} L {} {} {} {}",
                opcode, target.x.0, target.y.0, target.z.0, feed.0
            ),
            Command::WaitSettle { duration } => {
                format!("{} {}", opcode, duration_to_micros(*duration))
            }
            _ => opcode.to_string(),
        }
    }
}

/// One command on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub id: CorrelationId,
    pub command: Command,
}

/// Controller return code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Command accepted and completed
    Ack,
    /// Command rejected as invalid
    Invalid,
    /// Command failed during execution
    Fault,
}

impl ResponseStatus {
    pub fn as_char(self) -> char {
        match self {
            ResponseStatus::Ack => '%',
            ResponseStatus::Invalid => '!',
            ResponseStatus::Fault => '#',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            '%' => Some(ResponseStatus::Ack),
            '!' => Some(ResponseStatus::Invalid),
            '#' => Some(ResponseStatus::Fault),
            _ => None,
        }
    }
}

/// One response on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub id: CorrelationId,
    pub status: ResponseStatus,
    pub data: String,
}

impl ResponseFrame {
    pub fn ack(id: CorrelationId, data: impl Into<String>) -> Self {
        Self { id, status: ResponseStatus::Ack, data: data.into() }
    }

    pub fn nack(id: CorrelationId, status: ResponseStatus, reason: impl Into<String>) -> Self {
        Self { id, status, data: reason.into() }
    }

    pub fn is_ack(&self) -> bool {
        self.status == ResponseStatus::Ack
    }
}

/// Payload of a `STATUS` acknowledgement: `x y z power armed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub position: StagePosition,
    pub power: Power,
    pub armed: bool,
}

impl DeviceStatus {
    pub fn to_data(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.position.x.0,
            self.position.y.0,
            self.position.z.0,
            self.power.0,
            u8::from(self.armed)
        )
    }

    pub fn parse(data: &str) -> Result<Self, CodecError> {
        let fields: Vec<&str> = data.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CodecError::LengthMismatch(format!(
                "status data has {} fields, expected 5",
                fields.len()
            )));
        }
        let armed = match fields[4] {
            "0" => false,
            "1" => true,
            other => return Err(CodecError::Syntax(format!("invalid armed flag '{}'", other))),
        };
        Ok(Self {
            position: StagePosition {
                x: Decimicron(parse_field(fields[0], "x")?),
                y: Decimicron(parse_field(fields[1], "y")?),
                z: Decimicron(parse_field(fields[2], "z")?),
            },
            power: parse_power(fields[3])?,
            armed,
        })
    }
}

/// XOR checksum over `bytes`
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Encoder/decoder for controller frames
#[derive(Debug, Clone)]
pub struct Codec {
    frame_pattern: Regex,
}

impl Codec {
    pub fn new() -> Result<Self, regex::Error> {
        let frame_pattern = Regex::new(r"^([>%!#])(([0-9A-F]{4})(?: ([^*]*))?)\*([0-9A-F]{2})$")?;
        Ok(Self { frame_pattern })
    }

    pub fn encode_command(&self, frame: &CommandFrame) -> Vec<u8> {
        encode_line(COMMAND_START, frame.id, &frame.command.body())
    }

    /// Encode a response. `*` and line breaks in the data are replaced by
    /// spaces since they would end the frame early.
    pub fn encode_response(&self, frame: &ResponseFrame) -> Vec<u8> {
        let data: String = frame
            .data
            .chars()
            .map(|c| if matches!(c, '*' | '\r' | '\n') { ' ' } else { c })
            .collect();
        encode_line(frame.status.as_char(), frame.id, data.trim_end())
    }

    pub fn decode_command(&self, bytes: &[u8]) -> Result<CommandFrame, CodecError> {
        let (start, id, body) = self.split_frame(bytes)?;
        if start != COMMAND_START {
            return Err(CodecError::Syntax(format!("'{}' does not start a command frame", start)));
        }
        let fields: Vec<&str> = body.split_whitespace().collect();
        let (opcode, args) = fields
            .split_first()
            .ok_or_else(|| CodecError::Syntax("missing opcode".to_string()))?;

        let command = match *opcode {
            "HELLO" => expect_args(args, 0, opcode).map(|_| Command::Hello)?,
            "RESET" => expect_args(args, 0, opcode).map(|_| Command::Reset)?,
            "STATUS" => expect_args(args, 0, opcode).map(|_| Command::Status)?,
            "ARM" => expect_args(args, 0, opcode).map(|_| Command::Arm)?,
            "DISARM" => expect_args(args, 0, opcode).map(|_| Command::Disarm)?,
            "MOVE" => {
                expect_args(args, 4, opcode)?;
                let (target, feed) = parse_target_and_feed(args)?;
                Command::MoveTo { target, feed }
            }
            "POWER" => {
                expect_args(args, 1, opcode)?;
                Command::SetPower { power: parse_power(args[0])? }
            }
            "EXPOSE" => match args.first().copied() {
                Some("T") => {
                    expect_args(args, 2, opcode)?;
                    Command::Expose {
                        exposure: Exposure::Timed {
                            duration: Duration::from_micros(parse_field(args[1], "duration")?),
                        },
                    }
                }
                Some("L") => {
                    expect_args(args, 5, opcode)?;
                    let (target, feed) = parse_target_and_feed(&args[1..])?;
                    Command::Expose { exposure: Exposure::Path { target, feed } }
                }
                other => {
                    return Err(CodecError::Syntax(format!(
                        "unknown exposure mode {:?}",
                        other
                    )))
                }
            },
            "SETTLE" => {
                expect_args(args, 1, opcode)?;
                Command::WaitSettle {
                    duration: Duration::from_micros(parse_field(args[0], "duration")?),
                }
            }
            unknown => return Err(CodecError::Syntax(format!("unknown opcode '{}'", unknown))),
        };

        Ok(CommandFrame { id, command })
    }

    pub fn decode_response(&self, bytes: &[u8]) -> Result<ResponseFrame, CodecError> {
        let (start, id, body) = self.split_frame(bytes)?;
        let status = ResponseStatus::from_char(start).ok_or_else(|| {
            CodecError::Syntax(format!("'{}' is not a response status", start))
        })?;
        Ok(ResponseFrame { id, status, data: body.to_string() })
    }

    /// Validate length, terminator and checksum; return the start character,
    /// correlation id and body
    fn split_frame<'a>(&self, bytes: &'a [u8]) -> Result<(char, CorrelationId, &'a str), CodecError> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(CodecError::LengthMismatch(format!(
                "{} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_FRAME_LEN
            )));
        }
        let line = match bytes.split_last() {
            Some((&FRAME_TERMINATOR, rest)) => rest,
            _ => return Err(CodecError::LengthMismatch("missing terminator".to_string())),
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let text = std::str::from_utf8(line)
            .map_err(|_| CodecError::Syntax("frame is not valid UTF-8".to_string()))?;

        let captures = self
            .frame_pattern
            .captures(text)
            .ok_or_else(|| CodecError::Syntax(format!("unrecognised frame {:?}", text)))?;

        let start = captures
            .get(1)
            .and_then(|m| m.as_str().chars().next())
            .ok_or_else(|| CodecError::Syntax("missing start character".to_string()))?;
        let covered = captures.get(2).map_or("", |m| m.as_str());
        let id_hex = captures.get(3).map_or("", |m| m.as_str());
        let body = captures.get(4).map_or("", |m| m.as_str());
        let cs_hex = captures.get(5).map_or("", |m| m.as_str());

        let found = u8::from_str_radix(cs_hex, 16)
            .map_err(|_| CodecError::Syntax(format!("invalid checksum '{}'", cs_hex)))?;
        let expected = checksum(covered.as_bytes());
        if expected != found {
            return Err(CodecError::ChecksumMismatch { expected, found });
        }

        let id = CorrelationId::from_str_radix(id_hex, 16)
            .map_err(|_| CodecError::Syntax(format!("invalid correlation id '{}'", id_hex)))?;

        Ok((start, id, body))
    }
}

fn encode_line(start: char, id: CorrelationId, body: &str) -> Vec<u8> {
    let covered = if body.is_empty() {
        format!("{:04X}", id)
    } else {
        format!("{:04X} {}", id, body)
    };
    format!("{}{}*{:02X}\n", start, covered, checksum(covered.as_bytes())).into_bytes()
}

fn expect_args(args: &[&str], expected: usize, opcode: &str) -> Result<(), CodecError> {
    if args.len() != expected {
        return Err(CodecError::LengthMismatch(format!(
            "{} takes {} fields, found {}",
            opcode,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn parse_field<T: std::str::FromStr>(field: &str, name: &str) -> Result<T, CodecError> {
    field
        .parse()
        .map_err(|_| CodecError::Syntax(format!("invalid {} field '{}'", name, field)))
}

fn parse_power(field: &str) -> Result<Power, CodecError> {
    let raw: u16 = parse_field(field, "power")?;
    if raw > Power::FULL.0 {
        return Err(CodecError::Syntax(format!("power {} exceeds {}", raw, Power::FULL.0)));
    }
    Ok(Power(raw))
}

fn parse_target_and_feed(args: &[&str]) -> Result<(StagePosition, FeedRate), CodecError> {
    let target = StagePosition {
        x: Decimicron(parse_field(args[0], "x")?),
        y: Decimicron(parse_field(args[1], "y")?),
        z: Decimicron(parse_field(args[2], "z")?),
    };
    let feed = FeedRate(parse_field(args[3], "feed")?);
    Ok((target, feed))
}
