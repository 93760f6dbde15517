//! Firmware dialects: command encoding and response decoding.
//!
//! Each module firmware revision speaks a slightly different line protocol. A dialect is a pure
//! codec: it turns sensor names into outbound command text and recognises the response lines
//! that belong to a sensor or bump-bond path. Dialects hold no protocol state.
//!
//! # Registry
//!
//! Dialects form a closed set selected by their registered name once, when a module is set up:
//!
//! ```
//! use tm_daq::firmware::{Firmware, FirmwareCodec, FirmwareSetup};
//! use tm_daq::firmware::SensorName;
//!
//! let fw = Firmware::select("Thermal Mockup V2", &FirmwareSetup::default()).unwrap();
//! let cmd = fw.encode_measure(&[SensorName::E1, SensorName::E3]).unwrap();
//! assert_eq!(cmd, "measure 3 1");
//! ```
//!
//! | Name                | Measure response              | Probe response        |
//! |---------------------|-------------------------------|-----------------------|
//! | `Control Board V1`  | `TM -a measure 1 72a4ff`      | not supported         |
//! | `Thermal Mockup V2` | `measure 1 72a4ff`            | `Probe 1: 0xc80`      |
//! | `Thermal Mockup V3` | `measure 1 72a4ff`            | `probe 1 0c80`        |
//!
//! Bump-bond paths use the same `TP` sub-protocol on every dialect.

pub mod channel_map;
pub mod control_board;
pub mod thermal_mockup;

pub use channel_map::{ChannelMap, SensorKind, SensorName};
pub use control_board::ControlBoardV1;
pub use thermal_mockup::{ProbeFormat, ThermalMockup};

use crate::error::{DaqError, DaqResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Registered dialect names, in the order they are offered to operators.
pub const AVAILABLE_FIRMWARES: &[&str] = &[
    ControlBoardV1::NAME,
    ThermalMockup::V2_NAME,
    ThermalMockup::V3_NAME,
];

/// Length of the hex token the ADC prints for a resistive reading (`72a4ff`).
pub const RAW_ADC_LEN: usize = 6;

/// How the response to one sensor's request is framed on the wire.
///
/// A response frame is `<token> <value>`, where `token` identifies the sensor
/// (`measure 1`, `Probe 2:`) and `value` has a fixed width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSpec {
    /// Sensor-identifying prefix.
    pub token: String,
    /// Width of the value in characters.
    pub value_len: usize,
}

impl FrameSpec {
    /// Frame of `token` followed by `value_len` characters.
    pub fn new(token: impl Into<String>, value_len: usize) -> Self {
        Self {
            token: token.into(),
            value_len,
        }
    }

    /// Total frame length: token, one separator, value.
    pub fn frame_len(&self) -> usize {
        self.token.len() + 1 + self.value_len
    }
}

/// Fixed control tokens understood by every dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Reset the ADCs on the module.
    Reset,
    /// Run the ADC self-calibration.
    Calibrate,
}

impl ControlCommand {
    /// Token sent on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ControlCommand::Reset => "reset",
            ControlCommand::Calibrate => "calibrate",
        }
    }
}

/// Control-board slot (`A`..`D`) a module is plugged into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BoardPosition {
    /// Slot `a`.
    A,
    /// Slot `b`.
    B,
    /// Slot `c`.
    C,
    /// Slot `d`.
    D,
}

impl BoardPosition {
    /// Lowercase letter used in `TM -<pos>` commands.
    pub fn letter(self) -> char {
        match self {
            BoardPosition::A => 'a',
            BoardPosition::B => 'b',
            BoardPosition::C => 'c',
            BoardPosition::D => 'd',
        }
    }
}

impl FromStr for BoardPosition {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" => Ok(BoardPosition::A),
            "b" => Ok(BoardPosition::B),
            "c" => Ok(BoardPosition::C),
            "d" => Ok(BoardPosition::D),
            other => Err(DaqError::Configuration(format!(
                "Invalid control board position '{}'. Must be one of: A, B, C, D",
                other
            ))),
        }
    }
}

impl TryFrom<String> for BoardPosition {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BoardPosition> for String {
    fn from(value: BoardPosition) -> Self {
        value.letter().to_ascii_uppercase().to_string()
    }
}

impl fmt::Display for BoardPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter().to_ascii_uppercase())
    }
}

/// Per-module parameters a dialect may need at construction.
#[derive(Debug, Clone, Default)]
pub struct FirmwareSetup {
    /// Slot on the control board; required by `Control Board V1`.
    pub control_board_position: Option<BoardPosition>,
    /// Override of the default wiring table.
    pub channel_map: Option<ChannelMap>,
}

/// Capability set implemented by every dialect.
pub trait FirmwareCodec {
    /// Registered dialect name.
    fn name(&self) -> &'static str;

    /// Name ↔ channel table used by this codec.
    fn channels(&self) -> &ChannelMap;

    /// Whether this dialect can read sensors of `kind` at all.
    fn supports(&self, _kind: SensorKind) -> bool {
        true
    }

    /// Encode one request for all `names`.
    ///
    /// Fails with [`DaqError::Configuration`] if `names` is empty or holds a sensor this dialect
    /// cannot address. When both resistive and probe sensors are requested the two sub-commands
    /// are joined with `\n` and must be sent as one write.
    fn encode_measure(&self, names: &[SensorName]) -> DaqResult<String>;

    /// Attribute a response line to a sensor. Never fails; unrelated lines return `None`.
    fn decode_line(&self, line: &str) -> Option<(SensorName, String)>;

    /// Response framing for `name`, used by the sensor state machine.
    fn frame_spec(&self, name: SensorName) -> DaqResult<FrameSpec>;

    /// Encode a bump-bond request: `TP <id1> <id2> ...`.
    fn encode_bb(&self, path_ids: &[u32]) -> DaqResult<String> {
        encode_tp(path_ids)
    }

    /// Decode a bump-bond response `TP<id> <value>`.
    fn decode_bb(&self, line: &str) -> Option<(u32, f64)>;

    /// Text of a fixed control command.
    fn encode_control(&self, command: ControlCommand) -> String {
        command.as_str().to_string()
    }
}

pub(crate) fn encode_tp(path_ids: &[u32]) -> DaqResult<String> {
    if path_ids.is_empty() {
        return Err(DaqError::Configuration(
            "No bump-bond path selected for measurement".into(),
        ));
    }
    let ids: Vec<String> = path_ids.iter().map(u32::to_string).collect();
    Ok(format!("TP {}", ids.join(" ")))
}

pub(crate) fn tp_pattern() -> DaqResult<Regex> {
    compile(r"^TP(\d+) ([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)$")
}

pub(crate) fn decode_tp(pattern: &Regex, line: &str) -> Option<(u32, f64)> {
    let caps = pattern.captures(line.trim_end())?;
    let id = caps.get(1)?.as_str().parse().ok()?;
    let value = caps.get(2)?.as_str().parse().ok()?;
    Some((id, value))
}

pub(crate) fn compile(pattern: &str) -> DaqResult<Regex> {
    Regex::new(pattern)
        .map_err(|e| DaqError::Configuration(format!("Invalid response pattern: {}", e)))
}

/// A dialect resolved from the registry.
#[derive(Debug, Clone)]
pub enum Firmware {
    /// "Control Board V1".
    ControlBoardV1(ControlBoardV1),
    /// "Thermal Mockup V2" or "Thermal Mockup V3".
    ThermalMockup(ThermalMockup),
}

impl Firmware {
    /// Resolve a dialect by its registered name.
    pub fn select(name: &str, setup: &FirmwareSetup) -> DaqResult<Self> {
        let map = setup
            .channel_map
            .clone()
            .unwrap_or_else(ChannelMap::thermal_mockup);

        match name {
            ControlBoardV1::NAME => {
                let position = setup.control_board_position.ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "Firmware '{}' requires a control board position",
                        name
                    ))
                })?;
                Ok(Firmware::ControlBoardV1(ControlBoardV1::with_map(
                    position, map,
                )?))
            }
            ThermalMockup::V2_NAME => Ok(Firmware::ThermalMockup(ThermalMockup::with_map(
                ProbeFormat::Legacy,
                map,
            )?)),
            ThermalMockup::V3_NAME => Ok(Firmware::ThermalMockup(ThermalMockup::with_map(
                ProbeFormat::Fixed,
                map,
            )?)),
            other => Err(DaqError::Configuration(format!(
                "Unknown firmware '{}'. Available: {}",
                other,
                AVAILABLE_FIRMWARES.join(", ")
            ))),
        }
    }

    fn codec(&self) -> &dyn FirmwareCodec {
        match self {
            Firmware::ControlBoardV1(fw) => fw,
            Firmware::ThermalMockup(fw) => fw,
        }
    }
}

impl FirmwareCodec for Firmware {
    fn name(&self) -> &'static str {
        self.codec().name()
    }

    fn channels(&self) -> &ChannelMap {
        self.codec().channels()
    }

    fn supports(&self, kind: SensorKind) -> bool {
        self.codec().supports(kind)
    }

    fn encode_measure(&self, names: &[SensorName]) -> DaqResult<String> {
        self.codec().encode_measure(names)
    }

    fn decode_line(&self, line: &str) -> Option<(SensorName, String)> {
        self.codec().decode_line(line)
    }

    fn frame_spec(&self, name: SensorName) -> DaqResult<FrameSpec> {
        self.codec().frame_spec(name)
    }

    fn encode_bb(&self, path_ids: &[u32]) -> DaqResult<String> {
        self.codec().encode_bb(path_ids)
    }

    fn decode_bb(&self, line: &str) -> Option<(u32, f64)> {
        self.codec().decode_bb(line)
    }

    fn encode_control(&self, command: ControlCommand) -> String {
        self.codec().encode_control(command)
    }
}
