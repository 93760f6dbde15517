//! Control Board V1 dialect.
//!
//! The control board multiplexes up to four modules. Every request is prefixed with the module's
//! slot, `TM -<pos> measure <ch> ...`, and the board echoes the prefix in each response line:
//!
//! ```text
//! > TM -a measure 3 1
//! < TM -a measure 3 72a4ff
//! < TM -a measure 1 6fa1ff
//! ```
//!
//! Probes are not routed through the control board.

use super::{
    compile, decode_tp, tp_pattern, BoardPosition, ChannelMap, FirmwareCodec, FrameSpec,
    SensorKind, SensorName, RAW_ADC_LEN,
};
use crate::error::{DaqError, DaqResult};
use regex::Regex;

/// Codec for modules behind the control board.
#[derive(Debug, Clone)]
pub struct ControlBoardV1 {
    position: BoardPosition,
    map: ChannelMap,
    measure_pattern: Regex,
    tp_pattern: Regex,
}

impl ControlBoardV1 {
    /// Registered dialect name.
    pub const NAME: &'static str = "Control Board V1";

    /// Codec for `position` with the standard wiring.
    pub fn new(position: BoardPosition) -> DaqResult<Self> {
        Self::with_map(position, ChannelMap::thermal_mockup())
    }

    /// Codec for `position` with a custom channel map.
    pub fn with_map(position: BoardPosition, map: ChannelMap) -> DaqResult<Self> {
        let measure_pattern = compile(&format!(
            r"^TM -{} measure (\d+) ([0-9a-f]{{{}}})$",
            position.letter(),
            RAW_ADC_LEN
        ))?;
        Ok(Self {
            position,
            map,
            measure_pattern,
            tp_pattern: tp_pattern()?,
        })
    }

    /// Slot the module is plugged into.
    pub fn position(&self) -> BoardPosition {
        self.position
    }

    fn prefix(&self) -> String {
        format!("TM -{}", self.position.letter())
    }

    fn resistive_channel(&self, name: SensorName) -> DaqResult<u8> {
        if !self.supports(name.kind()) {
            return Err(DaqError::Configuration(format!(
                "Firmware '{}' cannot read probe {}",
                Self::NAME,
                name
            )));
        }
        self.map.require(name, Self::NAME)
    }
}

impl FirmwareCodec for ControlBoardV1 {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn channels(&self) -> &ChannelMap {
        &self.map
    }

    fn supports(&self, kind: SensorKind) -> bool {
        kind == SensorKind::Resistive
    }

    fn encode_measure(&self, names: &[SensorName]) -> DaqResult<String> {
        if names.is_empty() {
            return Err(DaqError::Configuration(
                "No sensor selected for measurement".into(),
            ));
        }
        let channels = names
            .iter()
            .map(|&name| self.resistive_channel(name).map(|ch| ch.to_string()))
            .collect::<DaqResult<Vec<_>>>()?;
        Ok(format!("{} measure {}", self.prefix(), channels.join(" ")))
    }

    fn decode_line(&self, line: &str) -> Option<(SensorName, String)> {
        let caps = self.measure_pattern.captures(line.trim_end())?;
        let channel: u8 = caps.get(1)?.as_str().parse().ok()?;
        let name = self.map.sensor(SensorKind::Resistive, channel)?;
        Some((name, caps.get(2)?.as_str().to_string()))
    }

    fn frame_spec(&self, name: SensorName) -> DaqResult<FrameSpec> {
        let channel = self.resistive_channel(name)?;
        Ok(FrameSpec::new(
            format!("{} measure {}", self.prefix(), channel),
            RAW_ADC_LEN,
        ))
    }

    fn decode_bb(&self, line: &str) -> Option<(u32, f64)> {
        decode_tp(&self.tp_pattern, line)
    }
}
