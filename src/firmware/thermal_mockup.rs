//! Thermal Mockup dialects (V2, V3).
//!
//! Both revisions answer `measure <ch> ...` with one `measure <ch> <hex6>` line per channel.
//! They differ in how the digital temperature probes report:
//!
//! - V2 prints the legacy `Probe <id>: 0x<hex3>` form.
//! - V3 prints `probe <id> <hex4>`.

use super::{
    compile, decode_tp, tp_pattern, ChannelMap, FirmwareCodec, FrameSpec, SensorKind, SensorName,
    RAW_ADC_LEN,
};
use crate::error::{DaqError, DaqResult};
use regex::Regex;

/// Response format of the probe channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFormat {
    /// `Probe 1: 0xc80`
    Legacy,
    /// `probe 1 0c80`
    Fixed,
}

impl ProbeFormat {
    const LEGACY_VALUE_LEN: usize = 5; // "0x" + 3 hex digits
    const FIXED_VALUE_LEN: usize = 4;

    fn value_len(self) -> usize {
        match self {
            ProbeFormat::Legacy => Self::LEGACY_VALUE_LEN,
            ProbeFormat::Fixed => Self::FIXED_VALUE_LEN,
        }
    }
}

/// Codec for modules wired straight to the link.
#[derive(Debug, Clone)]
pub struct ThermalMockup {
    probe_format: ProbeFormat,
    map: ChannelMap,
    measure_pattern: Regex,
    probe_pattern: Regex,
    tp_pattern: Regex,
}

impl ThermalMockup {
    /// Registered name of the legacy-probe dialect.
    pub const V2_NAME: &'static str = "Thermal Mockup V2";
    /// Registered name of the fixed-probe dialect.
    pub const V3_NAME: &'static str = "Thermal Mockup V3";

    /// Codec with the standard wiring.
    pub fn new(probe_format: ProbeFormat) -> DaqResult<Self> {
        Self::with_map(probe_format, ChannelMap::thermal_mockup())
    }

    /// Codec with a custom channel map.
    pub fn with_map(probe_format: ProbeFormat, map: ChannelMap) -> DaqResult<Self> {
        let probe_pattern = match probe_format {
            ProbeFormat::Legacy => compile(r"^Probe (\d+): (0x[0-9a-f]{3})$")?,
            ProbeFormat::Fixed => compile(r"^probe (\d+) ([0-9a-f]{4})$")?,
        };
        Ok(Self {
            probe_format,
            map,
            measure_pattern: compile(&format!(r"^measure (\d+) ([0-9a-f]{{{}}})$", RAW_ADC_LEN))?,
            probe_pattern,
            tp_pattern: tp_pattern()?,
        })
    }

    /// Probe response form.
    pub fn probe_format(&self) -> ProbeFormat {
        self.probe_format
    }

    fn channels_of(&self, names: &[SensorName], kind: SensorKind) -> DaqResult<Vec<String>> {
        names
            .iter()
            .filter(|name| name.kind() == kind)
            .map(|&name| self.map.require(name, self.name()).map(|ch| ch.to_string()))
            .collect()
    }
}

impl FirmwareCodec for ThermalMockup {
    fn name(&self) -> &'static str {
        match self.probe_format {
            ProbeFormat::Legacy => Self::V2_NAME,
            ProbeFormat::Fixed => Self::V3_NAME,
        }
    }

    fn channels(&self) -> &ChannelMap {
        &self.map
    }

    fn encode_measure(&self, names: &[SensorName]) -> DaqResult<String> {
        if names.is_empty() {
            return Err(DaqError::Configuration(
                "No sensor selected for measurement".into(),
            ));
        }

        let resistive = self.channels_of(names, SensorKind::Resistive)?;
        let probes = self.channels_of(names, SensorKind::Probe)?;

        let mut parts = Vec::with_capacity(2);
        if !resistive.is_empty() {
            parts.push(format!("measure {}", resistive.join(" ")));
        }
        if !probes.is_empty() {
            parts.push(format!("probe {}", probes.join(" ")));
        }
        Ok(parts.join("\n"))
    }

    fn decode_line(&self, line: &str) -> Option<(SensorName, String)> {
        let line = line.trim_end();
        let (kind, caps) = if let Some(caps) = self.measure_pattern.captures(line) {
            (SensorKind::Resistive, caps)
        } else {
            (SensorKind::Probe, self.probe_pattern.captures(line)?)
        };
        let channel: u8 = caps.get(1)?.as_str().parse().ok()?;
        let name = self.map.sensor(kind, channel)?;
        Some((name, caps.get(2)?.as_str().to_string()))
    }

    fn frame_spec(&self, name: SensorName) -> DaqResult<FrameSpec> {
        let channel = self.map.require(name, self.name())?;
        Ok(match (name.kind(), self.probe_format) {
            (SensorKind::Resistive, _) => FrameSpec::new(format!("measure {}", channel), RAW_ADC_LEN),
            (SensorKind::Probe, ProbeFormat::Legacy) => FrameSpec::new(
                format!("Probe {}:", channel),
                self.probe_format.value_len(),
            ),
            (SensorKind::Probe, ProbeFormat::Fixed) => FrameSpec::new(
                format!("probe {}", channel),
                self.probe_format.value_len(),
            ),
        })
    }

    fn decode_bb(&self, line: &str) -> Option<(u32, f64)> {
        decode_tp(&self.tp_pattern, line)
    }
}
