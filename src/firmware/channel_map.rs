//! Sensor identities and the name ↔ hardware channel table.

use crate::error::{DaqError, DaqResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Logical sensor on a thermal-mockup module.
///
/// `E*` and `L*` are resistive (RTD) channels read through the ADC, `P*` are digital temperature
/// probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorName {
    /// Resistive channel E1.
    E1,
    /// Resistive channel E2.
    E2,
    /// Resistive channel E3.
    E3,
    /// Resistive channel E4.
    E4,
    /// Resistive channel L1.
    L1,
    /// Resistive channel L2.
    L2,
    /// Resistive channel L3.
    L3,
    /// Resistive channel L4.
    L4,
    /// Probe P1.
    P1,
    /// Probe P2.
    P2,
    /// Probe P3.
    P3,
}

/// Which command namespace a sensor is read through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorKind {
    /// Resistive channel answered by `measure`.
    Resistive,
    /// Temperature probe answered by `probe`.
    Probe,
}

impl SensorName {
    /// Every sensor a module can carry, in display order.
    pub const ALL: [SensorName; 11] = [
        SensorName::E1,
        SensorName::E2,
        SensorName::E3,
        SensorName::E4,
        SensorName::L1,
        SensorName::L2,
        SensorName::L3,
        SensorName::L4,
        SensorName::P1,
        SensorName::P2,
        SensorName::P3,
    ];

    /// Command namespace of this sensor.
    pub fn kind(self) -> SensorKind {
        match self {
            SensorName::P1 | SensorName::P2 | SensorName::P3 => SensorKind::Probe,
            _ => SensorKind::Resistive,
        }
    }

    /// Name as written in run files.
    pub fn as_str(self) -> &'static str {
        match self {
            SensorName::E1 => "E1",
            SensorName::E2 => "E2",
            SensorName::E3 => "E3",
            SensorName::E4 => "E4",
            SensorName::L1 => "L1",
            SensorName::L2 => "L2",
            SensorName::L3 => "L3",
            SensorName::L4 => "L4",
            SensorName::P1 => "P1",
            SensorName::P2 => "P2",
            SensorName::P3 => "P3",
        }
    }

    /// Sensors left after removing `disabled` from [`SensorName::ALL`].
    pub fn enabled_excluding(disabled: &[SensorName]) -> Vec<SensorName> {
        Self::ALL
            .iter()
            .copied()
            .filter(|name| !disabled.contains(name))
            .collect()
    }
}

impl fmt::Display for SensorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorName {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        SensorName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == upper)
            .ok_or_else(|| DaqError::Configuration(format!("Unknown sensor name '{}'", s)))
    }
}

/// Bidirectional sensor ↔ channel table owned by a firmware codec.
///
/// Channel numbers are unique per [`SensorKind`]; a resistive and a probe sensor may share the
/// same number because they are addressed by different commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    by_name: BTreeMap<SensorName, u8>,
    by_channel: BTreeMap<(SensorKind, u8), SensorName>,
}

impl ChannelMap {
    /// Build a table, rejecting duplicate names and channels.
    pub fn new(entries: &[(SensorName, u8)]) -> DaqResult<Self> {
        let mut by_name = BTreeMap::new();
        let mut by_channel = BTreeMap::new();

        for &(name, channel) in entries {
            if by_name.insert(name, channel).is_some() {
                return Err(DaqError::Configuration(format!(
                    "Sensor {} mapped more than once",
                    name
                )));
            }
            if let Some(other) = by_channel.insert((name.kind(), channel), name) {
                return Err(DaqError::Configuration(format!(
                    "Sensors {} and {} share hardware channel {}",
                    other, name, channel
                )));
            }
        }

        Ok(Self {
            by_name,
            by_channel,
        })
    }

    /// Wiring used by every thermal-mockup module revision to date.
    pub fn thermal_mockup() -> Self {
        use SensorName::*;
        let entries = [
            (E3, 1),
            (L1, 2),
            (E1, 3),
            (L2, 4),
            (E2, 5),
            (L3, 6),
            (L4, 7),
            (E4, 8),
            (P1, 1),
            (P2, 2),
            (P3, 3),
        ];
        let by_name: BTreeMap<_, _> = entries.iter().copied().collect();
        let by_channel = entries
            .iter()
            .map(|&(name, ch)| ((name.kind(), ch), name))
            .collect();
        Self {
            by_name,
            by_channel,
        }
    }

    /// Hardware channel of `name`.
    pub fn channel(&self, name: SensorName) -> Option<u8> {
        self.by_name.get(&name).copied()
    }

    /// Sensor wired to `channel` in the `kind` namespace.
    pub fn sensor(&self, kind: SensorKind, channel: u8) -> Option<SensorName> {
        self.by_channel.get(&(kind, channel)).copied()
    }

    /// Channel for `name`, or a configuration error naming the dialect.
    pub fn require(&self, name: SensorName, dialect: &str) -> DaqResult<u8> {
        self.channel(name).ok_or_else(|| {
            DaqError::Configuration(format!("Sensor {} is not wired in firmware '{}'", name, dialect))
        })
    }

    /// Number of wired sensors.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether no sensor is wired.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
