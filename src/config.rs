//! Run configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML run file (base configuration)
//! 2. environment variables prefixed with `TM_DAQ_`, using `__` for nesting
//!    (`TM_DAQ_SERIAL__PORT=/dev/ttyUSB1`, `TM_DAQ_LOG_LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use tm_daq::config::RunConfig;
//!
//! let config = RunConfig::load_from("config/run.toml")?;
//! config.validate()?;
//! let engine = config.build_engine()?;
//! # Ok::<(), tm_daq::error::DaqError>(())
//! ```

use crate::bump_bond::{BumpBondMonitor, DEFAULT_VCC};
use crate::engine::TelemetryEngine;
use crate::error::{DaqError, DaqResult};
use crate::firmware::{
    BoardPosition, ControlBoardV1, Firmware, FirmwareCodec, FirmwareSetup, SensorKind, SensorName,
    AVAILABLE_FIRMWARES,
};
use crate::module::ModuleController;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TM_DAQ_";

/// Top-level run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Engine tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Supply voltage of the bump-bond dividers
    #[serde(default = "default_vcc")]
    pub bump_bond_vcc: f64,
    /// Serial link settings
    pub serial: SerialConfig,
    /// Firmware dialect on the link
    pub firmware: FirmwareConfig,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

/// Serial port settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port path, e.g. `/dev/ttyACM0` or `COM3`
    pub port: String,
    /// Line speed
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Firmware selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Registered dialect name, e.g. "Thermal Mockup V2"
    pub version: String,
}

/// One module on the link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Unique module name
    pub name: String,
    /// Sensor poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Sensors left out of the poll command
    #[serde(default)]
    pub disabled_sensors: Vec<SensorName>,
    /// Slot on the control board (required for "Control Board V1")
    #[serde(default)]
    pub control_board_position: Option<BoardPosition>,
    /// Bump-bond poll interval in milliseconds
    #[serde(default = "default_bump_bond_interval_ms")]
    pub bump_bond_interval_ms: u64,
    /// Bump-bond path id -> reference resistor ohms. TOML keys are strings.
    #[serde(default)]
    pub reference_resistors: BTreeMap<String, f64>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_ms() -> u64 {
    100
}

fn default_vcc() -> f64 {
    DEFAULT_VCC
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_poll_interval_ms() -> u64 {
    1500
}

fn default_bump_bond_interval_ms() -> u64 {
    3000
}

impl ModuleConfig {
    /// Reference resistors keyed by numeric path id.
    pub fn reference_resistors_by_id(&self) -> DaqResult<BTreeMap<u32, f64>> {
        self.reference_resistors
            .iter()
            .map(|(id, ohms)| {
                let id = id.trim().parse::<u32>().map_err(|_| {
                    DaqError::Configuration(format!(
                        "Invalid bump-bond path id '{}' on module {}",
                        id, self.name
                    ))
                })?;
                Ok((id, *ohms))
            })
            .collect()
    }

    /// Sensors this module polls under `firmware`: everything not disabled that the dialect can
    /// read.
    pub fn enabled_sensors(&self, firmware: &impl FirmwareCodec) -> Vec<SensorName> {
        SensorName::enabled_excluding(&self.disabled_sensors)
            .into_iter()
            .filter(|name| firmware.supports(name.kind()))
            .collect()
    }
}

impl RunConfig {
    /// Load configuration from a TOML file and `TM_DAQ_` environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DaqError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        let config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn from_toml_str(toml: &str) -> DaqResult<Self> {
        Ok(Figment::new().merge(Toml::string(toml)).extract()?)
    }

    /// Engine tick as a `Duration`
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> DaqResult<()> {
        let fail = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return fail(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.tick_ms == 0 {
            return fail("tick_ms must be greater than zero".into());
        }
        if self.serial.port.trim().is_empty() {
            return fail("serial.port must not be empty".into());
        }
        if self.serial.baud_rate == 0 {
            return fail("serial.baud_rate must be greater than zero".into());
        }
        if !(self.bump_bond_vcc.is_finite() && self.bump_bond_vcc > 0.0) {
            return fail(format!(
                "bump_bond_vcc must be positive, got {}",
                self.bump_bond_vcc
            ));
        }

        if !AVAILABLE_FIRMWARES.contains(&self.firmware.version.as_str()) {
            return fail(format!(
                "Unknown firmware '{}'. Available: {}",
                self.firmware.version,
                AVAILABLE_FIRMWARES.join(", ")
            ));
        }
        let needs_position = self.firmware.version == ControlBoardV1::NAME;

        if self.modules.is_empty() {
            return fail("At least one module must be configured".into());
        }

        // Responses carry no module address except the control board slot, so modules sharing
        // the link must be told apart by that slot alone.
        if !needs_position && self.modules.len() > 1 {
            return fail(format!(
                "Firmware '{}' cannot address more than one module on a link, got {}",
                self.firmware.version,
                self.modules.len()
            ));
        }
        let with_paths = self
            .modules
            .iter()
            .filter(|m| !m.reference_resistors.is_empty())
            .count();
        if with_paths > 1 {
            return fail(format!(
                "Bump-bond responses are not addressed; {} modules declare reference_resistors",
                with_paths
            ));
        }

        let mut names = HashSet::new();
        let mut positions = HashSet::new();
        for module in &self.modules {
            if module.name.trim().is_empty() {
                return fail("Module name must not be empty".into());
            }
            if !names.insert(module.name.as_str()) {
                return fail(format!("Duplicate module name: {}", module.name));
            }
            if module.poll_interval_ms == 0 || module.bump_bond_interval_ms == 0 {
                return fail(format!(
                    "Poll intervals of module {} must be greater than zero",
                    module.name
                ));
            }
            if needs_position {
                let Some(position) = module.control_board_position else {
                    return fail(format!(
                        "Module {} needs control_board_position for firmware '{}'",
                        module.name, self.firmware.version
                    ));
                };
                if !positions.insert(position) {
                    return fail(format!(
                        "Control board position '{}' used by more than one module",
                        position.letter()
                    ));
                }
            }

            let enabled = SensorName::enabled_excluding(&module.disabled_sensors)
                .into_iter()
                .filter(|name| !(needs_position && name.kind() == SensorKind::Probe))
                .count();
            if enabled == 0 {
                return fail(format!("Module {} has no enabled sensor", module.name));
            }

            for (id, ohms) in module.reference_resistors_by_id()? {
                if !(ohms.is_finite() && ohms > 0.0) {
                    return fail(format!(
                        "Reference resistor of path {} on module {} must be positive, got {}",
                        id, module.name, ohms
                    ));
                }
            }
        }

        Ok(())
    }

    /// Build controllers and monitors for every configured module.
    pub fn build_engine(&self) -> DaqResult<TelemetryEngine> {
        self.validate()?;
        let mut engine = TelemetryEngine::new(self.tick());

        for module in &self.modules {
            let setup = FirmwareSetup {
                control_board_position: module.control_board_position,
                channel_map: None,
            };
            let firmware = Firmware::select(&self.firmware.version, &setup)?;
            let enabled = module.enabled_sensors(&firmware);

            let paths = module.reference_resistors_by_id()?;
            if !paths.is_empty() {
                engine.add_monitor(BumpBondMonitor::new(
                    module.name.clone(),
                    firmware.clone(),
                    &paths,
                    self.bump_bond_vcc,
                    Duration::from_millis(module.bump_bond_interval_ms),
                )?);
            }

            engine.add_module(ModuleController::new(
                module.name.clone(),
                firmware,
                &enabled,
                Duration::from_millis(module.poll_interval_ms),
            )?)?;
        }

        info!(
            modules = engine.modules().len(),
            monitors = engine.monitors().len(),
            firmware = %self.firmware.version,
            "Engine built from configuration"
        );
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
log_level = "debug"

[serial]
port = "/dev/ttyACM0"

[firmware]
version = "Thermal Mockup V2"

[[modules]]
name = "TM0"
disabled_sensors = ["L1", "L2", "L3", "L4"]

[modules.reference_resistors]
1 = 1000.0
4 = 2200.0
"#;

    const BOARD: &str = r#"
[serial]
port = "COM3"

[firmware]
version = "Control Board V1"

[[modules]]
name = "TM0"
control_board_position = "a"

[modules.reference_resistors]
1 = 1000.0

[[modules]]
name = "TM1"
control_board_position = "b"
poll_interval_ms = 2000
"#;

    #[test]
    fn test_defaults_applied() {
        let config = RunConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.tick_ms, 100);
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.bump_bond_vcc, 3.3);
        assert_eq!(config.modules[0].poll_interval_ms, 1500);
        assert_eq!(config.modules[0].bump_bond_interval_ms, 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_build_engine() {
        let config = RunConfig::from_toml_str(SAMPLE).unwrap();
        let engine = config.build_engine().unwrap();
        assert_eq!(engine.modules().len(), 1);
        assert_eq!(engine.monitors().len(), 1);

        let tm0 = engine.module("TM0").unwrap();
        assert_eq!(tm0.sensors().len(), 7);
        assert_eq!(tm0.command(), "measure 3 5 1 8\nprobe 1 2 3");
        assert_eq!(engine.monitor("TM0").unwrap().path(4).unwrap().reference_ohms(), 2200.0);
    }

    #[test]
    fn test_control_board_drops_probes() {
        let toml = r#"
[serial]
port = "COM3"
[firmware]
version = "Control Board V1"
[[modules]]
name = "TM0"
control_board_position = "b"
disabled_sensors = ["L1", "L2", "L3", "L4", "E2", "E4"]
"#;
        let config = RunConfig::from_toml_str(toml).unwrap();
        let engine = config.build_engine().unwrap();
        assert_eq!(engine.module("TM0").unwrap().command(), "TM -b measure 3 1");
    }

    #[test]
    fn test_unaddressed_dialect_allows_one_module() {
        let toml = format!("{}\n[[modules]]\nname = \"TM1\"\n", SAMPLE);
        let config = RunConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.modules.len(), 2);
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));
        assert!(config.build_engine().is_err());

        let mut config = config;
        config.firmware.version = "Thermal Mockup V3".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_control_board_modules_on_distinct_slots() {
        let config = RunConfig::from_toml_str(BOARD).unwrap();
        let mut engine = config.build_engine().unwrap();
        assert_eq!(engine.modules().len(), 2);
        assert_eq!(engine.module("TM0").unwrap().command(), "TM -a measure 3 5 1 8 2 4 6 7");

        // Each answer only reaches the module in its slot
        let mut link = crate::transport::MockTransport::new();
        let now = tokio::time::Instant::now();
        engine.start_polling(now);
        assert_eq!(engine.on_tick(now, &mut link), 3);
        engine.dispatch_line("TM -b measure 3 72a4ff");
        let tm0 = engine.module("TM0").unwrap();
        let tm1 = engine.module("TM1").unwrap();
        assert!(tm0.sensor(SensorName::E1).unwrap().readings().is_empty());
        assert_eq!(tm1.sensor(SensorName::E1).unwrap().readings().len(), 1);
        assert!(tm0.sensor(SensorName::E1).unwrap().is_pending());
    }

    #[test]
    fn test_shared_board_position_rejected() {
        let mut config = RunConfig::from_toml_str(BOARD).unwrap();
        config.modules[1].control_board_position = Some(BoardPosition::A);
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_bump_bond_paths_on_one_module_only() {
        let mut config = RunConfig::from_toml_str(BOARD).unwrap();
        config.modules[1]
            .reference_resistors
            .insert("2".into(), 1000.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_control_board_needs_position() {
        let toml = r#"
[serial]
port = "COM3"
[firmware]
version = "Control Board V1"
[[modules]]
name = "TM0"
"#;
        let config = RunConfig::from_toml_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_settings() {
        let base = RunConfig::from_toml_str(SAMPLE).unwrap();

        let mut config = base.clone();
        config.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.firmware.version = "Thermal Mockup V9".into();
        assert!(config.validate().is_err());

        let mut config = RunConfig::from_toml_str(BOARD).unwrap();
        config.modules[1].name = "TM0".into();
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.modules[0].poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.modules[0].disabled_sensors = SensorName::ALL.to_vec();
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.modules[0]
            .reference_resistors
            .insert("2".into(), -1.0);
        assert!(config.validate().is_err());

        let mut config = base;
        config.modules[0]
            .reference_resistors
            .insert("two".into(), 100.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = RunConfig::load_from(file.path()).unwrap();
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.serial.port, "/dev/ttyACM0");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = RunConfig::load_from(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_unknown_sensor_name_rejected() {
        let toml = SAMPLE.replace("\"L4\"]", "\"X9\"]");
        assert!(matches!(
            RunConfig::from_toml_str(&toml),
            Err(DaqError::ConfigFile(_))
        ));
    }
}
