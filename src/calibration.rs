//! Raw code → physical unit conversion and linear-fit calibration.
//!
//! # Resistive channels
//!
//! The ADC reports a 6-character hex token. Its last byte is a status byte and is dropped:
//!
//! ```text
//! code    = hex(raw[..len - 2])
//! volts   = 2.5 + (code / 2^15 - 1) * 1.024 * 2.5
//! ohms    = 1000 / (5 / volts - 1)
//! celsius = (ohms - intercept) / slope
//! ```
//!
//! # Probe channels
//!
//! Probes report a 16-bit register. The temperature is the upper 13 bits as two's complement in
//! units of 0.0625 °C. The probe reading can be corrected with the same kind of linear fit.
//!
//! Every step returns `Option`: a singular division, a missing fit or an unparseable token yields
//! `None` rather than an error.

use crate::error::{DaqError, DaqResult};
use crate::firmware::{SensorKind, SensorName};
use crate::sensor::Reading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// ADC mid-scale code (2^15).
pub const ADC_HALF_SCALE: f64 = 32768.0;
/// ADC reference voltage.
pub const ADC_VREF: f64 = 2.5;
/// ADC input range gain.
pub const ADC_RANGE_GAIN: f64 = 1.024;
/// Excitation voltage of the RTD divider.
pub const DIVIDER_SUPPLY_VOLTS: f64 = 5.0;
/// Fixed resistor of the RTD divider.
pub const DIVIDER_REFERENCE_OHMS: f64 = 1000.0;
/// Probe LSB in °C.
pub const PROBE_LSB_CELSIUS: f64 = 0.0625;

/// Hex digits of the trailing status byte.
const STATUS_BYTE_LEN: usize = 2;

fn strip_status_byte(digits: &str) -> Option<&str> {
    let end = digits.len().checked_sub(STATUS_BYTE_LEN)?;
    digits.get(..end).filter(|d| !d.is_empty())
}

/// ADC code from a resistive raw token (`72a4ff` → `0x72a4`).
pub fn raw_to_code(raw: &str) -> Option<u32> {
    u32::from_str_radix(strip_status_byte(raw.trim())?, 16).ok()
}

/// ADC code to volts at the ADC input.
pub fn code_to_volts(code: u32) -> f64 {
    ADC_VREF + (f64::from(code) / ADC_HALF_SCALE - 1.0) * ADC_RANGE_GAIN * ADC_VREF
}

/// Divider resistance; `None` when `volts` equals the supply (or is otherwise singular).
pub fn volts_to_ohms(volts: f64) -> Option<f64> {
    let ratio = DIVIDER_SUPPLY_VOLTS / volts - 1.0;
    if ratio == 0.0 || !ratio.is_finite() {
        return None;
    }
    let ohms = DIVIDER_REFERENCE_OHMS / ratio;
    ohms.is_finite().then_some(ohms)
}

/// Probe temperature from a raw register token (`0xc80`, `0c80`, or `0c80ff`).
pub fn probe_celsius(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    let digits = if digits.len() == 6 {
        strip_status_byte(digits)?
    } else {
        digits
    };
    if digits.is_empty() {
        return None;
    }
    let register = u16::from_str_radix(digits, 16).ok()?;
    let mut value = i32::from(register >> 3);
    if value & 0x1000 != 0 {
        value -= 0x2000;
    }
    Some(f64::from(value) * PROBE_LSB_CELSIUS)
}

/// `reading = slope * celsius + intercept`, fitted by ordinary least squares.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    /// Reading units per °C.
    pub slope: f64,
    /// Reading at 0 °C.
    pub intercept: f64,
}

impl LinearFit {
    /// Fit with known coefficients.
    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    /// Fit `(celsius, reading)` points. Needs two or more points with distinct temperatures.
    pub fn from_points(points: &[(f64, f64)]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        let n = points.len() as f64;
        let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

        let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
        let sxy: f64 = points
            .iter()
            .map(|(x, y)| (x - mean_x) * (y - mean_y))
            .sum();
        if sxx == 0.0 {
            return None;
        }

        let slope = sxy / sxx;
        let fit = Self {
            slope,
            intercept: mean_y - slope * mean_x,
        };
        (fit.slope.is_finite() && fit.intercept.is_finite()).then_some(fit)
    }

    /// Temperature for a measured value; `None` when the slope is zero.
    pub fn celsius(&self, measured: f64) -> Option<f64> {
        if self.slope == 0.0 {
            return None;
        }
        let celsius = (measured - self.intercept) / self.slope;
        celsius.is_finite().then_some(celsius)
    }
}

/// All quantities derivable from one raw sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    /// Divider voltage (resistive channels only).
    pub volts: Option<f64>,
    /// Divider resistance (resistive channels only).
    pub ohms: Option<f64>,
    /// Value the calibration fit applies to: ohms, or the probe reading in °C.
    pub measured: Option<f64>,
    /// Calibrated temperature.
    pub celsius: Option<f64>,
}

/// Run the conversion chain for `raw` as reported by `sensor`.
pub fn convert(sensor: SensorName, raw: &str, fit: Option<&LinearFit>) -> Conversion {
    let (volts, ohms, measured) = match sensor.kind() {
        SensorKind::Resistive => {
            let volts = raw_to_code(raw).map(code_to_volts);
            let ohms = volts.and_then(volts_to_ohms);
            (volts, ohms, ohms)
        }
        SensorKind::Probe => (None, None, probe_celsius(raw)),
    };
    let celsius = measured.zip(fit).and_then(|(value, fit)| fit.celsius(value));
    Conversion {
        volts,
        ohms,
        measured,
        celsius,
    }
}

/// One operator-entered reference temperature with the sample it was paired with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Reference temperature entered by the operator.
    pub celsius: f64,
    /// Ohms for resistive channels, probe °C for probes.
    pub ohms: f64,
    /// Raw token the reference was paired with.
    pub raw_adc: String,
    /// Timestamp of that sample.
    pub timestamp: DateTime<Utc>,
}

/// Calibration state of one sensor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorCalibration {
    /// Reference points in entry order.
    pub points: Vec<CalibrationPoint>,
    /// Last fit; `None` until two distinct temperatures are entered.
    pub fit: Option<LinearFit>,
}

impl SensorCalibration {
    /// Refit from the current points.
    pub fn refit(&mut self) -> Option<LinearFit> {
        let pairs: Vec<(f64, f64)> = self.points.iter().map(|p| (p.celsius, p.ohms)).collect();
        self.fit = LinearFit::from_points(&pairs);
        self.fit
    }
}

/// Record handed to the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// Module name.
    pub module: String,
    /// Sensor the record belongs to.
    pub sensor: SensorName,
    /// Fitted slope, if any.
    pub slope: Option<f64>,
    /// Fitted intercept, if any.
    pub intercept: Option<f64>,
    /// Reference points behind the fit.
    pub points: Vec<CalibrationPoint>,
}

/// Calibration records for every sensor of one module.
#[derive(Debug, Clone, Default)]
pub struct ModuleCalibration {
    sensors: BTreeMap<SensorName, SensorCalibration>,
}

impl ModuleCalibration {
    /// Empty session for `sensors`.
    pub fn new(sensors: &[SensorName]) -> Self {
        Self {
            sensors: sensors
                .iter()
                .map(|&name| (name, SensorCalibration::default()))
                .collect(),
        }
    }

    /// Calibration state of one sensor.
    pub fn sensor(&self, name: SensorName) -> Option<&SensorCalibration> {
        self.sensors.get(&name)
    }

    /// Current fit of one sensor.
    pub fn fit(&self, name: SensorName) -> Option<&LinearFit> {
        self.sensors.get(&name)?.fit.as_ref()
    }

    /// Number of reference rows entered so far.
    pub fn reference_count(&self) -> usize {
        self.sensors
            .values()
            .map(|cal| cal.points.len())
            .max()
            .unwrap_or(0)
    }

    /// Pair `celsius` with the latest sample of every sensor.
    ///
    /// Refuses the input unless every sensor has a convertible latest reading, so that all
    /// sensors keep the same number of reference rows.
    pub fn add_reference<'a, I>(&mut self, celsius: f64, latest: I) -> DaqResult<()>
    where
        I: IntoIterator<Item = (SensorName, Option<&'a Reading>)>,
    {
        if !celsius.is_finite() {
            return Err(DaqError::Calibration(format!(
                "Reference temperature {} is not a number",
                celsius
            )));
        }

        let latest: BTreeMap<SensorName, Option<&Reading>> = latest.into_iter().collect();
        let mut rows = Vec::with_capacity(self.sensors.len());
        for &name in self.sensors.keys() {
            let reading = latest.get(&name).copied().flatten().ok_or_else(|| {
                DaqError::Calibration(format!("Sensor {} has no reading yet", name))
            })?;
            let measured = convert(name, &reading.raw, None).measured.ok_or_else(|| {
                DaqError::Calibration(format!(
                    "Latest reading '{}' of sensor {} cannot be converted",
                    reading.raw, name
                ))
            })?;
            rows.push((
                name,
                CalibrationPoint {
                    celsius,
                    ohms: measured,
                    raw_adc: reading.raw.clone(),
                    timestamp: reading.timestamp,
                },
            ));
        }

        for (name, point) in rows {
            if let Some(cal) = self.sensors.get_mut(&name) {
                cal.points.push(point);
            }
        }
        debug!(celsius, rows = self.reference_count(), "Added calibration reference");
        Ok(())
    }

    /// Delete reference row `index` from every sensor.
    pub fn remove_reference(&mut self, index: usize) -> DaqResult<()> {
        if index >= self.reference_count() {
            return Err(DaqError::Calibration(format!(
                "No calibration reference at row {}",
                index
            )));
        }
        for cal in self.sensors.values_mut() {
            if index < cal.points.len() {
                cal.points.remove(index);
            }
        }
        Ok(())
    }

    /// Recompute every sensor's fit from its reference rows.
    pub fn fit_all(&mut self) -> BTreeMap<SensorName, Option<LinearFit>> {
        let fits: BTreeMap<_, _> = self
            .sensors
            .iter_mut()
            .map(|(&name, cal)| (name, cal.refit()))
            .collect();
        info!(
            fitted = fits.values().filter(|f| f.is_some()).count(),
            total = fits.len(),
            "Recomputed calibration fits"
        );
        fits
    }

    /// Install a fit loaded from persistence.
    pub fn set_fit(&mut self, name: SensorName, fit: LinearFit) -> DaqResult<()> {
        let cal = self.sensors.get_mut(&name).ok_or_else(|| {
            DaqError::Configuration(format!("Sensor {} is not enabled on this module", name))
        })?;
        cal.fit = Some(fit);
        Ok(())
    }

    /// One record per sensor, tagged with `module`.
    pub fn records(&self, module: &str) -> Vec<CalibrationRecord> {
        self.sensors
            .iter()
            .map(|(&sensor, cal)| CalibrationRecord {
                module: module.to_string(),
                sensor,
                slope: cal.fit.map(|f| f.slope),
                intercept: cal.fit.map(|f| f.intercept),
                points: cal.points.clone(),
            })
            .collect()
    }

    /// JSON export of [`ModuleCalibration::records`].
    pub fn to_json(&self, module: &str) -> DaqResult<String> {
        serde_json::to_string_pretty(&self.records(module))
            .map_err(|e| DaqError::Calibration(format!("Failed to serialize calibration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const EPS: f64 = 1e-9;

    fn reading(raw: &str) -> Reading {
        Reading {
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            raw: raw.to_string(),
        }
    }

    #[test]
    fn test_resistive_chain_is_deterministic() {
        assert_eq!(raw_to_code("72a4ff"), Some(0x72a4));
        let c = convert(SensorName::E1, "72a4ff", None);
        assert!((c.volts.unwrap() - 2.2328125).abs() < EPS);
        assert!((c.ohms.unwrap() - 806.888_763_410_502_6).abs() < 1e-6);
        assert_eq!(c.measured, c.ohms);
        assert_eq!(c.celsius, None);
    }

    #[test]
    fn test_status_byte_is_dropped_whatever_its_value() {
        assert_eq!(raw_to_code("72a4fe"), Some(0x72a4));
        assert_eq!(raw_to_code("72a400"), Some(0x72a4));
        assert_eq!(raw_to_code("72a4"), Some(0x72));
        let c = convert(SensorName::E1, "72a4fe", None);
        assert!((c.volts.unwrap() - 2.2328125).abs() < EPS);
        assert_eq!(c.ohms, convert(SensorName::E1, "72a4ff", None).ohms);
    }

    #[test]
    fn test_mid_scale_is_reference_resistance() {
        let c = convert(SensorName::L2, "8000ff", None);
        assert!((c.volts.unwrap() - 2.5).abs() < EPS);
        assert!((c.ohms.unwrap() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_supply_voltage_is_undefined() {
        assert_eq!(code_to_volts(0xfd00), 5.0);
        assert_eq!(volts_to_ohms(5.0), None);
        let c = convert(SensorName::E2, "fd00ff", None);
        assert_eq!(c.volts, Some(5.0));
        assert_eq!(c.ohms, None);
        assert_eq!(c.celsius, None);
    }

    #[test]
    fn test_bad_raw_tokens() {
        assert_eq!(raw_to_code("ff"), None);
        assert_eq!(raw_to_code("f"), None);
        assert_eq!(raw_to_code("zzzzff"), None);
        assert_eq!(convert(SensorName::E1, "garbage", None), Conversion::default());
    }

    #[test]
    fn test_probe_conversion() {
        assert_eq!(probe_celsius("0xc80"), Some(25.0));
        assert_eq!(probe_celsius("0c80"), Some(25.0));
        assert_eq!(probe_celsius("0c80ff"), Some(25.0));
        // Negative temperatures are sign-extended from bit 12
        assert_eq!(probe_celsius("fe70"), Some(-3.125));
        assert_eq!(probe_celsius("0x"), None);

        let c = convert(SensorName::P1, "0xc80", None);
        assert_eq!(c.volts, None);
        assert_eq!(c.ohms, None);
        assert_eq!(c.measured, Some(25.0));
    }

    #[test]
    fn test_linear_fit() {
        let fit = LinearFit::from_points(&[(0.0, 1000.0), (10.0, 1039.0), (20.0, 1078.0)]).unwrap();
        assert!((fit.slope - 3.9).abs() < EPS);
        assert!((fit.intercept - 1000.0).abs() < EPS);
        assert!((fit.celsius(1019.5).unwrap() - 5.0).abs() < EPS);
    }

    #[test]
    fn test_fit_needs_two_distinct_points() {
        assert_eq!(LinearFit::from_points(&[]), None);
        assert_eq!(LinearFit::from_points(&[(20.0, 1078.0)]), None);
        assert_eq!(LinearFit::from_points(&[(20.0, 1078.0), (20.0, 1080.0)]), None);
    }

    #[test]
    fn test_zero_slope_is_undefined() {
        assert_eq!(LinearFit::new(0.0, 800.0).celsius(806.0), None);
    }

    #[test]
    fn test_calibration_round_trip() {
        // Reference point captured exactly at 72a4ff reproduces its temperature
        let ohms = convert(SensorName::E1, "72a4ff", None).ohms.unwrap();
        let fit = LinearFit::from_points(&[(21.5, ohms), (40.0, ohms + 72.15)]).unwrap();
        let c = convert(SensorName::E1, "72a4ff", Some(&fit));
        assert!((c.celsius.unwrap() - 21.5).abs() < 1e-9);
    }

    #[test]
    fn test_module_calibration_session() {
        let mut cal = ModuleCalibration::new(&[SensorName::E1, SensorName::P1]);
        let e1 = reading("72a4ff");
        let p1 = reading("0xc80");

        // A sensor without data blocks the reference
        let err = cal
            .add_reference(20.0, vec![(SensorName::E1, Some(&e1)), (SensorName::P1, None)])
            .unwrap_err();
        assert!(matches!(err, DaqError::Calibration(_)));
        assert_eq!(cal.reference_count(), 0);

        cal.add_reference(20.0, vec![(SensorName::E1, Some(&e1)), (SensorName::P1, Some(&p1))])
            .unwrap();
        assert_eq!(cal.reference_count(), 1);

        // One point is not enough for a fit
        let fits = cal.fit_all();
        assert_eq!(fits[&SensorName::E1], None);

        // Unconvertible latest sample is refused as well
        let bad = reading("fd00ff");
        assert!(cal
            .add_reference(50.0, vec![(SensorName::E1, Some(&bad)), (SensorName::P1, Some(&p1))])
            .is_err());
        assert_eq!(cal.reference_count(), 1);

        let e1_hot = reading("7400ff");
        let p1_hot = reading("0x1900");
        cal.add_reference(
            50.0,
            vec![(SensorName::E1, Some(&e1_hot)), (SensorName::P1, Some(&p1_hot))],
        )
        .unwrap();

        let fits = cal.fit_all();
        assert!(fits[&SensorName::E1].is_some());
        // Probe 0x1900 reads 50 °C, so a reference at 20 °C / 50 °C has slope 25/30
        let p1_fit = fits[&SensorName::P1].unwrap();
        assert!((p1_fit.slope - 25.0 / 30.0).abs() < EPS);
        assert!((p1_fit.celsius(25.0).unwrap() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_remove_reference_and_records() {
        let mut cal = ModuleCalibration::new(&[SensorName::E1]);
        let cold = reading("72a4ff");
        let hot = reading("7400ff");
        cal.add_reference(20.0, vec![(SensorName::E1, Some(&cold))]).unwrap();
        cal.add_reference(30.0, vec![(SensorName::E1, Some(&hot))]).unwrap();
        cal.add_reference(99.0, vec![(SensorName::E1, Some(&hot))]).unwrap();
        cal.remove_reference(2).unwrap();
        assert!(cal.remove_reference(5).is_err());

        cal.fit_all();
        let fit = cal.fit(SensorName::E1).copied().unwrap();
        let back = fit.celsius(convert(SensorName::E1, "72a4ff", None).ohms.unwrap()).unwrap();
        assert!((back - 20.0).abs() < 1e-9);

        let records = cal.records("TM0");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].module, "TM0");
        assert_eq!(records[0].points.len(), 2);
        assert_eq!(records[0].slope, Some(fit.slope));

        let json = cal.to_json("TM0").unwrap();
        assert!(json.contains("\"sensor\": \"E1\""));
    }
}
