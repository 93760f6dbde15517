//! Per-channel measurement state machine.
//!
//! A [`Sensor`] is either idle or waiting for exactly one response. Inbound lines are offered to
//! every sensor of a module; each sensor decides for itself whether the line answers its request.
//!
//! The serial link occasionally delivers one response in two pieces:
//!
//! ```text
//! < meas
//! < ure 1 72a4ff
//! ```
//!
//! To recover, a sensor remembers the most recent line it was offered and tries the
//! concatenation of that fragment with the next line before falling back to the line alone.
//! Only a single split is recoverable. The buffer is one line per sensor.

use crate::firmware::{FrameSpec, SensorName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Value the ADC reports on a known transient glitch.
pub const ZERO_SENTINEL: &str = "0";

/// One accepted raw sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    /// Arrival time.
    pub timestamp: DateTime<Utc>,
    /// Value token as received.
    pub raw: String,
}

/// Result of offering one line to a sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The line answered the outstanding request and a sample was stored.
    Accepted(Reading),
    /// The line answered the outstanding request with the zero sentinel; no sample stored.
    ZeroDiscarded,
    /// The line matched this sensor's frame but no request was outstanding.
    Unsolicited,
    /// The line is not addressed to this sensor (or is noise).
    Mismatch,
}

impl DecodeOutcome {
    /// Whether the line cleared this sensor's pending flag.
    pub fn cleared_pending(&self) -> bool {
        matches!(self, DecodeOutcome::Accepted(_) | DecodeOutcome::ZeroDiscarded)
    }
}

/// Request state and sample history of one channel.
#[derive(Debug, Clone)]
pub struct Sensor {
    name: SensorName,
    frame: FrameSpec,
    pending: bool,
    last_fragment: String,
    readings: Vec<Reading>,
}

impl Sensor {
    /// Idle sensor expecting frames shaped like `frame`.
    pub fn new(name: SensorName, frame: FrameSpec) -> Self {
        Self {
            name,
            frame,
            pending: false,
            last_fragment: String::new(),
            readings: Vec::new(),
        }
    }

    /// Channel name.
    pub fn name(&self) -> SensorName {
        self.name
    }

    /// Expected response frame.
    pub fn frame(&self) -> &FrameSpec {
        &self.frame
    }

    /// Whether a request is unanswered.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Mark a request as outstanding. Called by the module when its command is sent.
    pub fn mark_pending(&mut self) {
        self.pending = true;
    }

    /// Drop the outstanding request without a response (operator reset).
    pub fn clear_pending(&mut self) {
        self.pending = false;
    }

    /// Accepted samples in arrival order.
    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<&Reading> {
        self.readings.last()
    }

    /// Line kept for joining a split frame.
    pub fn last_fragment(&self) -> &str {
        &self.last_fragment
    }

    /// Offer one inbound line (without its terminator) to this sensor.
    pub fn try_decode(&mut self, line: &str, now: DateTime<Utc>) -> DecodeOutcome {
        let token = self.frame.token.as_str();
        let frame_len = self.frame.frame_len();

        let merged = format!("{}{}", self.last_fragment, line);
        let was_split = merged.matches(token).count() == 1
            && merged.starts_with(token)
            && merged.len() == frame_len;
        let candidate = if was_split { merged } else { line.to_string() };

        let value = if candidate.contains(token) && candidate.len() == frame_len {
            candidate.split_whitespace().last().map(str::to_string)
        } else if is_zero_frame(&candidate, token) {
            Some(ZERO_SENTINEL.to_string())
        } else {
            None
        };

        let outcome = match value {
            None => DecodeOutcome::Mismatch,
            Some(_) if !self.pending => {
                trace!(sensor = %self.name, line = %candidate, "Ignoring unsolicited frame");
                DecodeOutcome::Unsolicited
            }
            Some(value) => {
                self.pending = false;
                if value == ZERO_SENTINEL {
                    trace!(sensor = %self.name, "Discarding zero reading");
                    DecodeOutcome::ZeroDiscarded
                } else {
                    let reading = Reading {
                        timestamp: now,
                        raw: value,
                    };
                    self.readings.push(reading.clone());
                    DecodeOutcome::Accepted(reading)
                }
            }
        };

        self.last_fragment = candidate;
        outcome
    }
}

/// The firmware prints a zero reading unpadded, e.g. `measure 1 0`.
fn is_zero_frame(candidate: &str, token: &str) -> bool {
    candidate
        .strip_prefix(token)
        .and_then(|rest| rest.strip_prefix(' '))
        .is_some_and(|value| value == ZERO_SENTINEL)
}
