// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Domain events produced for the consuming dosing system.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A delivered or scheduled dose described by an event.
#[derive(Debug, Clone, PartialEq)]
pub struct DoseEntry {
    pub units: f64,
    pub duration: Option<Duration>,
    pub automatic: bool,
}

/// Decoded pump alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    LowBattery,
    Occlusion,
    LowReservoir,
    BloodSugarCheck,
    Shutdown,
    Unknown(u8),
}

impl AlarmKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x42 => AlarmKind::LowBattery,
            0x4f => AlarmKind::Occlusion,
            0x52 => AlarmKind::LowReservoir,
            0x43 => AlarmKind::BloodSugarCheck,
            0x53 => AlarmKind::Shutdown,
            other => AlarmKind::Unknown(other),
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmKind::LowBattery => write!(f, "battery low"),
            AlarmKind::Occlusion => write!(f, "occlusion detected"),
            AlarmKind::LowReservoir => write!(f, "reservoir low"),
            AlarmKind::BloodSugarCheck => write!(f, "blood sugar check requested"),
            AlarmKind::Shutdown => write!(f, "pump shutdown"),
            AlarmKind::Unknown(code) => write!(f, "unknown alarm 0x{code:02x}"),
        }
    }
}

/// Normalized pump event.
#[derive(Debug, Clone, PartialEq)]
pub enum PumpEventKind {
    Bolus(DoseEntry),
    Basal { rate: f64 },
    TempBasal { units: f64, duration: Duration },
    Suspend,
    Resume,
    Prime { units: Option<f64> },
    Rewind,
    Alarm(AlarmKind),
}

impl PumpEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PumpEventKind::Bolus(_) => "bolus",
            PumpEventKind::Basal { .. } => "basal",
            PumpEventKind::TempBasal { .. } => "temp basal",
            PumpEventKind::Suspend => "suspend",
            PumpEventKind::Resume => "resume",
            PumpEventKind::Prime { .. } => "prime",
            PumpEventKind::Rewind => "rewind",
            PumpEventKind::Alarm(_) => "alarm",
        }
    }
}

/// A timestamped domain event with its raw device bytes for traceability.
///
/// Ownership passes to the delegate; events are never persisted here.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: PumpEventKind,
    pub raw: Vec<u8>,
}

impl PumpEvent {
    pub fn new(timestamp: DateTime<Utc>, kind: PumpEventKind, raw: Vec<u8>) -> Self {
        Self {
            timestamp,
            kind,
            raw,
        }
    }
}

/// Alert raised towards the delegate.
#[derive(Debug, Clone, PartialEq)]
pub enum PumpAlert {
    LowReservoir { units: f64 },
    LowBattery { percent: u8 },
    PumpAlarm(AlarmKind),
}
