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

//! Pump state model.
//!
//! [`PumpState`] is the single persisted record of what the pump is doing;
//! [`PumpStatus`] is the externally visible snapshot derived from it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of hourly entries in a basal schedule.
pub const SCHEDULE_ENTRIES: usize = 24;

/// The pump's current basal delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BasalDeliveryOrdinal {
    Active,
    TempBasal,
    Suspended,
}

impl BasalDeliveryOrdinal {
    pub fn as_str(&self) -> &'static str {
        match self {
            BasalDeliveryOrdinal::Active => "active",
            BasalDeliveryOrdinal::TempBasal => "temp basal",
            BasalDeliveryOrdinal::Suspended => "suspended",
        }
    }
}

/// Bolus delivery state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BolusState {
    NoBolus,
    Initiating,
    InProgress,
    Canceling,
}

impl BolusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BolusState::NoBolus => "idle",
            BolusState::Initiating => "initiating",
            BolusState::InProgress => "in progress",
            BolusState::Canceling => "canceling",
        }
    }
}

/// Configured bolus delivery speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BolusSpeed {
    /// 12 seconds per unit.
    Speed12,
    /// 30 seconds per unit.
    Speed30,
    /// 60 seconds per unit.
    Speed60,
}

impl BolusSpeed {
    pub fn seconds_per_unit(&self) -> u64 {
        match self {
            BolusSpeed::Speed12 => 12,
            BolusSpeed::Speed30 => 30,
            BolusSpeed::Speed60 => 60,
        }
    }
}

/// Insulin loaded in the reservoir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsulinType {
    Novolog,
    Humalog,
    Apidra,
    Fiasp,
    Lyumjev,
}

impl InsulinType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsulinType::Novolog => "Novolog",
            InsulinType::Humalog => "Humalog",
            InsulinType::Apidra => "Apidra",
            InsulinType::Fiasp => "Fiasp",
            InsulinType::Lyumjev => "Lyumjev",
        }
    }
}

/// 24 hourly basal rates (units/hour), indexed by hour of day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasalSchedule {
    rates: Vec<f64>,
}

impl BasalSchedule {
    pub fn new(rates: Vec<f64>) -> Self {
        Self { rates }
    }

    /// A schedule is usable only with exactly one rate per hour.
    pub fn is_valid(&self) -> bool {
        self.rates.len() == SCHEDULE_ENTRIES
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn rate_at_hour(&self, hour: usize) -> Option<f64> {
        self.rates.get(hour).copied()
    }
}

impl Default for BasalSchedule {
    fn default() -> Self {
        Self {
            rates: vec![0.0; SCHEDULE_ENTRIES],
        }
    }
}

/// Persisted pump state, owned by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpState {
    pub basal_schedule: BasalSchedule,
    pub basal_profile_number: u8,
    pub basal_delivery_ordinal: BasalDeliveryOrdinal,
    pub basal_delivery_date: DateTime<Utc>,
    /// Set iff `basal_delivery_ordinal` is `TempBasal`; cleared together
    /// with `temp_basal_duration`.
    pub temp_basal_units: Option<f64>,
    pub temp_basal_duration: Option<Duration>,
    pub is_pump_suspended: bool,
    pub bolus_state: BolusState,
    /// Stored device identifier; absence means the pump was never paired.
    pub ble_identifier: Option<String>,
    /// Last successful full-status synchronization time.
    pub last_status_date: DateTime<Utc>,
    pub reservoir_level: f64,
    pub battery_remaining: u8,
    pub insulin_type: Option<InsulinType>,
    pub bolus_speed: BolusSpeed,
}

impl PumpState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            basal_schedule: BasalSchedule::default(),
            basal_profile_number: 0,
            basal_delivery_ordinal: BasalDeliveryOrdinal::Active,
            basal_delivery_date: now,
            temp_basal_units: None,
            temp_basal_duration: None,
            is_pump_suspended: false,
            bolus_state: BolusState::NoBolus,
            ble_identifier: None,
            last_status_date: now,
            reservoir_level: 0.0,
            battery_remaining: 0,
            insulin_type: None,
            bolus_speed: BolusSpeed::Speed12,
        }
    }

    /// Transition the basal delivery ordinal, stamping the transition time
    /// and clearing the temp basal fields unless the new mode is `TempBasal`.
    pub fn set_ordinal(&mut self, ordinal: BasalDeliveryOrdinal, at: DateTime<Utc>) {
        self.basal_delivery_ordinal = ordinal;
        self.basal_delivery_date = at;
        if ordinal != BasalDeliveryOrdinal::TempBasal {
            self.temp_basal_units = None;
            self.temp_basal_duration = None;
        }
    }

    /// Record an activated temp basal: ordinal, units and duration together.
    pub fn set_temp_basal(&mut self, units: f64, duration: Duration, at: DateTime<Utc>) {
        self.basal_delivery_ordinal = BasalDeliveryOrdinal::TempBasal;
        self.basal_delivery_date = at;
        self.temp_basal_units = Some(units);
        self.temp_basal_duration = Some(duration);
    }

    /// End time of the running temp basal, when one is active.
    pub fn temp_basal_end_date(&self) -> Option<DateTime<Utc>> {
        if self.basal_delivery_ordinal != BasalDeliveryOrdinal::TempBasal {
            return None;
        }
        let duration = self.temp_basal_duration?;
        Some(self.basal_delivery_date + chrono::Duration::from_std(duration).ok()?)
    }

    /// Compute the externally visible snapshot.
    ///
    /// Folds in the lazy expiry check: a temp basal whose end time has
    /// passed silently reverts the ordinal to `Active` first.
    pub fn status_snapshot(&mut self, now: DateTime<Utc>) -> PumpStatus {
        if let Some(end) = self.temp_basal_end_date() {
            if end <= now {
                self.set_ordinal(BasalDeliveryOrdinal::Active, now);
            }
        }
        PumpStatus {
            timestamp: now,
            basal_delivery: self.basal_delivery_ordinal,
            temp_basal_units: self.temp_basal_units,
            temp_basal_end: self.temp_basal_end_date(),
            bolus_state: self.bolus_state,
            reservoir_level: self.reservoir_level,
            battery_remaining: self.battery_remaining,
            is_suspended: self.is_pump_suspended,
        }
    }
}

/// Externally visible pump status snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpStatus {
    pub timestamp: DateTime<Utc>,
    pub basal_delivery: BasalDeliveryOrdinal,
    pub temp_basal_units: Option<f64>,
    pub temp_basal_end: Option<DateTime<Utc>>,
    pub bolus_state: BolusState,
    pub reservoir_level: f64,
    pub battery_remaining: u8,
    pub is_suspended: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, min, 0).unwrap()
    }

    #[test]
    fn test_ordinal_transition_stamps_date_and_clears_temp_fields() {
        let mut state = PumpState::new(at(8, 0));
        state.set_temp_basal(1.5, Duration::from_secs(1800), at(9, 0));
        assert_eq!(
            state.basal_delivery_ordinal,
            BasalDeliveryOrdinal::TempBasal
        );
        assert_eq!(state.basal_delivery_date, at(9, 0));
        assert!(state.temp_basal_units.is_some());
        assert!(state.temp_basal_duration.is_some());

        state.set_ordinal(BasalDeliveryOrdinal::Active, at(9, 10));
        assert_eq!(state.basal_delivery_date, at(9, 10));
        assert!(state.temp_basal_units.is_none());
        assert!(state.temp_basal_duration.is_none());
    }

    #[test]
    fn test_temp_basal_end_date() {
        let mut state = PumpState::new(at(8, 0));
        assert_eq!(state.temp_basal_end_date(), None);

        state.set_temp_basal(2.0, Duration::from_secs(900), at(9, 0));
        assert_eq!(state.temp_basal_end_date(), Some(at(9, 15)));
    }

    #[test]
    fn test_snapshot_reverts_expired_temp_basal() {
        let mut state = PumpState::new(at(8, 0));
        state.set_temp_basal(2.0, Duration::from_secs(900), at(9, 0));

        let running = state.status_snapshot(at(9, 10));
        assert_eq!(running.basal_delivery, BasalDeliveryOrdinal::TempBasal);
        assert_eq!(running.temp_basal_units, Some(2.0));

        let expired = state.status_snapshot(at(9, 20));
        assert_eq!(expired.basal_delivery, BasalDeliveryOrdinal::Active);
        assert_eq!(expired.temp_basal_units, None);
        assert_eq!(
            state.basal_delivery_ordinal,
            BasalDeliveryOrdinal::Active
        );
    }

    #[test]
    fn test_schedule_validity() {
        assert!(BasalSchedule::default().is_valid());
        assert!(!BasalSchedule::new(vec![1.0; 12]).is_valid());
        assert_eq!(BasalSchedule::new(vec![0.5; 24]).rate_at_hour(23), Some(0.5));
        assert_eq!(BasalSchedule::new(vec![0.5; 24]).rate_at_hour(24), None);
    }
}
