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

//! In-flight bolus bookkeeping.
//!
//! An [`UnfinalizedDose`] and its progress reporter exist only while a bolus
//! is live; both are torn down the moment the state machine returns to
//! `NoBolus`, regardless of how the bolus ended.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::pump::state::{BolusSpeed, InsulinType};

/// Added to the estimated duration before the deferred completion fires.
/// The link does not push bolus completion events, so the machine
/// self-finalizes shortly after the dose should have finished.
pub const COMPLETION_MARGIN: Duration = Duration::from_millis(500);

/// How a bolus was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BolusActivationType {
    Manual,
    Automatic,
}

/// Expected wall-clock time to deliver `units` at the configured speed.
pub fn estimated_duration(units: f64, speed: BolusSpeed) -> Duration {
    Duration::from_secs_f64(units * speed.seconds_per_unit() as f64)
}

/// A bolus the pump has been asked to deliver but which has not finalized.
#[derive(Debug, Clone)]
pub struct UnfinalizedDose {
    pub units: f64,
    pub duration: Duration,
    pub activation: BolusActivationType,
    pub insulin_type: InsulinType,
    pub delivered_units: f64,
    pub started_at: DateTime<Utc>,
}

impl UnfinalizedDose {
    pub fn new(
        units: f64,
        speed: BolusSpeed,
        activation: BolusActivationType,
        insulin_type: InsulinType,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            units,
            duration: estimated_duration(units, speed),
            activation,
            insulin_type,
            delivered_units: 0.0,
            started_at,
        }
    }
}

/// Progress callback: `(delivered_units, total_units)`.
pub type ProgressObserver = Arc<dyn Fn(f64, f64) + Send + Sync>;

/// Forwards delivery progress to an optional observer.
pub struct DoseProgressReporter {
    total_units: f64,
    delivered_units: f64,
    observer: Option<ProgressObserver>,
}

impl DoseProgressReporter {
    pub fn new(total_units: f64, observer: Option<ProgressObserver>) -> Self {
        Self {
            total_units,
            delivered_units: 0.0,
            observer,
        }
    }

    /// Record progress and forward it; delivered units never exceed the
    /// requested total.
    pub fn report(&mut self, delivered_units: f64) {
        self.delivered_units = delivered_units.min(self.total_units);
        if let Some(observer) = &self.observer {
            observer(self.delivered_units, self.total_units);
        }
    }

    pub fn delivered_units(&self) -> f64 {
        self.delivered_units
    }

    pub fn total_units(&self) -> f64 {
        self.total_units
    }
}

/// Everything tied to the bolus currently in flight.
pub struct ActiveBolus {
    pub dose: UnfinalizedDose,
    pub reporter: DoseProgressReporter,
    /// Deferred self-finalization task, armed once the pump accepts the
    /// start packet.
    pub completion: Option<JoinHandle<()>>,
}

impl ActiveBolus {
    pub fn new(dose: UnfinalizedDose, reporter: DoseProgressReporter) -> Self {
        Self {
            dose,
            reporter,
            completion: None,
        }
    }

    /// Disarm the deferred completion so it cannot double-finalize.
    pub fn abort_completion(&mut self) {
        if let Some(handle) = self.completion.take() {
            handle.abort();
        }
    }
}
