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

//! Delivery core: connection control, command dispatch, dose state
//! machines and history reconciliation.

pub mod bolus;
pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod history;
pub mod manager;
pub mod state;
pub mod temp_basal;

pub use bolus::{BolusActivationType, DoseProgressReporter, UnfinalizedDose};
pub use events::{AlarmKind, DoseEntry, PumpAlert, PumpEvent, PumpEventKind};
pub use manager::PumpManager;
pub use state::{
    BasalDeliveryOrdinal, BasalSchedule, BolusSpeed, BolusState, InsulinType, PumpState,
    PumpStatus,
};
