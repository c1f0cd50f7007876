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

//! Pumplink Desktop library.
//!
//! Orchestrates insulin delivery commands to a BLE-connected infusion
//! pump: connection sequencing, serialized command dispatch, bolus and
//! temp basal state machines, and history-to-event reconciliation.

pub mod clock;
pub mod config;
pub mod error;
pub mod observer;
pub mod pump;
pub mod storage;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::PumpError;
pub use observer::{ObserverToken, PumpDelegate};
pub use pump::PumpManager;
