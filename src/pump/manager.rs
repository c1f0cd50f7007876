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

//! Pump manager: the serialized command queue and the only writer of
//! [`PumpState`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::bolus::{
    ActiveBolus, BolusActivationType, DoseProgressReporter, ProgressObserver, UnfinalizedDose,
    COMPLETION_MARGIN,
};
use super::dispatcher::CommandDispatcher;
use super::events::{DoseEntry, PumpAlert, PumpEvent, PumpEventKind};
use super::state::{
    BasalDeliveryOrdinal, BasalSchedule, BolusSpeed, BolusState, InsulinType, PumpState,
    PumpStatus,
};
use super::{history, temp_basal};
use crate::clock::Clock;
use crate::error::PumpError;
use crate::observer::{EventPublisher, ObserverToken, PumpDelegate, StateCallback, StatusCallback};
use crate::storage::PumpStateStore;
use crate::transport::{PumpPacket, PumpTransport, ResponseData, StatusReading};

use chrono::Timelike;

/// Reservoir level below which an alert is raised, in units.
const LOW_RESERVOIR_UNITS: f64 = 20.0;
/// Battery level below which an alert is raised, in percent.
const LOW_BATTERY_PERCENT: u8 = 25;
/// Device clock drift tolerated before an adjustment is pushed.
const MAX_CLOCK_DRIFT_SECS: i64 = 60;

/// Orchestrates insulin delivery commands against a single pump.
///
/// All pump-affecting operations are serialized by a fair async mutex; at
/// most one holds the transport link at a time. State mutations happen only
/// on that queue or on paths invoked from it, and every mutation is
/// persisted and published immediately.
pub struct PumpManager {
    state: RwLock<PumpState>,
    retained_status: Mutex<PumpStatus>,
    active_bolus: Mutex<Option<ActiveBolus>>,
    progress_observer: Mutex<Option<ProgressObserver>>,
    command_queue: AsyncMutex<CommandDispatcher>,
    publisher: EventPublisher,
    store: PumpStateStore,
    clock: Arc<dyn Clock>,
}

impl PumpManager {
    /// Build the manager from persisted state, or a fresh one on first run.
    ///
    /// Must be called within a tokio runtime; the notification dispatcher
    /// task is spawned here.
    pub fn new(
        transport: Arc<dyn PumpTransport>,
        store: PumpStateStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, PumpError> {
        let now = clock.now();
        let mut state = store.load()?.unwrap_or_else(|| PumpState::new(now));

        // A dose never survives a restart; a non-idle persisted bolus state
        // would violate the dose-tracking invariant.
        if state.bolus_state != BolusState::NoBolus {
            warn!(
                "resetting persisted bolus state ({})",
                state.bolus_state.as_str()
            );
            state.bolus_state = BolusState::NoBolus;
        }

        let retained_status = state.status_snapshot(now);

        Ok(Arc::new(Self {
            state: RwLock::new(state),
            retained_status: Mutex::new(retained_status),
            active_bolus: Mutex::new(None),
            progress_observer: Mutex::new(None),
            command_queue: AsyncMutex::new(CommandDispatcher::new(transport)),
            publisher: EventPublisher::new(),
            store,
            clock,
        }))
    }


    pub fn set_delegate(&self, delegate: Arc<dyn PumpDelegate>) {
        self.publisher.set_delegate(delegate);
    }

    pub fn register_state_observer(&self, callback: StateCallback) -> ObserverToken {
        self.publisher.register_state_observer(callback)
    }

    pub fn register_status_observer(&self, callback: StatusCallback) -> ObserverToken {
        self.publisher.register_status_observer(callback)
    }

    pub fn remove_observer(&self, token: ObserverToken) {
        self.publisher.remove_observer(token);
    }

    pub fn set_bolus_progress_observer(&self, observer: ProgressObserver) {
        *self.progress_observer.lock() = Some(observer);
    }

    /// Wait until all published notifications have been dispatched.
    pub async fn settle_notifications(&self) {
        self.publisher.flush().await;
    }


    /// Copy of the full internal state.
    pub fn state(&self) -> PumpState {
        self.state.read().clone()
    }

    /// Current externally visible snapshot. May be stale between mutations.
    pub fn status(&self) -> PumpStatus {
        self.state.write().status_snapshot(self.clock.now())
    }

    pub fn set_ble_identifier(&self, identifier: Option<String>) {
        self.mutate_state(|state| state.ble_identifier = identifier);
    }

    pub fn set_insulin_type(&self, insulin_type: InsulinType) {
        info!("insulin type set to {}", insulin_type.as_str());
        self.mutate_state(|state| state.insulin_type = Some(insulin_type));
    }

    pub fn set_bolus_speed(&self, speed: BolusSpeed) {
        self.mutate_state(|state| state.bolus_speed = speed);
    }

    pub fn set_basal_schedule(
        &self,
        schedule: BasalSchedule,
        profile_number: u8,
    ) -> Result<(), PumpError> {
        if !schedule.is_valid() {
            return Err(PumpError::Configuration(format!(
                "basal schedule must have 24 entries, got {}",
                schedule.len()
            )));
        }
        self.mutate_state(|state| {
            state.basal_schedule = schedule;
            state.basal_profile_number = profile_number;
        });
        Ok(())
    }

    /// Forward a heartbeat tick to the delegate.
    pub fn heartbeat(&self) {
        self.publisher.publish_heartbeat();
    }


    /// Start a bolus of `units`.
    ///
    /// Rejected while another bolus is live or the pump is suspended. On
    /// any failure after dispatch the dose is deemed not started and an
    /// uncertain-delivery error is surfaced.
    pub async fn deliver_bolus(
        self: &Arc<Self>,
        units: f64,
        activation: BolusActivationType,
    ) -> Result<(), PumpError> {
        let mut queue = self.command_queue.lock().await;

        if units <= 0.0 {
            return Err(PumpError::Configuration(format!(
                "bolus of {units} units is not deliverable"
            )));
        }

        let (speed, insulin_type, identifier) = {
            let state = self.state.read();
            if state.bolus_state != BolusState::NoBolus {
                return Err(PumpError::DeviceState(format!(
                    "a bolus is already {}",
                    state.bolus_state.as_str()
                )));
            }
            if state.is_pump_suspended {
                return Err(PumpError::DeviceState("pump is suspended".into()));
            }
            let insulin_type = state.insulin_type.ok_or_else(|| {
                PumpError::Configuration("insulin type must be set before dosing".into())
            })?;
            (state.bolus_speed, insulin_type, state.ble_identifier.clone())
        };

        let now = self.clock.now();
        let dose = UnfinalizedDose::new(units, speed, activation, insulin_type, now);
        let estimated = dose.duration;
        let reporter = DoseProgressReporter::new(units, self.progress_observer.lock().clone());
        *self.active_bolus.lock() = Some(ActiveBolus::new(dose, reporter));
        self.mutate_state(|state| state.bolus_state = BolusState::Initiating);

        let start = PumpPacket::BolusStart { units, speed };
        match queue.execute(identifier.as_deref(), &[start], None).await {
            Ok(_) => {
                let now = self.clock.now();
                self.mutate_state(|state| {
                    state.bolus_state = BolusState::InProgress;
                    state.last_status_date = now;
                });
                info!(
                    "bolus of {units} U accepted, estimated duration {}s",
                    estimated.as_secs()
                );
                self.arm_deferred_completion(estimated + COMPLETION_MARGIN);
                Ok(())
            }
            Err(err) => {
                *self.active_bolus.lock() = None;
                self.mutate_state(|state| state.bolus_state = BolusState::NoBolus);
                Err(match err {
                    PumpError::Connection(reason) => PumpError::Connection(reason),
                    other => PumpError::UncertainDelivery(format!(
                        "bolus start unacknowledged: {other}"
                    )),
                })
            }
        }
    }

    /// Stop the bolus currently being delivered.
    pub async fn cancel_bolus(&self) -> Result<(), PumpError> {
        let mut queue = self.command_queue.lock().await;
        let identifier = self.stored_identifier();
        let prior = self.state.read().bolus_state;

        self.mutate_state(|state| state.bolus_state = BolusState::Canceling);

        match queue
            .execute(identifier.as_deref(), &[PumpPacket::BolusStop], None)
            .await
        {
            Ok(_) => {
                if let Some(mut active) = self.active_bolus.lock().take() {
                    active.abort_completion();
                }
                let now = self.clock.now();
                // Advancing the status date keeps the next history sync from
                // re-adding this bolus as a duplicate event.
                self.mutate_state(|state| {
                    state.bolus_state = BolusState::NoBolus;
                    state.last_status_date = now;
                });
                info!("bolus canceled");
                Ok(())
            }
            Err(err) => {
                self.mutate_state(|state| state.bolus_state = prior);
                Err(match err {
                    PumpError::Connection(reason) => PumpError::Connection(reason),
                    other => {
                        PumpError::Communication(format!("bolus cancel failed: {other}"))
                    }
                })
            }
        }
    }

    /// Record delivery progress reported by the device.
    pub fn note_bolus_progress(&self, delivered_units: f64) {
        let mut guard = self.active_bolus.lock();
        if let Some(active) = guard.as_mut() {
            active.dose.delivered_units = delivered_units.min(active.dose.units);
            active.reporter.report(delivered_units);
        }
    }

    /// The device reported the bolus ended outside an explicit cancel.
    ///
    /// Finalizes with the delivered snapshot; a no-op when no dose is
    /// tracked.
    pub fn note_bolus_terminated(&self, delivered_units: Option<f64>) {
        self.finalize_bolus(delivered_units);
    }

    fn arm_deferred_completion(self: &Arc<Self>, wait: Duration) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            debug!("bolus estimated duration elapsed without explicit completion");
            manager.finalize_bolus(None);
        });
        if let Some(active) = self.active_bolus.lock().as_mut() {
            active.completion = Some(handle);
        }
    }

    fn finalize_bolus(&self, delivered_units: Option<f64>) {
        let Some(mut active) = self.active_bolus.lock().take() else {
            return;
        };
        active.abort_completion();

        let reported = active.dose.delivered_units;
        let delivered = delivered_units.unwrap_or(if reported > 0.0 {
            reported
        } else {
            active.dose.units
        });
        let event = PumpEvent::new(
            active.dose.started_at,
            PumpEventKind::Bolus(DoseEntry {
                units: delivered,
                duration: Some(active.dose.duration),
                automatic: active.dose.activation == BolusActivationType::Automatic,
            }),
            Vec::new(),
        );

        self.mutate_state(|state| state.bolus_state = BolusState::NoBolus);
        self.publisher.publish_events(vec![event], self.clock.now());
    }


    /// Run a temporary basal of `rate` units/hour for `duration`.
    ///
    /// A zero duration cancels any running temp basal. A successful
    /// on-device cancel is not rolled back if the subsequent set fails;
    /// state then lags the device until the next status sync.
    pub async fn set_temp_basal(
        &self,
        rate: f64,
        duration: Duration,
    ) -> Result<(), PumpError> {
        let mut queue = self.command_queue.lock().await;

        let (schedule, identifier, temp_active) = {
            let state = self.state.read();
            (
                state.basal_schedule.clone(),
                state.ble_identifier.clone(),
                state.basal_delivery_ordinal == BasalDeliveryOrdinal::TempBasal,
            )
        };

        let hour = self.clock.now().hour() as usize;
        let percent = temp_basal::percentage_for(rate, &schedule, hour)?;
        let span = temp_basal::clamp_for_percent(temp_basal::normalize_duration(duration)?, percent);

        let mut packets = Vec::new();
        if temp_active {
            packets.push(PumpPacket::TempBasalCancel);
        }
        if let Some(packet) = span.packet(percent) {
            packets.push(packet);
        }

        if !packets.is_empty() {
            queue.execute(identifier.as_deref(), &packets, None).await?;
        }

        let now = self.clock.now();
        match span {
            temp_basal::TempBasalSpan::Zero => {
                self.mutate_state(|state| {
                    state.set_ordinal(BasalDeliveryOrdinal::Active, now)
                });
                let base_rate = schedule.rate_at_hour(hour).unwrap_or(0.0);
                info!("temp basal cleared, schedule resumes at {base_rate} U/h");
                self.publisher.publish_events(
                    vec![PumpEvent::new(
                        now,
                        PumpEventKind::Basal { rate: base_rate },
                        Vec::new(),
                    )],
                    now,
                );
            }
            span => {
                let span_duration = span.as_duration();
                self.mutate_state(|state| state.set_temp_basal(rate, span_duration, now));
                info!(
                    "temp basal of {percent}% running for {}s",
                    span_duration.as_secs()
                );
                self.publisher.publish_events(
                    vec![PumpEvent::new(
                        now,
                        PumpEventKind::TempBasal {
                            units: rate,
                            duration: span_duration,
                        },
                        Vec::new(),
                    )],
                    now,
                );
            }
        }
        Ok(())
    }

    /// Cancel any running temp basal and fall back to the schedule.
    pub async fn cancel_temp_basal(&self) -> Result<(), PumpError> {
        self.set_temp_basal(0.0, Duration::ZERO).await
    }


    pub async fn suspend_delivery(&self) -> Result<(), PumpError> {
        let mut queue = self.command_queue.lock().await;
        let identifier = self.stored_identifier();

        queue
            .execute(identifier.as_deref(), &[PumpPacket::SuspendDelivery], None)
            .await
            .map_err(Self::as_device_refusal)?;

        let now = self.clock.now();
        self.mutate_state(|state| {
            state.is_pump_suspended = true;
            state.set_ordinal(BasalDeliveryOrdinal::Suspended, now);
        });
        info!("delivery suspended");
        self.publisher.publish_events(
            vec![PumpEvent::new(now, PumpEventKind::Suspend, Vec::new())],
            now,
        );
        Ok(())
    }

    pub async fn resume_delivery(&self) -> Result<(), PumpError> {
        let mut queue = self.command_queue.lock().await;
        let identifier = self.stored_identifier();

        queue
            .execute(identifier.as_deref(), &[PumpPacket::ResumeDelivery], None)
            .await
            .map_err(Self::as_device_refusal)?;

        let now = self.clock.now();
        self.mutate_state(|state| {
            state.is_pump_suspended = false;
            state.set_ordinal(BasalDeliveryOrdinal::Active, now);
        });
        info!("delivery resumed");
        self.publisher.publish_events(
            vec![PumpEvent::new(now, PumpEventKind::Resume, Vec::new())],
            now,
        );
        Ok(())
    }


    /// Full status synchronization: read the pump status, reconcile history
    /// since the last sync, and advance the status date.
    pub async fn sync_status(&self) -> Result<(), PumpError> {
        let mut queue = self.command_queue.lock().await;
        let (identifier, since) = {
            let state = self.state.read();
            (state.ble_identifier.clone(), state.last_status_date)
        };

        let responses = queue
            .execute(identifier.as_deref(), &[PumpPacket::ReadStatus], None)
            .await?;
        let reading = responses
            .iter()
            .find_map(|response| match &response.data {
                ResponseData::Status(reading) => Some(reading.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                PumpError::Communication("status response carried no payload".into())
            })?;

        // Second link session; reconnects via the retained handle. A failure
        // here leaves the status date untouched so no partial history is
        // ever reported as complete.
        let events = history::synchronize(&mut queue, identifier.as_deref(), since).await?;

        let now = self.clock.now();
        self.apply_status_reading(&reading, now);

        for event in &events {
            if let PumpEventKind::Alarm(kind) = &event.kind {
                self.publisher.publish_alert(PumpAlert::PumpAlarm(*kind));
            }
        }
        self.publisher.publish_events(events, now);
        self.publisher.publish_reservoir(reading.reservoir_level, now);
        info!("status synchronized");
        Ok(())
    }

    /// Compare the device clock against ours and push an adjustment when
    /// the drift exceeds the tolerance.
    pub async fn sync_time(&self) -> Result<(), PumpError> {
        let mut queue = self.command_queue.lock().await;
        let identifier = self.stored_identifier();

        let responses = queue
            .execute(identifier.as_deref(), &[PumpPacket::ReadClock], None)
            .await?;
        let device_time = responses
            .iter()
            .find_map(|response| match response.data {
                ResponseData::Clock(time) => Some(time),
                _ => None,
            })
            .ok_or_else(|| {
                PumpError::Communication("clock response carried no payload".into())
            })?;

        let now = self.clock.now();
        let offset = device_time - now;
        if offset.num_seconds().abs() <= MAX_CLOCK_DRIFT_SECS {
            debug!("device clock within tolerance ({}s)", offset.num_seconds());
            return Ok(());
        }

        queue
            .execute(
                identifier.as_deref(),
                &[PumpPacket::SetClock { time: now }],
                None,
            )
            .await?;
        info!("device clock adjusted by {}s", offset.num_seconds());
        self.publisher.publish_clock_adjusted(offset);
        Ok(())
    }


    fn stored_identifier(&self) -> Option<String> {
        self.state.read().ble_identifier.clone()
    }

    fn as_device_refusal(err: PumpError) -> PumpError {
        match err {
            PumpError::Configuration(reason) => PumpError::DeviceState(reason),
            other => other,
        }
    }

    fn apply_status_reading(&self, reading: &StatusReading, now: chrono::DateTime<chrono::Utc>) {
        if reading.reservoir_level < LOW_RESERVOIR_UNITS {
            self.publisher.publish_alert(PumpAlert::LowReservoir {
                units: reading.reservoir_level,
            });
        }
        if reading.battery_remaining < LOW_BATTERY_PERCENT {
            self.publisher.publish_alert(PumpAlert::LowBattery {
                percent: reading.battery_remaining,
            });
        }
        self.mutate_state(|state| {
            state.reservoir_level = reading.reservoir_level;
            state.battery_remaining = reading.battery_remaining;
            state.is_pump_suspended = reading.is_suspended;
            state.last_status_date = now;
        });
    }

    /// Apply a mutation, persist the result and publish the change with
    /// before/after snapshots.
    fn mutate_state<F: FnOnce(&mut PumpState)>(&self, mutate: F) {
        let (snapshot, new_status) = {
            let mut state = self.state.write();
            mutate(&mut state);
            let new_status = state.status_snapshot(self.clock.now());
            (state.clone(), new_status)
        };

        let old_status = {
            let mut retained = self.retained_status.lock();
            std::mem::replace(&mut *retained, new_status.clone())
        };

        if let Err(e) = self.store.save(&snapshot) {
            error!("failed to persist pump state: {}", e);
        }
        self.publisher
            .publish_state_change(snapshot, old_status, new_status);
    }
}
