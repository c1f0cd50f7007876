//! Integration tests for the full command orchestration flow.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use pumplink_desktop::clock::{Clock, ManualClock};
use pumplink_desktop::error::PumpError;
use pumplink_desktop::observer::PumpDelegate;
use pumplink_desktop::pump::{
    BasalDeliveryOrdinal, BasalSchedule, BolusActivationType, BolusState, InsulinType,
    PumpAlert, PumpEvent, PumpEventKind, PumpManager,
};
use pumplink_desktop::storage::PumpStateStore;
use pumplink_desktop::transport::mock::MockTransport;
use pumplink_desktop::transport::{
    CommandResponse, HistoryRecord, HistoryRecordCode, PumpPacket, ResponseData, StatusReading,
    TransportError,
};

const PUMP_ID: &str = "AA:BB:CC:DD:EE:FF";

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

struct Fixture {
    manager: Arc<PumpManager>,
    transport: Arc<MockTransport>,
    clock: Arc<ManualClock>,
}

/// Manager over a scripted transport, paired and configured for dosing.
fn fixture() -> Fixture {
    let transport = Arc::new(MockTransport::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let manager = PumpManager::new(
        transport.clone(),
        PumpStateStore::in_memory().unwrap(),
        clock.clone(),
    )
    .unwrap();

    manager.set_ble_identifier(Some(PUMP_ID.into()));
    manager.set_insulin_type(InsulinType::Novolog);
    manager
        .set_basal_schedule(BasalSchedule::new(vec![1.0; 24]), 1)
        .unwrap();

    Fixture {
        manager,
        transport,
        clock,
    }
}

#[derive(Default)]
struct RecordingDelegate {
    events: Mutex<Vec<PumpEvent>>,
    reservoir_readings: Mutex<Vec<f64>>,
    alerts: Mutex<Vec<PumpAlert>>,
}

impl PumpDelegate for RecordingDelegate {
    fn on_new_pump_events(&self, events: &[PumpEvent], _time: DateTime<Utc>) {
        self.events.lock().extend_from_slice(events);
    }

    fn on_reservoir_reading(&self, units: f64, _time: DateTime<Utc>) {
        self.reservoir_readings.lock().push(units);
    }

    fn on_alert(&self, alert: PumpAlert) {
        self.alerts.lock().push(alert);
    }
}

fn status_reading() -> StatusReading {
    StatusReading {
        reservoir_level: 120.0,
        battery_remaining: 80,
        is_suspended: false,
        current_basal_rate: 1.0,
    }
}

fn history_record(code: HistoryRecordCode) -> HistoryRecord {
    HistoryRecord {
        timestamp: start_time() - chrono::Duration::minutes(30),
        code,
        value: None,
        duration_minutes: None,
        alarm_code: None,
        raw: vec![0x01, 0x02],
    }
}


#[tokio::test]
async fn test_second_bolus_is_rejected_without_touching_the_first() {
    let f = fixture();
    f.manager
        .deliver_bolus(2.0, BolusActivationType::Manual)
        .await
        .unwrap();
    assert_eq!(f.manager.state().bolus_state, BolusState::InProgress);

    let err = f
        .manager
        .deliver_bolus(1.0, BolusActivationType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, PumpError::DeviceState(_)));
    assert_eq!(f.manager.state().bolus_state, BolusState::InProgress);

    // Only the first start packet went out.
    let starts = f
        .transport
        .sent_packets()
        .iter()
        .filter(|p| matches!(p, PumpPacket::BolusStart { .. }))
        .count();
    assert_eq!(starts, 1);
}

#[tokio::test]
async fn test_bolus_rejected_while_suspended() {
    let f = fixture();
    f.manager.suspend_delivery().await.unwrap();

    let err = f
        .manager
        .deliver_bolus(1.0, BolusActivationType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, PumpError::DeviceState(_)));
    assert_eq!(f.manager.state().bolus_state, BolusState::NoBolus);
}

#[tokio::test]
async fn test_bolus_requires_insulin_type() {
    let transport = Arc::new(MockTransport::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let manager = PumpManager::new(
        transport.clone(),
        PumpStateStore::in_memory().unwrap(),
        clock,
    )
    .unwrap();
    manager.set_ble_identifier(Some(PUMP_ID.into()));

    let err = manager
        .deliver_bolus(1.0, BolusActivationType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, PumpError::Configuration(_)));
    assert!(transport.sent_packets().is_empty());
}

#[tokio::test]
async fn test_bolus_start_rejection_reverts_to_idle() {
    let f = fixture();
    f.transport.push_response(CommandResponse::rejected());

    let err = f
        .manager
        .deliver_bolus(2.0, BolusActivationType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, PumpError::UncertainDelivery(_)));
    assert_eq!(f.manager.state().bolus_state, BolusState::NoBolus);
    assert_eq!(f.transport.disconnect_count(), 1);
}

#[tokio::test]
async fn test_bolus_on_unpaired_pump_is_a_connection_error() {
    let f = fixture();
    f.manager.set_ble_identifier(None);

    let err = f
        .manager
        .deliver_bolus(2.0, BolusActivationType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, PumpError::Connection(_)));
    assert_eq!(f.manager.state().bolus_state, BolusState::NoBolus);
    assert_eq!(f.transport.connect_count(), 0);
}

#[tokio::test]
async fn test_cancel_bolus_advances_status_date() {
    let f = fixture();
    f.manager
        .deliver_bolus(2.0, BolusActivationType::Manual)
        .await
        .unwrap();

    f.clock.advance(chrono::Duration::seconds(10));
    let before_cancel = f.clock.now();
    f.manager.cancel_bolus().await.unwrap();

    let state = f.manager.state();
    assert_eq!(state.bolus_state, BolusState::NoBolus);
    assert!(state.last_status_date >= before_cancel);
    assert_eq!(
        f.transport.sent_packets().last(),
        Some(&PumpPacket::BolusStop)
    );
}

#[tokio::test]
async fn test_failed_cancel_round_trips_bolus_state() {
    let f = fixture();
    f.manager
        .deliver_bolus(2.0, BolusActivationType::Manual)
        .await
        .unwrap();

    f.transport.push_send_error(TransportError::Timeout);
    let err = f.manager.cancel_bolus().await.unwrap_err();
    assert!(matches!(err, PumpError::Communication(_)));
    assert_eq!(f.manager.state().bolus_state, BolusState::InProgress);
}

#[tokio::test(start_paused = true)]
async fn test_bolus_auto_completes_after_estimated_duration() {
    let f = fixture();
    let delegate = Arc::new(RecordingDelegate::default());
    f.manager.set_delegate(delegate.clone());

    let transitions: Arc<Mutex<Vec<BolusState>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = transitions.clone();
    f.manager.register_status_observer(Box::new(move |old, new| {
        if old.bolus_state != new.bolus_state {
            seen.lock().push(new.bolus_state);
        }
    }));

    // 3.0 U at 12 s/U estimates 36 s of delivery.
    f.manager
        .deliver_bolus(3.0, BolusActivationType::Manual)
        .await
        .unwrap();
    assert_eq!(f.manager.state().bolus_state, BolusState::InProgress);

    tokio::time::sleep(Duration::from_secs(37)).await;
    f.manager.settle_notifications().await;

    assert_eq!(f.manager.state().bolus_state, BolusState::NoBolus);
    assert_eq!(
        *transitions.lock(),
        vec![
            BolusState::Initiating,
            BolusState::InProgress,
            BolusState::NoBolus
        ]
    );

    // The dose finalized with its full delivery snapshot.
    let events = delegate.events.lock();
    assert_eq!(events.len(), 1);
    match &events[0].kind {
        PumpEventKind::Bolus(dose) => {
            assert_eq!(dose.units, 3.0);
            assert_eq!(dose.duration, Some(Duration::from_secs(36)));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_external_termination_finalizes_with_progress_snapshot() {
    let f = fixture();
    let delegate = Arc::new(RecordingDelegate::default());
    f.manager.set_delegate(delegate.clone());

    f.manager
        .deliver_bolus(2.0, BolusActivationType::Manual)
        .await
        .unwrap();
    f.manager.note_bolus_progress(1.2);
    f.manager.note_bolus_terminated(None);
    f.manager.settle_notifications().await;

    assert_eq!(f.manager.state().bolus_state, BolusState::NoBolus);
    let events = delegate.events.lock();
    assert_eq!(events.len(), 1);
    match &events[0].kind {
        PumpEventKind::Bolus(dose) => assert_eq!(dose.units, 1.2),
        other => panic!("unexpected event: {other:?}"),
    }

    // A second termination without a dose in flight is a no-op.
    drop(events);
    f.manager.note_bolus_terminated(Some(5.0));
    f.manager.settle_notifications().await;
    assert_eq!(delegate.events.lock().len(), 1);
}


#[tokio::test]
async fn test_temp_basal_exactly_200_percent_at_15_minutes() {
    let f = fixture();
    f.manager
        .set_temp_basal(2.0, Duration::from_secs(900))
        .await
        .unwrap();

    assert_eq!(
        f.transport.sent_packets(),
        vec![PumpPacket::TempBasalShort {
            percent: 200,
            minutes: 15
        }]
    );
    let state = f.manager.state();
    assert_eq!(
        state.basal_delivery_ordinal,
        BasalDeliveryOrdinal::TempBasal
    );
    assert_eq!(state.temp_basal_units, Some(2.0));
    assert_eq!(state.temp_basal_duration, Some(Duration::from_secs(900)));
}

#[tokio::test]
async fn test_temp_basal_above_200_percent_is_forced_to_15_minutes() {
    let f = fixture();
    f.manager
        .set_temp_basal(2.5, Duration::from_secs(1800))
        .await
        .unwrap();

    assert_eq!(
        f.transport.sent_packets(),
        vec![PumpPacket::TempBasalShort {
            percent: 250,
            minutes: 15
        }]
    );
    assert_eq!(
        f.manager.state().temp_basal_duration,
        Some(Duration::from_secs(900))
    );
}

#[tokio::test]
async fn test_too_short_temp_basal_fails_before_any_transport_call() {
    let f = fixture();
    let err = f
        .manager
        .set_temp_basal(1.5, Duration::from_secs(300))
        .await
        .unwrap_err();

    assert!(matches!(err, PumpError::Configuration(_)));
    assert!(f.transport.sent_packets().is_empty());
    assert_eq!(f.transport.connect_count(), 0);
}

#[tokio::test]
async fn test_running_temp_basal_is_canceled_before_replacement() {
    let f = fixture();
    f.manager
        .set_temp_basal(1.5, Duration::from_secs(900))
        .await
        .unwrap();
    f.manager
        .set_temp_basal(1.2, Duration::from_secs(1800))
        .await
        .unwrap();

    assert_eq!(
        f.transport.sent_packets(),
        vec![
            PumpPacket::TempBasalShort {
                percent: 150,
                minutes: 15
            },
            PumpPacket::TempBasalCancel,
            PumpPacket::TempBasalShort {
                percent: 120,
                minutes: 30
            },
        ]
    );
    assert_eq!(f.manager.state().temp_basal_units, Some(1.2));
}

#[tokio::test]
async fn test_cancel_failure_aborts_replacement() {
    let f = fixture();
    f.manager
        .set_temp_basal(1.5, Duration::from_secs(900))
        .await
        .unwrap();

    f.transport.push_response(CommandResponse::rejected());
    let err = f
        .manager
        .set_temp_basal(1.2, Duration::from_secs(1800))
        .await
        .unwrap_err();

    assert!(matches!(err, PumpError::Configuration(_)));
    // The set packet was never issued and state still shows the first run.
    assert_eq!(
        f.transport.sent_packets().last(),
        Some(&PumpPacket::TempBasalCancel)
    );
    assert_eq!(f.manager.state().temp_basal_units, Some(1.5));
}

#[tokio::test]
async fn test_cancel_temp_basal_restores_schedule() {
    let f = fixture();
    let delegate = Arc::new(RecordingDelegate::default());
    f.manager.set_delegate(delegate.clone());

    f.manager
        .set_temp_basal(1.5, Duration::from_secs(900))
        .await
        .unwrap();
    f.manager.cancel_temp_basal().await.unwrap();
    f.manager.settle_notifications().await;

    let state = f.manager.state();
    assert_eq!(state.basal_delivery_ordinal, BasalDeliveryOrdinal::Active);
    assert_eq!(state.temp_basal_units, None);
    assert_eq!(state.temp_basal_duration, None);
    assert_eq!(
        f.transport.sent_packets().last(),
        Some(&PumpPacket::TempBasalCancel)
    );

    let events = delegate.events.lock();
    assert!(matches!(
        events.last().map(|e| &e.kind),
        Some(PumpEventKind::Basal { rate }) if *rate == 1.0
    ));
}

#[tokio::test]
async fn test_cancel_with_no_temp_basal_running_stays_local() {
    let f = fixture();
    f.manager.cancel_temp_basal().await.unwrap();

    assert!(f.transport.sent_packets().is_empty());
    assert_eq!(
        f.manager.state().basal_delivery_ordinal,
        BasalDeliveryOrdinal::Active
    );
}


#[tokio::test]
async fn test_suspend_and_resume_cycle() {
    let f = fixture();
    let delegate = Arc::new(RecordingDelegate::default());
    f.manager.set_delegate(delegate.clone());

    f.manager.suspend_delivery().await.unwrap();
    let state = f.manager.state();
    assert!(state.is_pump_suspended);
    assert_eq!(
        state.basal_delivery_ordinal,
        BasalDeliveryOrdinal::Suspended
    );

    f.manager.resume_delivery().await.unwrap();
    let state = f.manager.state();
    assert!(!state.is_pump_suspended);
    assert_eq!(state.basal_delivery_ordinal, BasalDeliveryOrdinal::Active);

    f.manager.settle_notifications().await;
    let kinds: Vec<_> = delegate
        .events
        .lock()
        .iter()
        .map(|e| e.kind.clone())
        .collect();
    assert_eq!(kinds, vec![PumpEventKind::Suspend, PumpEventKind::Resume]);
}


#[tokio::test]
async fn test_sync_status_reconciles_history_and_advances_date() {
    let f = fixture();
    let delegate = Arc::new(RecordingDelegate::default());
    f.manager.set_delegate(delegate.clone());

    let mut bolus = history_record(HistoryRecordCode::Bolus);
    bolus.value = Some(1.8);
    let mut alarm = history_record(HistoryRecordCode::Alarm);
    alarm.alarm_code = Some(0x42);

    f.transport
        .push_response(CommandResponse::with_data(ResponseData::Status(
            status_reading(),
        )));
    f.transport.push_response(CommandResponse::accepted());
    f.transport
        .push_response(CommandResponse::with_data(ResponseData::History(vec![
            bolus,
            alarm,
            history_record(HistoryRecordCode::Unknown(0x77)),
        ])));
    f.transport.push_response(CommandResponse::accepted());

    f.clock.advance(chrono::Duration::minutes(5));
    f.manager.sync_status().await.unwrap();
    f.manager.settle_notifications().await;

    let state = f.manager.state();
    assert_eq!(state.last_status_date, f.clock.now());
    assert_eq!(state.reservoir_level, 120.0);
    assert_eq!(state.battery_remaining, 80);

    let events = delegate.events.lock();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0].kind, PumpEventKind::Bolus(_)));
    assert!(matches!(events[1].kind, PumpEventKind::Alarm(_)));

    assert_eq!(*delegate.reservoir_readings.lock(), vec![120.0]);
    assert_eq!(delegate.alerts.lock().len(), 1);

    // One session for the status read, one for the history exchange.
    assert_eq!(f.transport.connect_count(), 2);
    assert_eq!(f.transport.disconnect_count(), 2);
}

#[tokio::test]
async fn test_history_failure_reports_nothing_and_keeps_date() {
    let f = fixture();
    let delegate = Arc::new(RecordingDelegate::default());
    f.manager.set_delegate(delegate.clone());
    let date_before = f.manager.state().last_status_date;

    f.transport
        .push_response(CommandResponse::with_data(ResponseData::Status(
            status_reading(),
        )));
    f.transport.push_response(CommandResponse::accepted());
    f.transport.push_send_error(TransportError::Timeout);

    f.clock.advance(chrono::Duration::minutes(5));
    let err = f.manager.sync_status().await.unwrap_err();
    assert!(matches!(err, PumpError::Communication(_)));

    f.manager.settle_notifications().await;
    assert!(delegate.events.lock().is_empty());
    assert_eq!(f.manager.state().last_status_date, date_before);

    // Upload mode was restored best-effort before the link was released.
    assert_eq!(
        f.transport.sent_packets().last(),
        Some(&PumpPacket::HistoryUploadMode { enabled: false })
    );
}


#[tokio::test]
async fn test_sync_time_adjusts_only_beyond_tolerance() {
    let f = fixture();

    // Within tolerance: no set-clock packet.
    f.transport
        .push_response(CommandResponse::with_data(ResponseData::Clock(
            f.clock.now() + chrono::Duration::seconds(30),
        )));
    f.manager.sync_time().await.unwrap();
    assert!(!f
        .transport
        .sent_packets()
        .iter()
        .any(|p| matches!(p, PumpPacket::SetClock { .. })));

    // Beyond tolerance: the clock is pushed.
    f.transport
        .push_response(CommandResponse::with_data(ResponseData::Clock(
            f.clock.now() + chrono::Duration::seconds(600),
        )));
    f.manager.sync_time().await.unwrap();
    assert!(f
        .transport
        .sent_packets()
        .iter()
        .any(|p| matches!(p, PumpPacket::SetClock { .. })));
}


#[tokio::test]
async fn test_expired_temp_basal_reverts_lazily_in_status() {
    let f = fixture();
    f.manager
        .set_temp_basal(1.5, Duration::from_secs(900))
        .await
        .unwrap();
    assert_eq!(
        f.manager.status().basal_delivery,
        BasalDeliveryOrdinal::TempBasal
    );

    f.clock.advance(chrono::Duration::minutes(20));
    let status = f.manager.status();
    assert_eq!(status.basal_delivery, BasalDeliveryOrdinal::Active);
    assert_eq!(status.temp_basal_units, None);
}
