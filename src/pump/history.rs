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

//! Reconciliation of device history records into domain events.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::dispatcher::CommandDispatcher;
use super::events::{AlarmKind, DoseEntry, PumpEvent, PumpEventKind};
use crate::error::PumpError;
use crate::transport::{HistoryRecord, HistoryRecordCode, PumpPacket, ResponseData};

/// Fetch all records logged after `since` and map them to domain events.
///
/// The device is toggled into history-upload mode for the duration of the
/// request; a failure mid-sequence restores the mode best-effort and yields
/// an error so that no partial history is ever reported as complete.
pub async fn synchronize(
    dispatcher: &mut CommandDispatcher,
    stored_identifier: Option<&str>,
    since: DateTime<Utc>,
) -> Result<Vec<PumpEvent>, PumpError> {
    let packets = [
        PumpPacket::HistoryUploadMode { enabled: true },
        PumpPacket::HistorySince { after: since },
        PumpPacket::HistoryUploadMode { enabled: false },
    ];
    let restore = PumpPacket::HistoryUploadMode { enabled: false };

    let responses = dispatcher
        .execute(stored_identifier, &packets, Some(&restore))
        .await
        .map_err(|e| {
            warn!("history synchronization failed: {}", e);
            e
        })?;

    let records = responses
        .iter()
        .find_map(|response| match &response.data {
            ResponseData::History(records) => Some(records.clone()),
            _ => None,
        })
        .unwrap_or_default();

    let events = reconcile(&records);
    debug!(
        "reconciled {} of {} history records into events",
        events.len(),
        records.len()
    );
    Ok(events)
}

/// Map device records into domain events, dropping unsupported types.
pub fn reconcile(records: &[HistoryRecord]) -> Vec<PumpEvent> {
    records.iter().filter_map(map_record).collect()
}

fn map_record(record: &HistoryRecord) -> Option<PumpEvent> {
    let kind = match record.code {
        HistoryRecordCode::Bolus => {
            // History alone cannot distinguish partial delivery; the value
            // field stands for both requested and delivered units.
            let units = record.value?;
            PumpEventKind::Bolus(DoseEntry {
                units,
                duration: record
                    .duration_minutes
                    .map(|minutes| Duration::from_secs(u64::from(minutes) * 60)),
                automatic: false,
            })
        }
        HistoryRecordCode::Suspend => {
            let flag = record.value?;
            if flag == 0.0 {
                PumpEventKind::Resume
            } else {
                PumpEventKind::Suspend
            }
        }
        HistoryRecordCode::Prime => PumpEventKind::Prime {
            units: record.value,
        },
        HistoryRecordCode::Refill => PumpEventKind::Rewind,
        HistoryRecordCode::Alarm => {
            PumpEventKind::Alarm(AlarmKind::from_code(record.alarm_code?))
        }
        HistoryRecordCode::TempBasalPercent => {
            // Percentage-based legacy records cannot be expressed as an
            // absolute rate without the schedule active at the time.
            debug!(
                "dropping legacy percent temp basal record: {}",
                hex::encode(&record.raw)
            );
            return None;
        }
        HistoryRecordCode::DailyTotal | HistoryRecordCode::Unknown(_) => return None,
    };

    Some(PumpEvent::new(record.timestamp, kind, record.raw.clone()))
}
