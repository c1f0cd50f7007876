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

//! Temp basal policy: rate-to-percentage conversion and duration
//! normalization against device constraints.

use std::time::Duration;

use crate::error::PumpError;
use crate::pump::state::{BasalSchedule, SCHEDULE_ENTRIES};
use crate::transport::PumpPacket;

/// Highest percentage the device sustains beyond 15 minutes.
pub const MAX_SUSTAINED_PERCENT: u16 = 200;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Temp basal spans the device can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempBasalSpan {
    /// Cancel any running temp basal.
    Zero,
    Minutes15,
    Minutes30,
    Hours(u32),
}

impl TempBasalSpan {
    pub fn as_duration(&self) -> Duration {
        match self {
            TempBasalSpan::Zero => Duration::ZERO,
            TempBasalSpan::Minutes15 => Duration::from_secs(15 * MINUTE),
            TempBasalSpan::Minutes30 => Duration::from_secs(30 * MINUTE),
            TempBasalSpan::Hours(hours) => Duration::from_secs(u64::from(*hours) * HOUR),
        }
    }

    /// The activation packet for this span, or `None` for a plain cancel.
    pub fn packet(&self, percent: u16) -> Option<PumpPacket> {
        match self {
            TempBasalSpan::Zero => None,
            TempBasalSpan::Minutes15 => Some(PumpPacket::TempBasalShort {
                percent,
                minutes: 15,
            }),
            TempBasalSpan::Minutes30 => Some(PumpPacket::TempBasalShort {
                percent,
                minutes: 30,
            }),
            TempBasalSpan::Hours(hours) => Some(PumpPacket::TempBasalLong {
                percent,
                hours: *hours,
            }),
        }
    }
}

/// Convert an absolute rate into the device's percentage of the scheduled
/// basal rate for the given hour of day.
///
/// Zero units/hour is always 0 %, independent of schedule validity.
pub fn percentage_for(
    absolute_rate: f64,
    schedule: &BasalSchedule,
    hour: usize,
) -> Result<u16, PumpError> {
    if absolute_rate == 0.0 {
        return Ok(0);
    }
    if !schedule.is_valid() {
        return Err(PumpError::Configuration(format!(
            "basal schedule must have {SCHEDULE_ENTRIES} entries, got {}",
            schedule.len()
        )));
    }
    let base = schedule
        .rate_at_hour(hour)
        .ok_or_else(|| PumpError::Configuration(format!("no scheduled rate for hour {hour}")))?;
    if base <= 0.0 {
        return Err(PumpError::Configuration(format!(
            "scheduled basal rate for hour {hour} is zero"
        )));
    }
    Ok((absolute_rate / base * 100.0).round() as u16)
}

/// Floor a requested duration to the nearest span the device supports.
///
/// Supported values pass through unchanged; anything in (0, 15 min) is too
/// short to express and is rejected.
pub fn normalize_duration(duration: Duration) -> Result<TempBasalSpan, PumpError> {
    let secs = duration.as_secs();
    if secs == 0 {
        return Ok(TempBasalSpan::Zero);
    }
    if secs >= HOUR {
        return Ok(TempBasalSpan::Hours((secs / HOUR) as u32));
    }
    if secs >= 30 * MINUTE {
        return Ok(TempBasalSpan::Minutes30);
    }
    if secs >= 15 * MINUTE {
        return Ok(TempBasalSpan::Minutes15);
    }
    Err(PumpError::Configuration(format!(
        "temp basal duration of {secs}s is too short to express"
    )))
}

/// The device cannot sustain more than [`MAX_SUSTAINED_PERCENT`] beyond a
/// 15 minute span; longer spans are forced down to 15 minutes.
pub fn clamp_for_percent(span: TempBasalSpan, percent: u16) -> TempBasalSpan {
    match span {
        TempBasalSpan::Zero | TempBasalSpan::Minutes15 => span,
        _ if percent > MAX_SUSTAINED_PERCENT => TempBasalSpan::Minutes15,
        _ => span,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_schedule(rate: f64) -> BasalSchedule {
        BasalSchedule::new(vec![rate; 24])
    }

    #[test]
    fn test_zero_rate_is_zero_percent_regardless_of_schedule() {
        assert_eq!(percentage_for(0.0, &flat_schedule(1.0), 10).unwrap(), 0);
        assert_eq!(
            percentage_for(0.0, &BasalSchedule::new(vec![]), 10).unwrap(),
            0
        );
        assert_eq!(
            percentage_for(0.0, &BasalSchedule::new(vec![1.0; 12]), 10).unwrap(),
            0
        );
    }

    #[test]
    fn test_percentage_requires_full_schedule() {
        let err = percentage_for(1.0, &BasalSchedule::new(vec![1.0; 23]), 0).unwrap_err();
        assert!(matches!(err, PumpError::Configuration(_)));
        assert!(percentage_for(1.0, &flat_schedule(1.0), 0).is_ok());
    }

    #[test]
    fn test_percentage_rounds_against_scheduled_rate() {
        assert_eq!(percentage_for(2.0, &flat_schedule(1.0), 0).unwrap(), 200);
        assert_eq!(percentage_for(2.5, &flat_schedule(1.0), 0).unwrap(), 250);
        assert_eq!(percentage_for(0.75, &flat_schedule(0.5), 0).unwrap(), 150);
        assert_eq!(percentage_for(1.0, &flat_schedule(3.0), 0).unwrap(), 33);
    }

    #[test]
    fn test_percentage_rejects_zero_base_rate() {
        let err = percentage_for(1.0, &flat_schedule(0.0), 0).unwrap_err();
        assert!(matches!(err, PumpError::Configuration(_)));
    }

    #[test]
    fn test_normalization_is_idempotent_on_supported_durations() {
        let supported = [
            (Duration::ZERO, TempBasalSpan::Zero),
            (Duration::from_secs(15 * 60), TempBasalSpan::Minutes15),
            (Duration::from_secs(30 * 60), TempBasalSpan::Minutes30),
            (Duration::from_secs(3600), TempBasalSpan::Hours(1)),
            (Duration::from_secs(4 * 3600), TempBasalSpan::Hours(4)),
        ];
        for (duration, span) in supported {
            let normalized = normalize_duration(duration).unwrap();
            assert_eq!(normalized, span);
            assert_eq!(normalized.as_duration(), duration);
            assert_eq!(normalize_duration(normalized.as_duration()).unwrap(), span);
        }
    }

    #[test]
    fn test_normalization_floors_unsupported_durations() {
        assert_eq!(
            normalize_duration(Duration::from_secs(90 * 60)).unwrap(),
            TempBasalSpan::Hours(1)
        );
        assert_eq!(
            normalize_duration(Duration::from_secs(45 * 60)).unwrap(),
            TempBasalSpan::Minutes30
        );
        assert_eq!(
            normalize_duration(Duration::from_secs(20 * 60)).unwrap(),
            TempBasalSpan::Minutes15
        );
    }

    #[test]
    fn test_normalization_rejects_sub_quarter_hour() {
        let err = normalize_duration(Duration::from_secs(300)).unwrap_err();
        assert!(matches!(err, PumpError::Configuration(_)));
        let err = normalize_duration(Duration::from_secs(14 * 60)).unwrap_err();
        assert!(matches!(err, PumpError::Configuration(_)));
    }

    #[test]
    fn test_high_percentage_forces_fifteen_minutes() {
        assert_eq!(
            clamp_for_percent(TempBasalSpan::Minutes30, 250),
            TempBasalSpan::Minutes15
        );
        assert_eq!(
            clamp_for_percent(TempBasalSpan::Hours(2), 201),
            TempBasalSpan::Minutes15
        );
        // Exactly 200 % is allowed at any span.
        assert_eq!(
            clamp_for_percent(TempBasalSpan::Minutes30, 200),
            TempBasalSpan::Minutes30
        );
        // A 15 minute span never changes, and cancel is never promoted.
        assert_eq!(
            clamp_for_percent(TempBasalSpan::Minutes15, 400),
            TempBasalSpan::Minutes15
        );
        assert_eq!(clamp_for_percent(TempBasalSpan::Zero, 400), TempBasalSpan::Zero);
    }

    #[test]
    fn test_span_packets() {
        assert_eq!(TempBasalSpan::Zero.packet(0), None);
        assert_eq!(
            TempBasalSpan::Minutes15.packet(200),
            Some(PumpPacket::TempBasalShort {
                percent: 200,
                minutes: 15
            })
        );
        assert_eq!(
            TempBasalSpan::Hours(3).packet(150),
            Some(PumpPacket::TempBasalLong {
                percent: 150,
                hours: 3
            })
        );
    }
}
