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

//! Transport gateway boundary.
//!
//! The delivery core talks to the pump only through [`PumpTransport`].
//! Packet byte layout, pairing and scanning live behind this boundary.

mod ble;
pub mod mock;

pub use ble::BleTransport;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pump::state::BolusSpeed;

/// Failures at the transport boundary.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connecting to the device failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// I/O failure on an established link.
    #[error("link i/o failed: {0}")]
    Io(String),

    /// The device did not answer within the transport's deadline.
    #[error("response timed out")]
    Timeout,
}

/// Opaque reconnection handle retained across command sessions.
///
/// A handle survives disconnection; the connection controller uses it to
/// reconnect without a fresh identifier lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    address: String,
}

impl TransportHandle {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Commands understood by the pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PumpPacket {
    BolusStart { units: f64, speed: BolusSpeed },
    BolusStop,
    TempBasalShort { percent: u16, minutes: u16 },
    TempBasalLong { percent: u16, hours: u32 },
    TempBasalCancel,
    SuspendDelivery,
    ResumeDelivery,
    HistoryUploadMode { enabled: bool },
    HistorySince { after: DateTime<Utc> },
    ReadStatus,
    ReadClock,
    SetClock { time: DateTime<Utc> },
}

impl PumpPacket {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            PumpPacket::BolusStart { .. } => "bolus-start",
            PumpPacket::BolusStop => "bolus-stop",
            PumpPacket::TempBasalShort { .. } => "temp-basal-short",
            PumpPacket::TempBasalLong { .. } => "temp-basal-long",
            PumpPacket::TempBasalCancel => "temp-basal-cancel",
            PumpPacket::SuspendDelivery => "suspend-delivery",
            PumpPacket::ResumeDelivery => "resume-delivery",
            PumpPacket::HistoryUploadMode { .. } => "history-upload-mode",
            PumpPacket::HistorySince { .. } => "history-since",
            PumpPacket::ReadStatus => "read-status",
            PumpPacket::ReadClock => "read-clock",
            PumpPacket::SetClock { .. } => "set-clock",
        }
    }
}

/// Device answer to a single packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// `false` means the device explicitly rejected the command; transport
    /// failures are reported as [`TransportError`] instead.
    pub success: bool,
    pub data: ResponseData,
}

impl CommandResponse {
    /// Plain acknowledgement.
    pub fn accepted() -> Self {
        Self {
            success: true,
            data: ResponseData::None,
        }
    }

    /// Explicit device rejection.
    pub fn rejected() -> Self {
        Self {
            success: false,
            data: ResponseData::None,
        }
    }

    pub fn with_data(data: ResponseData) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Typed payload carried by a [`CommandResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    None,
    Status(StatusReading),
    History(Vec<HistoryRecord>),
    Clock(DateTime<Utc>),
}

/// Full-status reading reported by the pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReading {
    pub reservoir_level: f64,
    pub battery_remaining: u8,
    pub is_suspended: bool,
    pub current_basal_rate: f64,
}

/// A timestamped device log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub code: HistoryRecordCode,
    pub value: Option<f64>,
    pub duration_minutes: Option<u32>,
    pub alarm_code: Option<u8>,
    /// Raw record bytes, kept for audit.
    pub raw: Vec<u8>,
}

/// Device log record type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryRecordCode {
    Bolus,
    DailyTotal,
    Prime,
    Refill,
    Suspend,
    /// Legacy percentage-based temp basal record.
    TempBasalPercent,
    Alarm,
    Unknown(u8),
}

/// Single physical link to the pump.
///
/// Commands issued on the link are inherently serialized by the link itself;
/// the caller owns session ordering.
#[async_trait]
pub trait PumpTransport: Send + Sync {
    /// Connect to a device by its stored identifier, returning a handle
    /// usable for later reconnects.
    async fn connect_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<TransportHandle, TransportError>;

    /// Reconnect using a handle retained from a previous session.
    async fn connect_by_handle(&self, handle: &TransportHandle) -> Result<(), TransportError>;

    /// Release the link. Safe to call when already disconnected.
    async fn disconnect(&self);

    /// Whether the peripheral currently reports an open link.
    async fn is_connected(&self) -> bool;

    /// Send one packet and await the device's answer.
    async fn send_command(&self, packet: &PumpPacket)
        -> Result<CommandResponse, TransportError>;
}
