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

//! BLE transport implementation over BlueZ.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Address, Device, Session};
use futures::{pin_mut, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CommandResponse, PumpPacket, PumpTransport, TransportError, TransportHandle};

/// Pump link GATT service.
const PUMP_SERVICE: Uuid = Uuid::from_u128(0x0000_fff0_0000_1000_8000_00805f9b34fb);
/// Host-to-pump command characteristic.
const COMMAND_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000_fff1_0000_1000_8000_00805f9b34fb);
/// Pump-to-host response characteristic.
const RESPONSE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000_fff2_0000_1000_8000_00805f9b34fb);

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

struct Link {
    device: Device,
    command: Characteristic,
    response: Characteristic,
}

/// BlueZ central-role transport.
pub struct BleTransport {
    adapter: Adapter,
    link: Mutex<Option<Link>>,
}

impl BleTransport {
    /// Create the transport on the given adapter, or the default one.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
        let session = Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }
        info!("Using Bluetooth adapter: {}", adapter.name());

        Ok(Self {
            adapter,
            link: Mutex::new(None),
        })
    }

    async fn open_link(&self, address: &str) -> Result<(), TransportError> {
        let parsed = Address::from_str(address)
            .map_err(|e| TransportError::Connect(format!("invalid address {address}: {e}")))?;
        let device = self
            .adapter
            .device(parsed)
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        if !device
            .is_connected()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?
        {
            device
                .connect()
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
        }

        let (command, response) = Self::resolve_characteristics(&device).await?;
        debug!("pump link established to {address}");
        *self.link.lock().await = Some(Link {
            device,
            command,
            response,
        });
        Ok(())
    }

    async fn resolve_characteristics(
        device: &Device,
    ) -> Result<(Characteristic, Characteristic), TransportError> {
        let io = |e: bluer::Error| TransportError::Io(e.to_string());

        let mut command = None;
        let mut response = None;
        for service in device.services().await.map_err(io)? {
            if service.uuid().await.map_err(io)? != PUMP_SERVICE {
                continue;
            }
            for characteristic in service.characteristics().await.map_err(io)? {
                let uuid = characteristic.uuid().await.map_err(io)?;
                if uuid == COMMAND_CHARACTERISTIC {
                    command = Some(characteristic);
                } else if uuid == RESPONSE_CHARACTERISTIC {
                    response = Some(characteristic);
                }
            }
        }

        match (command, response) {
            (Some(command), Some(response)) => Ok((command, response)),
            _ => Err(TransportError::Connect(
                "pump service characteristics not found".into(),
            )),
        }
    }
}

#[async_trait]
impl PumpTransport for BleTransport {
    async fn connect_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<TransportHandle, TransportError> {
        self.open_link(identifier).await?;
        Ok(TransportHandle::new(identifier))
    }

    async fn connect_by_handle(&self, handle: &TransportHandle) -> Result<(), TransportError> {
        self.open_link(handle.address()).await
    }

    async fn disconnect(&self) {
        if let Some(link) = self.link.lock().await.take() {
            if let Err(e) = link.device.disconnect().await {
                warn!("error releasing pump link: {}", e);
            }
        }
    }

    async fn is_connected(&self) -> bool {
        let link = self.link.lock().await;
        match link.as_ref() {
            Some(link) => link.device.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn send_command(
        &self,
        packet: &PumpPacket,
    ) -> Result<CommandResponse, TransportError> {
        let link = self.link.lock().await;
        let link = link
            .as_ref()
            .ok_or_else(|| TransportError::Io("link is not open".into()))?;

        let frame = serde_json::to_vec(packet).map_err(|e| TransportError::Io(e.to_string()))?;
        debug!("sending {} ({} bytes)", packet.name(), frame.len());

        let notifications = link
            .response
            .notify()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        pin_mut!(notifications);

        link.command
            .write(&frame)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let answer = tokio::time::timeout(RESPONSE_TIMEOUT, notifications.next())
            .await
            .map_err(|_| TransportError::Timeout)?
            .ok_or_else(|| TransportError::Io("notification stream closed".into()))?;

        serde_json::from_slice(&answer)
            .map_err(|e| TransportError::Io(format!("malformed response: {e}")))
    }
}
