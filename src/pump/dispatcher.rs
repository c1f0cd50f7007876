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

//! Command dispatch: one link session per packet sequence.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::connection::ConnectionController;
use crate::error::PumpError;
use crate::transport::{CommandResponse, PumpPacket, PumpTransport};

/// Wraps "connect, send packets, disconnect" as a single logical unit.
///
/// The link is released on every exit path; a failed packet stops the
/// sequence, and a supplied compensation packet is attempted best-effort
/// before release when an earlier packet already succeeded.
pub struct CommandDispatcher {
    transport: Arc<dyn PumpTransport>,
    connection: ConnectionController,
}

impl CommandDispatcher {
    pub fn new(transport: Arc<dyn PumpTransport>) -> Self {
        Self {
            connection: ConnectionController::new(transport.clone()),
            transport,
        }
    }

    /// Run a packet sequence as one link session.
    pub async fn execute(
        &mut self,
        stored_identifier: Option<&str>,
        packets: &[PumpPacket],
        compensation: Option<&PumpPacket>,
    ) -> Result<Vec<CommandResponse>, PumpError> {
        self.connection.ensure_connected(stored_identifier).await?;
        let result = self.run_sequence(packets, compensation).await;
        self.transport.disconnect().await;
        result
    }

    async fn run_sequence(
        &self,
        packets: &[PumpPacket],
        compensation: Option<&PumpPacket>,
    ) -> Result<Vec<CommandResponse>, PumpError> {
        let mut responses = Vec::with_capacity(packets.len());

        for packet in packets {
            match self.transport.send_command(packet).await {
                Ok(response) if response.success => {
                    debug!("{} acknowledged", packet.name());
                    responses.push(response);
                }
                Ok(_) => {
                    warn!("pump rejected {}", packet.name());
                    if !responses.is_empty() {
                        self.compensate(compensation).await;
                    }
                    return Err(PumpError::Configuration(format!(
                        "pump rejected {}",
                        packet.name()
                    )));
                }
                Err(e) => {
                    error!("transport failure sending {}: {}", packet.name(), e);
                    if !responses.is_empty() {
                        self.compensate(compensation).await;
                    }
                    return Err(PumpError::Communication(format!(
                        "{} failed: {e}",
                        packet.name()
                    )));
                }
            }
        }

        Ok(responses)
    }

    /// Best-effort compensating packet; failures are logged, never surfaced,
    /// so the primary error is not masked.
    async fn compensate(&self, compensation: Option<&PumpPacket>) {
        let Some(packet) = compensation else {
            return;
        };
        match self.transport.send_command(packet).await {
            Ok(response) if response.success => {
                debug!("compensating {} applied", packet.name());
            }
            Ok(_) => warn!("compensating {} rejected by pump", packet.name()),
            Err(e) => warn!("compensating {} failed: {}", packet.name(), e),
        }
    }
}
