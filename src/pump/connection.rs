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

//! Per-command connection acquisition.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::PumpError;
use crate::transport::{PumpTransport, TransportHandle};

/// Decides, per command, how a link is acquired.
///
/// Owns the "currently connected" fact and the handle retained from the
/// previous session. The transport is injected at construction.
pub struct ConnectionController {
    transport: Arc<dyn PumpTransport>,
    handle: Option<TransportHandle>,
}

impl ConnectionController {
    pub fn new(transport: Arc<dyn PumpTransport>) -> Self {
        Self {
            transport,
            handle: None,
        }
    }

    /// Acquire a link for one command. Always completes.
    ///
    /// Decision order, first match wins: an already-open link fails the
    /// attempt (the link is a single-owner resource), a retained handle is
    /// reconnected, a stored identifier is connected fresh, and a pump that
    /// was never paired fails outright.
    pub async fn ensure_connected(
        &mut self,
        stored_identifier: Option<&str>,
    ) -> Result<(), PumpError> {
        if self.transport.is_connected().await {
            warn!(
                target: "connection",
                "link refused: already owned by an in-flight command"
            );
            return Err(PumpError::Connection(
                "link is busy with another command".into(),
            ));
        }

        if let Some(handle) = self.handle.clone() {
            debug!(
                target: "connection",
                address = handle.address(),
                "reconnecting via retained handle"
            );
            return match self.transport.connect_by_handle(&handle).await {
                Ok(()) => {
                    info!(target: "connection", "reconnected via retained handle");
                    Ok(())
                }
                Err(e) => {
                    warn!(target: "connection", reason = %e, "reconnect failed");
                    Err(PumpError::Connection(format!("reconnect failed: {e}")))
                }
            };
        }

        let Some(identifier) = stored_identifier else {
            warn!(
                target: "connection",
                "no stored identifier: pump was never paired"
            );
            return Err(PumpError::Connection("pump is not paired".into()));
        };

        match self.transport.connect_by_identifier(identifier).await {
            Ok(handle) => {
                info!(target: "connection", identifier, "connected");
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                warn!(target: "connection", identifier, reason = %e, "connect failed");
                Err(PumpError::Connection(format!("connect failed: {e}")))
            }
        }
    }
}
