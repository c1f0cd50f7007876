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

//! Scripted transport for tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CommandResponse, PumpPacket, PumpTransport, TransportError, TransportHandle};

#[derive(Default)]
struct MockInner {
    connected: bool,
    connect_results: VecDeque<Result<(), TransportError>>,
    responses: VecDeque<Result<CommandResponse, TransportError>>,
    sent: Vec<PumpPacket>,
    connects: u32,
    disconnects: u32,
}

/// Transport whose connect and command outcomes are scripted in advance.
///
/// Unscripted connects succeed and unscripted commands are accepted, so
/// tests only queue the steps they care about.
#[derive(Default)]
pub struct MockTransport {
    inner: Mutex<MockInner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next connect attempt.
    pub fn push_connect_error(&self, error: TransportError) {
        self.inner.lock().connect_results.push_back(Err(error));
    }

    /// Queue the device's answer to the next sent packet.
    pub fn push_response(&self, response: CommandResponse) {
        self.inner.lock().responses.push_back(Ok(response));
    }

    /// Queue a transport failure for the next sent packet.
    pub fn push_send_error(&self, error: TransportError) {
        self.inner.lock().responses.push_back(Err(error));
    }

    /// Force the link state, bypassing connect/disconnect.
    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().connected = connected;
    }

    /// Packets sent so far, in order.
    pub fn sent_packets(&self) -> Vec<PumpPacket> {
        self.inner.lock().sent.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.inner.lock().connects
    }

    pub fn disconnect_count(&self) -> u32 {
        self.inner.lock().disconnects
    }
}

#[async_trait]
impl PumpTransport for MockTransport {
    async fn connect_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<TransportHandle, TransportError> {
        let mut inner = self.inner.lock();
        inner.connects += 1;
        match inner.connect_results.pop_front() {
            Some(Err(e)) => Err(e),
            _ => {
                inner.connected = true;
                Ok(TransportHandle::new(identifier))
            }
        }
    }

    async fn connect_by_handle(&self, _handle: &TransportHandle) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.connects += 1;
        match inner.connect_results.pop_front() {
            Some(Err(e)) => Err(e),
            _ => {
                inner.connected = true;
                Ok(())
            }
        }
    }

    async fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.disconnects += 1;
    }

    async fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    async fn send_command(
        &self,
        packet: &PumpPacket,
    ) -> Result<CommandResponse, TransportError> {
        let mut inner = self.inner.lock();
        inner.sent.push(packet.clone());
        match inner.responses.pop_front() {
            Some(result) => result,
            None => Ok(CommandResponse::accepted()),
        }
    }
}
