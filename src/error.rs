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

//! Error taxonomy for pump operations.

use thiserror::Error;

/// Errors surfaced by pump operations.
///
/// Every failure is reported to the caller for a higher-level decision;
/// nothing here is fatal to the process.
#[derive(Debug, Error)]
pub enum PumpError {
    /// No link could be acquired: pairing missing, reconnect failed, or the
    /// link is already owned by another in-flight command.
    #[error("connection: {0}")]
    Connection(String),

    /// Transport-level failure during an otherwise-connected exchange.
    #[error("communication: {0}")]
    Communication(String),

    /// The pump refused the command because of its own state (e.g. suspended).
    /// The caller must change conditions before retrying.
    #[error("device state: {0}")]
    DeviceState(String),

    /// The command or its parameters are unsupported by the device.
    /// Not retryable without changing parameters.
    #[error("configuration: {0}")]
    Configuration(String),

    /// A bolus start acknowledgement was ambiguous. The caller must assume
    /// the dose may have partially started.
    #[error("uncertain delivery: {0}")]
    UncertainDelivery(String),

    /// Local persistence failure.
    #[error("storage: {0}")]
    Storage(String),
}

impl PumpError {
    /// Whether re-invoking the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PumpError::Connection(_) | PumpError::Communication(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PumpError::Connection("gone".into()).is_retryable());
        assert!(PumpError::Communication("dropped".into()).is_retryable());
        assert!(!PumpError::DeviceState("suspended".into()).is_retryable());
        assert!(!PumpError::Configuration("bad duration".into()).is_retryable());
        assert!(!PumpError::UncertainDelivery("no ack".into()).is_retryable());
    }
}
