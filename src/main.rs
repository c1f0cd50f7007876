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

//! Pumplink Desktop Daemon

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pumplink_desktop::clock::SystemClock;
use pumplink_desktop::config::Config;
use pumplink_desktop::pump::PumpManager;
use pumplink_desktop::storage::PumpStateStore;
use pumplink_desktop::transport::BleTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pumplink_desktop=info".parse().unwrap()),
        )
        .init();

    info!(
        "Starting Pumplink Desktop v{}...",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Initialize storage
    let store = PumpStateStore::new(&config.data_dir)?;
    info!("Pump state storage initialized");

    // Bring up the BLE transport
    let transport = Arc::new(BleTransport::new(config.bluetooth.adapter.as_deref()).await?);
    info!("BLE transport ready");

    // Create the pump manager
    let manager = PumpManager::new(transport, store, Arc::new(SystemClock))?;

    // Adopt the configured pump address on first run
    if manager.state().ble_identifier.is_none() {
        if let Some(address) = &config.bluetooth.pump_address {
            info!("Adopting configured pump address {}", address);
            manager.set_ble_identifier(Some(address.clone()));
        }
    }

    let _status_log = manager.register_status_observer(Box::new(|old, new| {
        if old.basal_delivery != new.basal_delivery || old.bolus_state != new.bolus_state {
            info!(
                "pump status: basal {} -> {}, bolus {} -> {}",
                old.basal_delivery.as_str(),
                new.basal_delivery.as_str(),
                old.bolus_state.as_str(),
                new.bolus_state.as_str()
            );
        }
    }));

    // Periodic status synchronization
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.sync.status_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                manager.heartbeat();
                if let Err(e) = manager.sync_status().await {
                    warn!("Status synchronization failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
