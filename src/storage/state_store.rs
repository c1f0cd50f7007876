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

//! Persisted pump state using SQLite.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::PumpError;
use crate::pump::state::PumpState;

/// Single-row store for the serialized [`PumpState`].
#[derive(Clone)]
pub struct PumpStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl PumpStateStore {
    /// Create or open the state database.
    pub fn new(data_dir: &Path) -> Result<Self, PumpError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| PumpError::Storage(e.to_string()))?;
        let db_path = data_dir.join("pump.db");
        info!("Opening pump state database: {:?}", db_path);

        let conn =
            Connection::open(&db_path).map_err(|e| PumpError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    /// Ephemeral store for tests.
    pub fn in_memory() -> Result<Self, PumpError> {
        let conn =
            Connection::open_in_memory().map_err(|e| PumpError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, PumpError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pump_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| PumpError::Storage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Load the persisted state, if any.
    pub fn load(&self) -> Result<Option<PumpState>, PumpError> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<String> = conn
            .query_row("SELECT payload FROM pump_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| PumpError::Storage(e.to_string()))?;

        match payload {
            Some(payload) => serde_json::from_str(&payload)
                .map(Some)
                .map_err(|e| PumpError::Storage(format!("corrupt pump state: {e}"))),
            None => Ok(None),
        }
    }

    /// Replace the persisted state.
    pub fn save(&self, state: &PumpState) -> Result<(), PumpError> {
        let payload =
            serde_json::to_string(state).map_err(|e| PumpError::Storage(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO pump_state (id, payload) VALUES (1, ?1)",
            params![payload],
        )
        .map_err(|e| PumpError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::state::{BasalDeliveryOrdinal, BolusSpeed};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn sample_state() -> PumpState {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let mut state = PumpState::new(now);
        state.ble_identifier = Some("AA:BB:CC:DD:EE:FF".into());
        state.reservoir_level = 142.5;
        state.bolus_speed = BolusSpeed::Speed30;
        state
    }

    #[test]
    fn test_load_empty_store() {
        let store = PumpStateStore::in_memory().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_round_trip() {
        let store = PumpStateStore::in_memory().unwrap();
        let state = sample_state();
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.ble_identifier, state.ble_identifier);
        assert_eq!(loaded.reservoir_level, state.reservoir_level);
        assert_eq!(loaded.bolus_speed, state.bolus_speed);
        assert_eq!(
            loaded.basal_delivery_ordinal,
            BasalDeliveryOrdinal::Active
        );
    }

    #[test]
    fn test_save_overwrites_previous_state() {
        let dir = tempdir().unwrap();
        let store = PumpStateStore::new(dir.path()).unwrap();

        let mut state = sample_state();
        store.save(&state).unwrap();
        state.reservoir_level = 10.0;
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.reservoir_level, 10.0);
    }
}
