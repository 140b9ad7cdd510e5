//! Persistent scheduler checkpoint.
//!
//! A single JSON document per chain, written atomically (temp file then
//! rename). The checkpoint is authoritative for restart; everything not in
//! it is recovered by re-probing chain state on load.

use std::collections::BTreeMap;
use std::path::Path;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::vault::Protocol;

/// Absolute wall-clock time in unix milliseconds.
pub type UnixMillis = u64;

/// Current wall-clock time.
pub fn now_ms() -> UnixMillis {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub const STATE_VERSION: u32 = 1;

/// Serde adapter mapping `+inf` (no debt) to JSON `null` and back.
/// serde_json cannot represent non-finite floats.
pub mod serde_health {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

/// Per-vault checkpoint record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub address: Address,
    pub protocol: Protocol,
    pub time_of_next_update: UnixMillis,
    #[serde(with = "serde_health")]
    pub internal_health_score: f64,
    #[serde(with = "serde_health")]
    pub external_health_score: f64,
}

/// Record of a vault whose adapter construction failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedInit {
    pub protocol: Protocol,
    pub retry_at: UnixMillis,
    pub attempts: u32,
}

/// The checkpoint document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedState {
    pub version: u32,
    /// BTreeMaps keep the serialized form stable across saves.
    pub accounts: BTreeMap<Address, VaultSnapshot>,
    pub queue: Vec<(UnixMillis, Address)>,
    pub last_saved_block: u64,
    #[serde(default)]
    pub failed_initializations: BTreeMap<Address, FailedInit>,
}

/// Write the checkpoint atomically.
pub fn save_state(state: &SavedState, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(state).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

/// Load the checkpoint. Missing file or corruption starts empty; a version
/// mismatch is only a warning and the load is still attempted.
pub fn load_state(path: &Path) -> Option<SavedState> {
    if !path.exists() {
        info!(path = %path.display(), "No saved state found");
        return None;
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read state file, starting fresh");
            return None;
        }
    };

    let state: SavedState = match serde_json::from_str(&contents) {
        Ok(state) => state,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Corrupt state file, starting fresh");
            return None;
        }
    };

    if state.version != STATE_VERSION {
        warn!(
            got = state.version,
            expected = STATE_VERSION,
            "State version mismatch, attempting load anyway"
        );
    }

    Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> SavedState {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let mut accounts = BTreeMap::new();
        accounts.insert(
            a,
            VaultSnapshot {
                address: a,
                protocol: Protocol::Euler,
                time_of_next_update: 1_700_000_000_000,
                internal_health_score: 1.25,
                external_health_score: f64::INFINITY,
            },
        );
        accounts.insert(
            b,
            VaultSnapshot {
                address: b,
                protocol: Protocol::Aave,
                time_of_next_update: 1_700_000_060_000,
                internal_health_score: f64::INFINITY,
                external_health_score: f64::INFINITY,
            },
        );
        let mut failed = BTreeMap::new();
        failed.insert(
            Address::repeat_byte(3),
            FailedInit { protocol: Protocol::Euler, retry_at: 1_700_000_120_000, attempts: 2 },
        );
        SavedState {
            version: STATE_VERSION,
            accounts,
            queue: vec![(1_700_000_000_000, a), (1_700_000_060_000, b)],
            last_saved_block: 424_242,
            failed_initializations: failed,
        }
    }

    #[test]
    fn infinite_health_roundtrips_as_null() {
        let state = sample_state();
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("null"));

        let restored: SavedState = serde_json::from_str(&json).unwrap();
        let b = restored.accounts.get(&Address::repeat_byte(2)).unwrap();
        assert!(b.internal_health_score.is_infinite());
        assert!(b.external_health_score.is_infinite());
        let a = restored.accounts.get(&Address::repeat_byte(1)).unwrap();
        assert_eq!(a.internal_health_score, 1.25);
    }

    #[test]
    fn save_load_save_is_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = sample_state();
        save_state(&state, &path).unwrap();
        let first = std::fs::read(&path).unwrap();

        let loaded = load_state(&path).unwrap();
        save_state(&loaded, &path).unwrap();
        let second = std::fs::read(&path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_state(&dir.path().join("nope.json")).is_none());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{broken").unwrap();
        assert!(load_state(&path).is_none());
    }

    #[test]
    fn version_mismatch_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = sample_state();
        state.version = 0;
        save_state(&state, &path).unwrap();
        let loaded = load_state(&path).unwrap();
        assert_eq!(loaded.version, 0);
        assert_eq!(loaded.accounts.len(), 2);
    }

    #[test]
    fn no_stray_temp_file_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        save_state(&sample_state(), &path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
