//! Bootstrap state persisted across restarts (so a device doesn't need its secrets
//! re-provisioned after a power cycle). Grounded on spec §6's "Persisted state" contract;
//! serde struct shape patterned on `services/authenticator/src/core.rs`'s serde structs,
//! and the atomic-rewrite helper on the same file's save-to-disk style (write temp, rename
//! over target, so a crash mid-write never corrupts the on-disk copy).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use pagekite_core::error::PkResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub ssid: String,
    pub key: String,
    pub kite_name: String,
    pub kite_secret: String,
    pub src: String,
}

impl PersistedState {
    pub fn load(path: &Path) -> PkResult<Option<PersistedState>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes to `path` atomically: serialize to a sibling temp file, then rename over the
    /// target, so a reader never observes a half-written file.
    pub fn save(&self, path: &Path) -> PkResult<()> {
        let tmp_path = tmp_sibling(path);
        let json = serde_json::to_vec_pretty(self)?;

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_disk() {
        let dir = std::env::temp_dir().join(format!("pagekite-state-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        let state = PersistedState {
            ssid: "s1".into(),
            key: "k1".into(),
            kite_name: "test.example.com".into(),
            kite_secret: "secret".into(),
            src: "bootstrap".into(),
        };
        state.save(&path).unwrap();

        let loaded = PersistedState::load(&path).unwrap().unwrap();
        assert_eq!(loaded.kite_name, "test.example.com");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_is_none() {
        let path = std::env::temp_dir().join("pagekite-state-definitely-missing.json");
        assert!(PersistedState::load(&path).unwrap().is_none());
    }
}
