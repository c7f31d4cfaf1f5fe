//! Admin-maintained allowlist persisted at `<data>/settings.json`. Updates
//! are written to a temp file and renamed into place, then the in-memory
//! copy is swapped so the gate sees the new allowlist immediately.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::{GatewayError, GatewayResult};

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub allowlist_emails: Vec<String>,
    #[serde(default)]
    pub admin_emails: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

pub struct SettingsStore {
    path: PathBuf,
    inner: RwLock<Settings>,
}

impl SettingsStore {
    /// Loads persisted settings, seeding from the environment-provided lists
    /// when no file exists yet.
    pub fn load(data_dir: &Path, seed_allowlist: Vec<String>, seed_admins: Vec<String>) -> Self {
        let path = data_dir.join(SETTINGS_FILE);
        let settings = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("[settings] unparsable {}: {e}; using seed", path.display());
                Settings {
                    allowlist_emails: seed_allowlist.clone(),
                    admin_emails: seed_admins.clone(),
                    ..Settings::default()
                }
            }),
            Err(_) => Settings {
                allowlist_emails: seed_allowlist,
                admin_emails: seed_admins,
                ..Settings::default()
            },
        };
        Self {
            path,
            inner: RwLock::new(settings),
        }
    }

    pub fn current(&self) -> Settings {
        self.inner.read().clone()
    }

    pub fn allowlist_is_empty(&self) -> bool {
        self.inner.read().allowlist_emails.is_empty()
    }

    pub fn is_allowed(&self, email: &str) -> bool {
        self.inner
            .read()
            .allowlist_emails
            .iter()
            .any(|e| e == email)
    }

    pub fn is_admin(&self, email: &str) -> bool {
        self.inner.read().admin_emails.iter().any(|e| e == email)
    }

    /// Atomic write-then-rename, then reload of the in-memory state.
    pub fn update(
        &self,
        allowlist_emails: Vec<String>,
        admin_emails: Vec<String>,
        updated_by: &str,
    ) -> GatewayResult<Settings> {
        let next = Settings {
            allowlist_emails: allowlist_emails
                .into_iter()
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            admin_emails: admin_emails
                .into_iter()
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            updated_at: Some(Utc::now()),
            updated_by: Some(updated_by.to_string()),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&next)
            .map_err(|e| GatewayError::Internal(format!("serialize settings: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;

        *self.inner.write() = next.clone();
        tracing::info!("[settings] updated by {updated_by}");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_when_missing_and_persists_updates() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = SettingsStore::load(tmp.path(), vec!["a@x".into()], vec![]);
        assert!(store.is_allowed("a@x"));
        assert!(!store.is_admin("a@x"));

        store
            .update(vec!["A@X".into(), "b@y".into()], vec!["b@y".into()], "b@y")
            .unwrap();
        assert!(store.is_allowed("a@x"));
        assert!(store.is_admin("b@y"));

        // A fresh store reads the renamed file, not the seed.
        let reloaded = SettingsStore::load(tmp.path(), vec![], vec![]);
        assert!(reloaded.is_allowed("b@y"));
        assert_eq!(reloaded.current().updated_by.as_deref(), Some("b@y"));
    }
}
