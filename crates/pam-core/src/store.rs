//! sled-backed store for developer apps, API keys, usage counters and webhook deliveries.
//!
//! Everything that must survive a restart or be shared between workers lives here
//! rather than in process-local maps.

use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

use crate::error::PamResult;

const APPS_TREE: &str = "apps";
const API_KEYS_TREE: &str = "api_keys";
const USAGE_TREE: &str = "usage";
const DELIVERIES_TREE: &str = "webhook_deliveries";

/// Handle to the PAM database. Cloning is cheap (sled handles are reference counted).
#[derive(Clone)]
pub struct PamStore {
    db: sled::Db,
    apps: sled::Tree,
    api_keys: sled::Tree,
    usage: sled::Tree,
    deliveries: sled::Tree,
}

impl PamStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> PamResult<Self> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(db)
    }

    /// Throwaway in-memory store.
    pub fn temporary() -> PamResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> PamResult<Self> {
        Ok(Self {
            apps: db.open_tree(APPS_TREE)?,
            api_keys: db.open_tree(API_KEYS_TREE)?,
            usage: db.open_tree(USAGE_TREE)?,
            deliveries: db.open_tree(DELIVERIES_TREE)?,
            db,
        })
    }

    pub(crate) fn apps(&self) -> &sled::Tree {
        &self.apps
    }

    pub(crate) fn api_keys(&self) -> &sled::Tree {
        &self.api_keys
    }

    pub(crate) fn usage(&self) -> &sled::Tree {
        &self.usage
    }

    pub(crate) fn deliveries(&self) -> &sled::Tree {
        &self.deliveries
    }

    pub async fn flush(&self) -> PamResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

pub(crate) fn put_json<T: Serialize>(tree: &sled::Tree, key: &str, value: &T) -> PamResult<()> {
    let bytes = serde_json::to_vec(value)?;
    tree.insert(key.as_bytes(), bytes)?;
    Ok(())
}

pub(crate) fn get_json<T: DeserializeOwned>(tree: &sled::Tree, key: &str) -> PamResult<Option<T>> {
    match tree.get(key.as_bytes())? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// All values under `prefix`, in key order. Undecodable entries are skipped.
pub(crate) fn scan_json<T: DeserializeOwned>(tree: &sled::Tree, prefix: &str) -> PamResult<Vec<(String, T)>> {
    let mut out = Vec::new();
    for item in tree.scan_prefix(prefix.as_bytes()) {
        let (k, v) = item?;
        let Ok(key) = String::from_utf8(k.to_vec()) else { continue };
        match serde_json::from_slice::<T>(&v) {
            Ok(value) => out.push((key, value)),
            Err(e) => tracing::warn!(target: "pam::store", key = %key, error = %e, "skipping undecodable record"),
        }
    }
    Ok(out)
}
