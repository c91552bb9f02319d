use crate::errors::{FaultError, Result};
use crate::runtime::{Runtime, RuntimeValue};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

type Snapshot = HashMap<String, RuntimeValue>;

/// Runtime backed by an atomically swappable snapshot of override values.
///
/// Readers never block; a reload replaces the whole snapshot at once.
#[derive(Debug, Default)]
pub struct SnapshotRuntime {
    snapshot: ArcSwap<Snapshot>,
}

impl SnapshotRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: HashMap<String, RuntimeValue>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(values),
        }
    }

    /// Replace the current snapshot.
    pub fn store(&self, values: HashMap<String, RuntimeValue>) {
        let count = values.len();
        self.snapshot.store(Arc::new(values));
        debug!("Runtime snapshot replaced ({} keys)", count);
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load and install overrides from a JSON object file.
    pub async fn reload_from_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let values = load_overrides_from_file(path).await?;
        let count = values.len();
        self.store(values);
        Ok(count)
    }
}

impl Runtime for SnapshotRuntime {
    fn lookup(&self, key: &str) -> Option<RuntimeValue> {
        self.snapshot.load().get(key).copied()
    }
}

/// Read a JSON object of runtime overrides.
///
/// Entries that are neither an integer nor a `{numerator, denominator}`
/// object are skipped with a warning; only an unreadable file or a
/// non-object document is an error.
pub async fn load_overrides_from_file<P: AsRef<Path>>(path: P) -> Result<Snapshot> {
    let path = path.as_ref();
    info!("Loading runtime overrides from: {}", path.display());

    let contents = tokio::fs::read_to_string(path).await?;
    parse_overrides(&contents)
}

pub fn parse_overrides(contents: &str) -> Result<Snapshot> {
    let document: serde_json::Value = serde_json::from_str(contents)?;
    let object = document.as_object().ok_or_else(|| {
        FaultError::ConfigurationError("runtime overrides must be a JSON object".to_string())
    })?;

    let mut values = HashMap::with_capacity(object.len());
    for (key, raw) in object {
        match serde_json::from_value::<RuntimeValue>(raw.clone()) {
            Ok(value) => {
                values.insert(key.clone(), value);
            }
            Err(e) => {
                let err = FaultError::InvalidPercentage(format!("{}: {}", key, e));
                warn!("Skipping malformed runtime override: {}", err);
            }
        }
    }

    Ok(values)
}
