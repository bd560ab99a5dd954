//! Operational helpers: logging and persisted operator preferences.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use iris_types::{config::OpsConfig, IrisError, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use tracing_subscriber::{fmt, fmt::MakeWriter, EnvFilter};

pub fn init_tracing(config: &OpsConfig) -> Result<()> {
    init_tracing_with_writer(config, std::io::stdout)
}

/// Same as [`init_tracing`] but sends output to `writer`, e.g. a log file
/// while a terminal dashboard owns stdout.
pub fn init_tracing_with_writer<W>(config: &OpsConfig, writer: W) -> Result<()>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_new(config.log_level.clone())
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| ops_error(format!("failed to create log filter: {err}")))?;

    fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
        .map_err(|err| ops_error(format!("tracing init error: {err}")))?;
    Ok(())
}

pub fn ops_error(message: impl Into<String>) -> IrisError {
    IrisError::Ops(message.into())
}

/// Opt-in key/value preferences backed by a single JSON file.
///
/// Changes stay in memory until [`PreferenceStore::save`]; the file is
/// replaced atomically so a crash never leaves it half written.
#[derive(Clone)]
pub struct PreferenceStore {
    path: PathBuf,
    values: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl PreferenceStore {
    /// Loads `path`, starting empty when the file does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents).map_err(|err| {
                ops_error(format!("invalid preferences file {}: {err}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(ops_error(format!(
                    "unable to read preferences {}: {err}",
                    path.display()
                )))
            }
        };
        debug!("Loaded {} preference(s) from {:?}", values.len(), path);
        Ok(Self {
            path,
            values: Arc::new(Mutex::new(values)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let values = self.values.lock().await;
        values
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|err| ops_error(format!("preference {key} has wrong shape: {err}")))
            })
            .transpose()
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|err| ops_error(format!("preference {key} not serializable: {err}")))?;
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.values.lock().await.remove(key).is_some()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.values.lock().await.keys().cloned().collect()
    }

    pub async fn save(&self) -> Result<()> {
        let contents = {
            let values = self.values.lock().await;
            serde_json::to_string_pretty(&*values)
                .map_err(|err| ops_error(format!("failed to encode preferences: {err}")))?
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|err| ops_error(format!("failed to write {}: {err}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| ops_error(format!("failed to replace {}: {err}", self.path.display())))?;
        info!("Preferences saved to {:?}", self.path);
        Ok(())
    }
}

pub fn ensure_dir(path: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(path)
        .map_err(|err| ops_error(format!("failed to create {}: {err}", path.display())))?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_types::config::PrivacyConfig;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("iris-ops-{}-{}", name, std::process::id()))
            .join("prefs.json")
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let store = PreferenceStore::open(scratch("missing")).unwrap();
        assert!(store.keys().await.is_empty());
        assert_eq!(store.get::<String>("url").await.unwrap(), None);
    }

    #[tokio::test]
    async fn values_survive_save_and_reopen() {
        let path = scratch("roundtrip");
        let store = PreferenceStore::open(&path).unwrap();
        let privacy = PrivacyConfig {
            enable_age: false,
            ..PrivacyConfig::default()
        };
        store.set("privacy", &privacy).await.unwrap();
        store.set("url", &"ws://example:5001/ws").await.unwrap();
        store.save().await.unwrap();

        let reopened = PreferenceStore::open(&path).unwrap();
        assert_eq!(
            reopened.get::<PrivacyConfig>("privacy").await.unwrap(),
            Some(privacy)
        );
        assert!(reopened.remove("url").await);
        assert!(!reopened.remove("url").await);
        assert_eq!(reopened.keys().await, vec!["privacy".to_string()]);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn wrong_shape_is_an_ops_error() {
        let store = PreferenceStore::open(scratch("shape")).unwrap();
        store.set("interval", &"fast").await.unwrap();
        let err = store.get::<u64>("interval").await.unwrap_err();
        assert!(matches!(err, IrisError::Ops(_)));
    }

    #[test]
    fn corrupt_file_is_rejected() {
        let path = scratch("corrupt");
        ensure_dir(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(PreferenceStore::open(&path), Err(IrisError::Ops(_))));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
