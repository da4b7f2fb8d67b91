use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;

use bedjet_common::{RuntimeConfig, Schedule};

pub const DEFAULT_DATA_DIR: &str = "./.bedjet";

pub type RuntimeUpdate = Box<dyn FnOnce(&mut RuntimeConfig) + Send>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig>;
    /// Read-modify-write of the stored runtime document as one step, so writers owning
    /// different fields do not overwrite each other.
    async fn update_runtime_config(&self, update: RuntimeUpdate) -> anyhow::Result<RuntimeConfig>;
    async fn load_schedule(&self) -> anyhow::Result<Schedule>;
    async fn save_schedule(&self, schedule: &Schedule) -> anyhow::Result<()>;
}

/// Pretty-printed JSON documents in one data directory. Missing files read as defaults.
#[derive(Clone)]
pub struct FileStore {
    runtime_path: Arc<PathBuf>,
    schedule_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            schedule_path: Arc::new(data_dir.join("schedule.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("BEDJET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));
        Self::new(data_dir)
    }

    async fn read_runtime(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid {}", self.runtime_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_json(&self, path: &Path, payload: Vec<u8>) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

#[async_trait]
impl Store for FileStore {
    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        self.read_runtime().await
    }

    async fn update_runtime_config(&self, update: RuntimeUpdate) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        let mut runtime = self.read_runtime().await?;
        update(&mut runtime);
        let payload = serde_json::to_vec_pretty(&runtime)?;
        self.write_json(&self.runtime_path, payload).await?;
        Ok(runtime)
    }

    async fn load_schedule(&self) -> anyhow::Result<Schedule> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.schedule_path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<Schedule>(&raw)
                .with_context(|| format!("invalid {}", self.schedule_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Schedule::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_schedule(&self, schedule: &Schedule) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let payload = serde_json::to_vec_pretty(schedule)?;
        self.write_json(&self.schedule_path, payload).await
    }
}
