//! Service Registry store
//!
//! Owned name → endpoint directory with a defined lifecycle: loaded from
//! disk at startup, written back wholesale after every mutation and on a
//! fixed interval, and flushed once more on shutdown.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

pub const DEFAULT_HEALTH_PATH: &str = "/health";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub name: String,
    pub url: String,
    pub health_path: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub last_registered: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn health_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if self.health_path.starts_with('/') {
            format!("{}{}", base, self.health_path)
        } else {
            format!("{}/{}", base, self.health_path)
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Service '{0}' not found")]
    NotFound(String),
    #[error("Failed to persist registry to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to load registry from {path}: {reason}")]
    Load { path: PathBuf, reason: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug)]
pub struct ServiceRegistry {
    services: DashMap<String, ServiceRecord>,
    path: PathBuf,
    /// Serializes writers of the state file
    write_lock: Mutex<()>,
}

impl ServiceRegistry {
    /// Empty registry persisting to `path`; nothing is read from disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            services: DashMap::new(),
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Load the registry from `path`. A missing file yields an empty registry.
    pub async fn load(path: impl Into<PathBuf>) -> RegistryResult<Self> {
        let registry = Self::new(path);
        let raw = match tokio::fs::read(&registry.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "No registry state at {}, starting empty",
                    registry.path.display()
                );
                return Ok(registry);
            }
            Err(e) => {
                return Err(RegistryError::Load {
                    path: registry.path.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let records: BTreeMap<String, ServiceRecord> =
            serde_json::from_slice(&raw).map_err(|e| RegistryError::Load {
                path: registry.path.clone(),
                reason: e.to_string(),
            })?;
        for (name, record) in records {
            registry.services.insert(name, record);
        }
        log::info!(
            "Loaded {} services from {}",
            registry.services.len(),
            registry.path.display()
        );
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn register(
        &self,
        name: Option<String>,
        url: Option<String>,
        health_path: Option<String>,
        metadata: Option<BTreeMap<String, String>>,
    ) -> RegistryResult<ServiceRecord> {
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| RegistryError::BadRequest("serviceName is required".to_string()))?;
        let url = url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| RegistryError::BadRequest("url is required".to_string()))?;

        let record = ServiceRecord {
            name: name.clone(),
            url,
            health_path: health_path
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string()),
            metadata: metadata.unwrap_or_default(),
            last_registered: Utc::now(),
        };

        let _guard = self.write_lock.lock().await;
        let previous = self.services.insert(name.clone(), record.clone());
        if let Err(e) = self.write_snapshot().await {
            match previous {
                Some(previous) => {
                    self.services.insert(name.clone(), previous);
                }
                None => {
                    self.services.remove(&name);
                }
            }
            log::error!("Registration of {} rolled back: {}", name, e);
            return Err(e);
        }
        match previous {
            Some(_) => log::info!("Updated service {} at {}", name, record.url),
            None => log::info!("Registered service {} at {}", name, record.url),
        }
        Ok(record)
    }

    pub async fn unregister(&self, name: &str) -> RegistryResult<ServiceRecord> {
        let _guard = self.write_lock.lock().await;
        let (_, record) = self
            .services
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if let Err(e) = self.write_snapshot().await {
            self.services.insert(name.to_string(), record);
            log::error!("Removal of {} rolled back: {}", name, e);
            return Err(e);
        }
        log::info!("Unregistered service {}", name);
        Ok(record)
    }

    pub fn get(&self, name: &str) -> RegistryResult<ServiceRecord> {
        self.services
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> BTreeMap<String, ServiceRecord> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Write the full map to disk via a temporary sibling file.
    pub async fn persist(&self) -> RegistryResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write_snapshot().await
    }

    /// Caller must hold `write_lock`.
    async fn write_snapshot(&self) -> RegistryResult<()> {
        let snapshot = self.list();
        let persist_err = |source: std::io::Error| RegistryError::Persist {
            path: self.path.clone(),
            source,
        };

        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| persist_err(std::io::Error::other(e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await.map_err(persist_err)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(persist_err)?;
        log::debug!(
            "Persisted {} services to {}",
            snapshot.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Persist the registry every `interval` regardless of mutations.
/// A zero interval disables the task.
pub async fn periodic_persist(registry: Arc<ServiceRegistry>, interval: Duration) {
    if interval.is_zero() {
        log::warn!("Periodic registry persistence disabled: interval is zero");
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = registry.persist().await {
            log::error!("Periodic registry persistence failed: {}", e);
        }
    }
}
