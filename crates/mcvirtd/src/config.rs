//! Configuration persistence.
//!
//! Every scope is one JSON file: `mcvirt.json` for the global node and
//! cluster config, and `vm/`, `hard_drive/`, `storage/` directories with
//! one `<id>.json` per entity. All writes are read-modify-write callbacks
//! under the store's lock, written atomically (temp file + rename), and
//! recorded with their reason in the node's audit log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

use mcvirt_proto::config::GlobalConfig;
use mcvirt_proto::hard_drive::HardDriveConfig;
use mcvirt_proto::storage::StorageBackendConfig;
use mcvirt_proto::vm::VmConfig;
use mcvirt_proto::{McvError, McvResult};

pub const GLOBAL_CONFIG_FILE: &str = "mcvirt.json";
pub const AUDIT_LOG_FILE: &str = "audit.log";

/// Append-only log of every config change.
pub struct AuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub async fn record(&self, user: &str, reason: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let line = format!("{} {} {}\n", now, user, reason.replace('\n', " "));

        let _guard = self.lock.lock().await;
        let result = async {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            error!("failed to append to audit log {}: {}", self.path.display(), e);
        }
    }
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> McvResult<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &data).await.map_err(|e| {
        error!("failed to write config to {}: {}", tmp.display(), e);
        McvError::Io(format!("write {}: {}", tmp.display(), e))
    })?;
    fs::rename(&tmp, path).await.map_err(|e| {
        error!("failed to replace config {}: {}", path.display(), e);
        McvError::Io(format!("rename {}: {}", path.display(), e))
    })
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> McvResult<T> {
    let data = fs::read(path)
        .await
        .map_err(|e| McvError::Io(format!("read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&data).map_err(|e| {
        error!("corrupt config file {}: {}", path.display(), e);
        McvError::Config(format!("{}: {}", path.display(), e))
    })
}

/// A single JSON document.
pub struct JsonStore<T> {
    path: PathBuf,
    audit: Arc<AuditLog>,
    state: Mutex<T>,
}

impl<T> JsonStore<T>
where
    T: Clone + Serialize + DeserializeOwned + Send,
{
    /// Load from `path`, or create it from `init` if it does not exist.
    pub async fn open(path: PathBuf, audit: Arc<AuditLog>, init: impl FnOnce() -> T) -> McvResult<Self> {
        let value = if fs::try_exists(&path).await.unwrap_or(false) {
            read_json(&path).await?
        } else {
            let value = init();
            write_atomic(&path, &value).await?;
            debug!("created config {}", path.display());
            value
        };
        Ok(Self {
            path,
            audit,
            state: Mutex::new(value),
        })
    }

    /// Snapshot of the latest committed value.
    pub async fn get(&self) -> T {
        self.state.lock().await.clone()
    }

    /// Apply `f` to the latest committed value and persist the result.
    /// Nothing is written if `f` fails.
    pub async fn update<R>(
        &self,
        user: &str,
        reason: &str,
        f: impl FnOnce(&mut T) -> McvResult<R>,
    ) -> McvResult<R> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let result = f(&mut next)?;
        write_atomic(&self.path, &next).await?;
        *state = next;
        drop(state);

        debug!("config {} updated: {}", self.path.display(), reason);
        self.audit.record(user, reason).await;
        Ok(result)
    }
}

/// A directory of JSON documents keyed by entity ID.
pub struct EntityStore<T> {
    dir: PathBuf,
    audit: Arc<AuditLog>,
    state: Mutex<BTreeMap<String, T>>,
}

impl<T> EntityStore<T>
where
    T: Clone + Serialize + DeserializeOwned + Send,
{
    pub async fn open(dir: PathBuf, audit: Arc<AuditLog>) -> McvResult<Self> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| McvError::Io(format!("create {}: {}", dir.display(), e)))?;

        let mut entities = BTreeMap::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| McvError::Io(format!("read {}: {}", dir.display(), e)))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            entities.insert(id, read_json(&path).await?);
        }

        Ok(Self {
            dir,
            audit,
            state: Mutex::new(entities),
        })
    }

    fn path_of(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        self.state.lock().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<T> {
        self.state.lock().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.state.lock().await.contains_key(id)
    }

    /// Write (or with `None` remove) one entity. Returns the previous value.
    pub async fn put(&self, user: &str, reason: &str, id: &str, value: Option<T>) -> McvResult<Option<T>> {
        let mut state = self.state.lock().await;
        let path = self.path_of(id);
        let previous = match value {
            Some(value) => {
                write_atomic(&path, &value).await?;
                state.insert(id.to_string(), value)
            }
            None => {
                if fs::try_exists(&path).await.unwrap_or(false) {
                    fs::remove_file(&path)
                        .await
                        .map_err(|e| McvError::Io(format!("remove {}: {}", path.display(), e)))?;
                }
                state.remove(id)
            }
        };
        drop(state);

        debug!("config {} updated: {}", path.display(), reason);
        self.audit.record(user, reason).await;
        Ok(previous)
    }

    /// Drop one entity but keep its document on disk as `<id>.json.kept`,
    /// out of reach of the next `open`. Returns the previous value.
    pub async fn forget(&self, user: &str, reason: &str, id: &str) -> McvResult<Option<T>> {
        let mut state = self.state.lock().await;
        let path = self.path_of(id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            let kept = path.with_extension("json.kept");
            fs::rename(&path, &kept)
                .await
                .map_err(|e| McvError::Io(format!("rename {}: {}", path.display(), e)))?;
        }
        let previous = state.remove(id);
        drop(state);

        debug!("config {} forgotten: {}", path.display(), reason);
        self.audit.record(user, reason).await;
        Ok(previous)
    }

    /// Apply `f` to one entity. Returns `(previous, updated)`.
    pub async fn update<R>(
        &self,
        user: &str,
        reason: &str,
        id: &str,
        f: impl FnOnce(&mut T) -> McvResult<R>,
    ) -> McvResult<(T, R)> {
        let mut state = self.state.lock().await;
        let previous = state
            .get(id)
            .cloned()
            .ok_or_else(|| McvError::Config(format!("no config for {}", id)))?;
        let mut next = previous.clone();
        let result = f(&mut next)?;
        write_atomic(&self.path_of(id), &next).await?;
        state.insert(id.to_string(), next);
        drop(state);

        debug!("config {} updated: {}", id, reason);
        self.audit.record(user, reason).await;
        Ok((previous, result))
    }
}

/// Every config store of one node.
pub struct ConfigStores {
    pub global: JsonStore<GlobalConfig>,
    pub vms: EntityStore<VmConfig>,
    pub hard_drives: EntityStore<HardDriveConfig>,
    pub storage: EntityStore<StorageBackendConfig>,
}

impl ConfigStores {
    pub async fn open(data_dir: &Path) -> McvResult<Self> {
        fs::create_dir_all(data_dir)
            .await
            .map_err(|e| McvError::Io(format!("create {}: {}", data_dir.display(), e)))?;
        let audit = Arc::new(AuditLog::new(data_dir.join(AUDIT_LOG_FILE)));
        Ok(Self {
            global: JsonStore::open(data_dir.join(GLOBAL_CONFIG_FILE), audit.clone(), GlobalConfig::default)
                .await?,
            vms: EntityStore::open(data_dir.join("vm"), audit.clone()).await?,
            hard_drives: EntityStore::open(data_dir.join("hard_drive"), audit.clone()).await?,
            storage: EntityStore::open(data_dir.join("storage"), audit).await?,
        })
    }

    pub async fn vm(&self, id: &str) -> McvResult<VmConfig> {
        self.vms
            .get(id)
            .await
            .ok_or_else(|| McvError::VmDoesNotExist(id.to_string()))
    }

    pub async fn vm_by_name(&self, name: &str) -> McvResult<VmConfig> {
        self.vms
            .list()
            .await
            .into_iter()
            .find(|vm| vm.name == name)
            .ok_or_else(|| McvError::VmDoesNotExist(name.to_string()))
    }

    pub async fn hard_drive(&self, id: &str) -> McvResult<HardDriveConfig> {
        self.hard_drives
            .get(id)
            .await
            .ok_or_else(|| McvError::HardDriveDoesNotExist(id.to_string()))
    }

    pub async fn storage_backend(&self, id: &str) -> McvResult<StorageBackendConfig> {
        self.storage
            .get(id)
            .await
            .ok_or_else(|| McvError::StorageBackendDoesNotExist(id.to_string()))
    }

    pub async fn storage_backend_by_name(&self, name: &str) -> McvResult<StorageBackendConfig> {
        self.storage
            .list()
            .await
            .into_iter()
            .find(|sb| sb.name == name || sb.id == name)
            .ok_or_else(|| McvError::StorageBackendDoesNotExist(name.to_string()))
    }

    /// Hard drive `disk_number` of VM `vm`.
    pub async fn vm_disk(&self, vm: &VmConfig, disk_number: u32) -> McvResult<HardDriveConfig> {
        for id in &vm.hard_drives {
            let hdd = self.hard_drive(id).await?;
            if hdd.disk_number == disk_number {
                return Ok(hdd);
            }
        }
        Err(McvError::HardDriveDoesNotExist(format!("{} disk {}", vm.name, disk_number)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcvirt_proto::vm::VmConfig;

    #[tokio::test]
    async fn test_global_store_create_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let stores = ConfigStores::open(dir.path()).await.unwrap();
            stores
                .global
                .update("admin", "set cluster ip", |cfg| {
                    cfg.cluster.cluster_ip = Some("10.0.0.1".into());
                    Ok(())
                })
                .await
                .unwrap();
        }
        let stores = ConfigStores::open(dir.path()).await.unwrap();
        let cfg = stores.global.get().await;
        assert_eq!(cfg.cluster.cluster_ip.as_deref(), Some("10.0.0.1"));

        let audit = std::fs::read_to_string(dir.path().join(AUDIT_LOG_FILE)).unwrap();
        assert!(audit.trim_end().ends_with("admin set cluster ip"));
    }

    #[tokio::test]
    async fn test_forgotten_entity_keeps_its_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let stores = ConfigStores::open(dir.path()).await.unwrap();
            let vm = VmConfig::new("vm-1".into(), "vm1".into(), 1, 512 * 1024 * 1024);
            stores.vms.put("admin", "write", "vm-1", Some(vm.clone())).await.unwrap();
            let prev = stores.vms.forget("admin", "delete", "vm-1").await.unwrap();
            assert_eq!(prev, Some(vm));
            assert!(stores.vms.get("vm-1").await.is_none());
        }
        let stores = ConfigStores::open(dir.path()).await.unwrap();
        assert!(!stores.vms.contains("vm-1").await);
        let kept = std::fs::read_dir(dir.path().join("vm"))
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name() == "vm-1.json.kept");
        assert!(kept);
    }

    #[tokio::test]
    async fn test_failed_update_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let stores = ConfigStores::open(dir.path()).await.unwrap();
        let result: McvResult<()> = stores
            .global
            .update("admin", "doomed", |cfg| {
                cfg.networks.insert("Production".into(), "eth0".into());
                Err(McvError::InvalidArguments("no".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(stores.global.get().await.networks.is_empty());
    }

    #[tokio::test]
    async fn test_entity_store_put_update_remove() {
        let dir = tempfile::tempdir().unwrap();
        let stores = ConfigStores::open(dir.path()).await.unwrap();
        let vm = VmConfig::new("vm-1".into(), "vm1".into(), 1, 512);
        assert!(stores.vms.put("admin", "create", "vm-1", Some(vm)).await.unwrap().is_none());
        assert!(dir.path().join("vm/vm-1.json").exists());

        let (prev, ()) = stores
            .vms
            .update("admin", "cpu", "vm-1", |vm| {
                vm.cpu_cores = 4;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(prev.cpu_cores, 1);
        assert_eq!(stores.vm_by_name("vm1").await.unwrap().cpu_cores, 4);

        let removed = stores.vms.put("admin", "delete", "vm-1", None).await.unwrap();
        assert_eq!(removed.unwrap().cpu_cores, 4);
        assert!(!dir.path().join("vm/vm-1.json").exists());
        assert!(matches!(stores.vm("vm-1").await, Err(McvError::VmDoesNotExist(_))));
    }
}
