//! Persistence of hosts, instances and worlds.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::host::Host;
use crate::instance::Instance;
use crate::world::{reconcile, World, WorldInfo};

/// Whole-record storage for the fleet. Every `update_*` is an atomic
/// read-modify-write: if the closure fails, nothing is stored.
pub trait FleetStore: Send + Sync {
    fn host(&self, id: &str) -> Result<Host>;
    fn hosts(&self) -> Result<Vec<Host>>;
    fn upsert_host(&self, host: Host) -> Result<()>;
    fn update_host(&self, id: &str, f: &mut dyn FnMut(&mut Host) -> Result<()>) -> Result<Host>;

    fn instance(&self, id: &str) -> Result<Instance>;
    fn instances_for_host(&self, host_id: &str) -> Result<Vec<Instance>>;
    fn upsert_instance(&self, instance: Instance) -> Result<()>;
    fn update_instance(
        &self,
        id: &str,
        f: &mut dyn FnMut(&Instance) -> Result<Instance>,
    ) -> Result<Instance>;
    fn remove_instance(&self, id: &str) -> Result<Instance>;

    fn worlds_for_host(&self, host_id: &str) -> Result<Vec<World>>;
    /// Replace a host's worlds with `live`, keeping the identity of records
    /// whose file name is still present.
    fn reconcile_worlds(&self, host_id: &str, live: Vec<WorldInfo>) -> Result<Vec<World>>;
}

/// Run a store operation on tokio's blocking pool. Store calls do file
/// I/O and may wait on another process's lock.
pub async fn blocking<T, F>(store: &Arc<dyn FleetStore>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn FleetStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| AppError::other(format!("Store task failed: {}", e)))?
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FleetSnapshot {
    #[serde(default)]
    hosts: BTreeMap<String, Host>,
    #[serde(default)]
    instances: BTreeMap<String, Instance>,
    #[serde(default)]
    worlds: BTreeMap<String, World>,
}

/// Identity of one version of the store file. Every save replaces the file,
/// so a different inode, size or mtime means someone else wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    #[cfg(unix)]
    inode: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Result<Option<Self>> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AppError::io(format!(
                    "Failed to stat {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(Some(Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
            #[cfg(unix)]
            inode: std::os::unix::fs::MetadataExt::ino(&metadata),
        }))
    }
}

struct Cached {
    snapshot: Arc<FleetSnapshot>,
    stamp: Option<FileStamp>,
}

/// Exclusive lock on the store's lock file, held for one read-modify-write.
/// The data file itself is replaced on every save, so it cannot carry the
/// lock.
struct FileLock {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<fs::File>,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| AppError::io(format!("Failed to open {}: {}", path.display(), e)))?;

        #[cfg(unix)]
        {
            use nix::fcntl::{Flock, FlockArg};
            let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
                AppError::io(format!("Failed to lock {}: {}", path.display(), errno))
            })?;
            Ok(Self { _lock: lock })
        }
        #[cfg(not(unix))]
        {
            drop(file);
            Ok(Self {})
        }
    }
}

/// [`FleetStore`] kept in a single JSON file, cached in memory.
///
/// Several processes may share the file (the daemon and operator commands).
/// Reads pick up a file replaced by another process; writes serialise on
/// `<file>.lock` and start from the latest file contents.
pub struct JsonStore {
    path: PathBuf,
    lock_path: PathBuf,
    write_lock: Mutex<()>,
    cache: RwLock<Cached>,
}

impl JsonStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (snapshot, stamp) = load_snapshot(&path)?;

        Ok(Self {
            lock_path: path.with_extension("json.lock"),
            path,
            write_lock: Mutex::new(()),
            cache: RwLock::new(Cached {
                snapshot: Arc::new(snapshot),
                stamp,
            }),
        })
    }

    /// The current records, reloaded first if the file changed on disk.
    fn snapshot(&self) -> Result<Arc<FleetSnapshot>> {
        let stamp = FileStamp::of(&self.path)?;
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if cache.stamp == stamp {
                return Ok(Arc::clone(&cache.snapshot));
            }
        }

        log::debug!("Store {} changed on disk, reloading", self.path.display());
        let (snapshot, stamp) = load_snapshot(&self.path)?;
        let snapshot = Arc::new(snapshot);
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Cached {
            snapshot: Arc::clone(&snapshot),
            stamp,
        };
        Ok(snapshot)
    }

    /// Read-modify-write under the store lock. The file and the cache are
    /// only replaced once `f` has succeeded.
    fn with_snapshot_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut FleetSnapshot) -> Result<T>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _file_lock = FileLock::acquire(&self.lock_path)?;

        let mut updated = (*self.snapshot()?).clone();
        let result = f(&mut updated)?;
        save_snapshot(&self.path, &updated)?;

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Cached {
            snapshot: Arc::new(updated),
            stamp: FileStamp::of(&self.path)?,
        };

        Ok(result)
    }
}

/// Read the file and the stamp it was read under. The stamp is taken first,
/// so a concurrent replace at worst causes one extra reload.
fn load_snapshot(path: &Path) -> Result<(FleetSnapshot, Option<FileStamp>)> {
    let stamp = FileStamp::of(path)?;
    if stamp.is_none() {
        return Ok((FleetSnapshot::default(), None));
    }
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((FleetSnapshot::default(), None))
        }
        Err(e) => {
            return Err(AppError::io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    let snapshot = serde_json::from_str(&content)
        .map_err(|e| AppError::io(format!("Corrupt store {}: {}", path.display(), e)))?;
    Ok((snapshot, stamp))
}

fn save_snapshot(path: &Path, snapshot: &FleetSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)
        .map_err(|e| AppError::io(format!("Failed to write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path)
        .map_err(|e| AppError::io(format!("Failed to replace {}: {}", path.display(), e)))
}

impl FleetStore for JsonStore {
    fn host(&self, id: &str) -> Result<Host> {
        self.snapshot()?
            .hosts
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::host_not_found(id))
    }

    fn hosts(&self) -> Result<Vec<Host>> {
        Ok(self.snapshot()?.hosts.values().cloned().collect())
    }

    fn upsert_host(&self, host: Host) -> Result<()> {
        self.with_snapshot_mut(|snapshot| {
            snapshot.hosts.insert(host.id.clone(), host);
            Ok(())
        })
    }

    fn update_host(&self, id: &str, f: &mut dyn FnMut(&mut Host) -> Result<()>) -> Result<Host> {
        self.with_snapshot_mut(|snapshot| {
            let host = snapshot
                .hosts
                .get_mut(id)
                .ok_or_else(|| AppError::host_not_found(id))?;
            f(host)?;
            Ok(host.clone())
        })
    }

    fn instance(&self, id: &str) -> Result<Instance> {
        self.snapshot()?
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::instance_not_found(id))
    }

    fn instances_for_host(&self, host_id: &str) -> Result<Vec<Instance>> {
        Ok(self
            .snapshot()?
            .instances
            .values()
            .filter(|instance| instance.host_id == host_id)
            .cloned()
            .collect())
    }

    fn upsert_instance(&self, instance: Instance) -> Result<()> {
        self.with_snapshot_mut(|snapshot| {
            if !snapshot.hosts.contains_key(&instance.host_id) {
                return Err(AppError::host_not_found(&instance.host_id));
            }
            snapshot.instances.insert(instance.id.clone(), instance);
            Ok(())
        })
    }

    fn update_instance(
        &self,
        id: &str,
        f: &mut dyn FnMut(&Instance) -> Result<Instance>,
    ) -> Result<Instance> {
        self.with_snapshot_mut(|snapshot| {
            let current = snapshot
                .instances
                .get(id)
                .ok_or_else(|| AppError::instance_not_found(id))?;
            let updated = f(current)?;
            if updated.id != current.id || updated.host_id != current.host_id {
                return Err(AppError::illegal_state("Instance identity cannot change"));
            }
            snapshot.instances.insert(id.to_string(), updated.clone());
            Ok(updated)
        })
    }

    fn remove_instance(&self, id: &str) -> Result<Instance> {
        self.with_snapshot_mut(|snapshot| {
            snapshot
                .instances
                .remove(id)
                .ok_or_else(|| AppError::instance_not_found(id))
        })
    }

    fn worlds_for_host(&self, host_id: &str) -> Result<Vec<World>> {
        Ok(self
            .snapshot()?
            .worlds
            .values()
            .filter(|world| world.host_id == host_id)
            .cloned()
            .collect())
    }

    fn reconcile_worlds(&self, host_id: &str, live: Vec<WorldInfo>) -> Result<Vec<World>> {
        self.with_snapshot_mut(|snapshot| {
            if !snapshot.hosts.contains_key(host_id) {
                return Err(AppError::host_not_found(host_id));
            }
            let existing: Vec<World> = snapshot.worlds.values().cloned().collect();
            let result = reconcile(host_id, &existing, live);

            for world in &result.deleted {
                snapshot.worlds.remove(&world.id);
                log::info!("Removed world {} from host {}", world.file_name, host_id);
            }
            for world in result.current() {
                snapshot.worlds.insert(world.id.clone(), world.clone());
            }
            Ok(result.current().cloned().collect())
        })
    }
}
