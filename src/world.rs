//! World save files: discovery on disk and reconciliation with stored records.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{AppError, Result};

const WORLD_EXTENSION: &str = "wld";

/// A stored world record, owned by a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct World {
    pub id: String,
    pub host_id: String,
    pub file_name: String,
    pub display_name: String,
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mods: Vec<String>,
    pub size: Option<String>,
    pub difficulty: Option<String>,
}

/// A world as found on disk, before it has an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldInfo {
    pub file_name: String,
    pub display_name: String,
    pub modified_at: Option<DateTime<Utc>>,
    pub mods: Vec<String>,
    pub size: Option<String>,
    pub difficulty: Option<String>,
}

impl WorldInfo {
    pub fn new(file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        let display_name = Path::new(&file_name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());
        Self {
            file_name,
            display_name,
            modified_at: None,
            mods: Vec::new(),
            size: None,
            difficulty: None,
        }
    }

    fn into_world(self, id: String, host_id: &str) -> World {
        World {
            id,
            host_id: host_id.to_string(),
            file_name: self.file_name,
            display_name: self.display_name,
            modified_at: self.modified_at,
            mods: self.mods,
            size: self.size,
            difficulty: self.difficulty,
        }
    }
}

/// Optional `<file>.json` sidecar next to a save file.
#[derive(Debug, Default, Deserialize)]
struct WorldSidecar {
    #[serde(default)]
    mods: Vec<String>,
    size: Option<String>,
    difficulty: Option<String>,
}

/// Outcome of matching a host's live world list against its stored records.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Existing records whose file is still present, with refreshed fields.
    pub kept: Vec<World>,
    /// Files with no record yet, under fresh identities.
    pub inserted: Vec<World>,
    /// Records whose file is gone.
    pub deleted: Vec<World>,
}

impl Reconciliation {
    /// The host's world set after applying this reconciliation.
    pub fn current(&self) -> impl Iterator<Item = &World> {
        self.kept.iter().chain(self.inserted.iter())
    }
}

/// Match `live` against `existing` by file name. Matching records keep their
/// identity; a file name listed twice in `live` keeps its last entry.
pub fn reconcile(host_id: &str, existing: &[World], live: Vec<WorldInfo>) -> Reconciliation {
    let mut live_by_name: BTreeMap<String, WorldInfo> = BTreeMap::new();
    for info in live {
        live_by_name.insert(info.file_name.clone(), info);
    }

    let mut result = Reconciliation::default();
    for world in existing.iter().filter(|w| w.host_id == host_id) {
        match live_by_name.remove(&world.file_name) {
            Some(info) => result.kept.push(info.into_world(world.id.clone(), host_id)),
            None => result.deleted.push(world.clone()),
        }
    }
    for info in live_by_name.into_values() {
        let id = uuid::Uuid::new_v4().to_string();
        result.inserted.push(info.into_world(id, host_id));
    }
    result
}

/// List `*.wld` save files directly inside `dir`. A missing directory has no worlds.
pub fn discover_worlds(dir: &Path) -> Result<Vec<WorldInfo>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut worlds = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| AppError::io(e.to_string()))?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().map(|e| e != WORLD_EXTENSION).unwrap_or(true)
        {
            continue;
        }

        let mut info = WorldInfo::new(entry.file_name().to_string_lossy());
        info.modified_at = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .map(DateTime::<Utc>::from);

        let sidecar_path = dir.join(format!("{}.json", info.file_name));
        if sidecar_path.exists() {
            match read_sidecar(&sidecar_path) {
                Ok(sidecar) => {
                    info.mods = sidecar.mods;
                    info.size = sidecar.size;
                    info.difficulty = sidecar.difficulty;
                }
                Err(e) => log::warn!("Ignoring world sidecar {:?}: {}", sidecar_path, e),
            }
        }
        worlds.push(info);
    }
    Ok(worlds)
}

fn read_sidecar(path: &Path) -> Result<WorldSidecar> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: &str, file_name: &str) -> World {
        WorldInfo::new(file_name).into_world(id.to_string(), "host-1")
    }

    #[test]
    fn reconcile_keeps_identity_inserts_new_and_deletes_missing() {
        let existing = vec![stored("id-a", "A.wld"), stored("id-b", "B.wld")];
        let mut updated_b = WorldInfo::new("B.wld");
        updated_b.display_name = "Renamed B".to_string();
        updated_b.difficulty = Some("expert".to_string());

        let result = reconcile("host-1", &existing, vec![updated_b, WorldInfo::new("C.wld")]);

        assert_eq!(result.deleted, [stored("id-a", "A.wld")]);
        assert_eq!(result.kept.len(), 1);
        assert_eq!(result.kept[0].id, "id-b");
        assert_eq!(result.kept[0].display_name, "Renamed B");
        assert_eq!(result.kept[0].difficulty.as_deref(), Some("expert"));
        assert_eq!(result.inserted.len(), 1);
        assert_eq!(result.inserted[0].file_name, "C.wld");
        assert!(!["id-a", "id-b"].contains(&result.inserted[0].id.as_str()));
        assert_eq!(result.current().count(), 2);
    }

    #[test]
    fn reconcile_ignores_other_hosts_records() {
        let mut foreign = stored("id-x", "A.wld");
        foreign.host_id = "host-2".to_string();
        let result = reconcile("host-1", &[foreign], Vec::new());
        assert!(result.deleted.is_empty());
    }

    #[test]
    fn duplicate_live_entries_collapse_to_one() {
        let result = reconcile(
            "host-1",
            &[],
            vec![WorldInfo::new("A.wld"), WorldInfo::new("A.wld")],
        );
        assert_eq!(result.inserted.len(), 1);
    }

    #[test]
    fn discovers_save_files_and_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Alpha.wld"), b"x").unwrap();
        std::fs::write(dir.path().join("Beta.wld"), b"x").unwrap();
        std::fs::write(dir.path().join("Beta.wld.bak"), b"x").unwrap();
        std::fs::write(
            dir.path().join("Alpha.wld.json"),
            r#"{"mods": ["CalamityMod"], "size": "large", "difficulty": "master"}"#,
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("Nested.wld")).unwrap();

        let worlds = discover_worlds(dir.path()).unwrap();
        let names: Vec<&str> = worlds.iter().map(|w| w.file_name.as_str()).collect();
        assert_eq!(names, ["Alpha.wld", "Beta.wld"]);
        assert_eq!(worlds[0].display_name, "Alpha");
        assert_eq!(worlds[0].mods, ["CalamityMod"]);
        assert_eq!(worlds[0].size.as_deref(), Some("large"));
        assert!(worlds[0].modified_at.is_some());
        assert!(worlds[1].mods.is_empty());
    }

    #[test]
    fn missing_directory_has_no_worlds() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_worlds(&dir.path().join("nope")).unwrap().is_empty());
    }
}
