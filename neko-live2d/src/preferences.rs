//! Per-model preferences (placement and saved pose)
//!
//! Entries are keyed by the model path they were saved under. Lookup
//! tolerates path differences between environments: exact normalized match
//! first, then same file name, then an entry living under the same parent
//! directory.

use crate::error::{Live2DError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use neko_core::{ParameterMap, Scale, Transform, Vec2};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Persisted projection of a model's transform and saved parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferencesSnapshot {
    pub model_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Vec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ParameterMap>,
}

impl PreferencesSnapshot {
    pub fn new(model_uri: impl Into<String>) -> Self {
        Self {
            model_uri: model_uri.into(),
            position: None,
            scale: None,
            parameters: None,
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Some(Vec2::new(x, y));
        self
    }

    pub fn with_scale(mut self, x: f64, y: f64) -> Self {
        self.scale = Some(Vec2::new(x, y));
        self
    }

    pub fn with_parameters(mut self, parameters: ParameterMap) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Transform to apply after load; `None` when neither field is set.
    pub fn transform(&self) -> Option<Transform> {
        let transform = Transform::new(self.position, self.scale.map(Scale::Axes));
        (!transform.is_empty()).then_some(transform)
    }

    /// Only complete, finite placements with a positive scale are stored.
    pub fn is_storable(&self) -> bool {
        match (self.position, self.scale) {
            (Some(position), Some(scale)) => {
                position.is_finite() && scale.is_finite() && scale.x > 0.0 && scale.y > 0.0
            }
            _ => false,
        }
    }
}

#[async_trait]
pub trait PreferencesRepository: Send + Sync {
    async fn load(&self, model_uri: &str) -> Result<Option<PreferencesSnapshot>>;

    /// Persist `snapshot`. Incomplete or invalid placements are ignored.
    async fn save(&self, snapshot: &PreferencesSnapshot) -> Result<()>;
}

/// Strip fragment and query, trim, lowercase.
pub fn normalize_model_path(path: &str) -> String {
    strip_suffixes(path).trim().to_lowercase()
}

/// Last non-empty path segment, fragment and query removed.
pub fn model_file_name(path: &str) -> &str {
    strip_suffixes(path)
        .split('/')
        .filter(|s| !s.is_empty())
        .last()
        .unwrap_or("")
}

fn strip_suffixes(path: &str) -> &str {
    let path = path.split('#').next().unwrap_or("");
    path.split('?').next().unwrap_or("")
}

/// Partially-specified vector as found in stored entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct StoredVec2 {
    #[serde(default)]
    x: Option<f64>,
    #[serde(default)]
    y: Option<f64>,
}

impl StoredVec2 {
    fn finite(self) -> Option<Vec2> {
        match (self.x, self.y) {
            (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Some(Vec2::new(x, y)),
            _ => None,
        }
    }
}

impl From<Vec2> for StoredVec2 {
    fn from(v: Vec2) -> Self {
        Self {
            x: Some(v.x),
            y: Some(v.y),
        }
    }
}

/// One stored entry, as written to the preferences file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredPreference {
    #[serde(default)]
    model_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<StoredVec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scale: Option<StoredVec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parameters: Option<ParameterMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

impl StoredPreference {
    fn to_snapshot(&self, model_uri: &str) -> PreferencesSnapshot {
        PreferencesSnapshot {
            model_uri: model_uri.to_string(),
            position: self.position.and_then(StoredVec2::finite),
            scale: self.scale.and_then(StoredVec2::finite),
            parameters: self.parameters.clone(),
        }
    }
}

/// Stored entries with the lookup and upsert rules shared by every backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
struct PreferenceTable(Vec<StoredPreference>);

impl PreferenceTable {
    /// Exact match, then file name, then an entry under the same parent directory.
    fn pick_best(&self, model_uri: &str) -> Option<&StoredPreference> {
        let target = normalize_model_path(model_uri);
        if target.is_empty() {
            return None;
        }

        if let Some(exact) = self.0.iter().find(|p| normalize_model_path(&p.model_path) == target) {
            return Some(exact);
        }

        let name = model_file_name(model_uri);
        if !name.is_empty() {
            if let Some(by_name) = self.0.iter().find(|p| model_file_name(&p.model_path) == name) {
                return Some(by_name);
            }
        }

        let segments: Vec<&str> = target.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() >= 2 {
            let needle = format!("/{}/", segments[segments.len() - 2]);
            return self.0.iter().find(|p| normalize_model_path(&p.model_path).contains(&needle));
        }

        None
    }

    /// Insert or replace the entry saved under the same normalized path.
    /// Returns `false` when the snapshot is not storable.
    fn upsert(&mut self, snapshot: &PreferencesSnapshot) -> bool {
        if !snapshot.is_storable() {
            return false;
        }
        let entry = StoredPreference {
            model_path: snapshot.model_uri.clone(),
            position: snapshot.position.map(StoredVec2::from),
            scale: snapshot.scale.map(StoredVec2::from),
            parameters: snapshot.parameters.clone(),
            updated_at: Some(Utc::now()),
        };
        let target = normalize_model_path(&snapshot.model_uri);
        match self.0.iter_mut().find(|p| normalize_model_path(&p.model_path) == target) {
            Some(existing) => *existing = entry,
            None => self.0.push(entry),
        }
        true
    }
}

/// Process-local repository
#[derive(Debug, Default)]
pub struct InMemoryPreferences {
    table: RwLock<PreferenceTable>,
}

impl InMemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.read().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.table.write().0.clear();
    }
}

#[async_trait]
impl PreferencesRepository for InMemoryPreferences {
    async fn load(&self, model_uri: &str) -> Result<Option<PreferencesSnapshot>> {
        Ok(self.table.read().pick_best(model_uri).map(|p| p.to_snapshot(model_uri)))
    }

    async fn save(&self, snapshot: &PreferencesSnapshot) -> Result<()> {
        if !self.table.write().upsert(snapshot) {
            debug!("Ignoring incomplete preferences for {}", snapshot.model_uri);
        }
        Ok(())
    }
}

/// Repository backed by one JSON array file
pub struct JsonFilePreferences {
    path: PathBuf,
    /// Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl JsonFilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_table(&self) -> Result<PreferenceTable> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PreferenceTable::default()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(PreferenceTable::default());
        }
        serde_json::from_str(&content).map_err(|e| {
            Live2DError::Preferences(format!("Corrupt preferences file {}: {}", self.path.display(), e))
        })
    }

    async fn write_table(&self, table: &PreferenceTable) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(table)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Every stored snapshot, keyed by the path it was saved under.
    pub async fn all(&self) -> Result<Vec<PreferencesSnapshot>> {
        let _guard = self.lock.lock().await;
        let table = self.read_table().await?;
        Ok(table.0.iter().map(|p| p.to_snapshot(&p.model_path)).collect())
    }

    /// Remove every stored entry.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write_table(&PreferenceTable::default()).await
    }
}

#[async_trait]
impl PreferencesRepository for JsonFilePreferences {
    async fn load(&self, model_uri: &str) -> Result<Option<PreferencesSnapshot>> {
        let _guard = self.lock.lock().await;
        let table = self.read_table().await?;
        Ok(table.pick_best(model_uri).map(|p| p.to_snapshot(model_uri)))
    }

    async fn save(&self, snapshot: &PreferencesSnapshot) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut table = self.read_table().await?;
        if !table.upsert(snapshot) {
            debug!("Ignoring incomplete preferences for {}", snapshot.model_uri);
            return Ok(());
        }
        self.write_table(&table).await.map_err(|e| {
            warn!("Failed to write preferences to {}: {}", self.path.display(), e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_and_file_name() {
        assert_eq!(normalize_model_path("  /Static/Mao/Mao.model3.json?v=2#top "), "/static/mao/mao.model3.json");
        assert_eq!(model_file_name("/static/mao/mao.model3.json?v=2"), "mao.model3.json");
        assert_eq!(model_file_name("dir/"), "dir");
        assert_eq!(model_file_name(""), "");
    }

    #[test]
    fn test_pick_best_priority() {
        let mut table = PreferenceTable::default();
        for path in ["/a/shared/model.json", "/b/mao/mao.model3.json", "/c/mao/other.json"] {
            table.upsert(&PreferencesSnapshot::new(path).with_position(0.0, 0.0).with_scale(1.0, 1.0));
        }

        let exact = table.pick_best("/C/mao/other.json").unwrap();
        assert_eq!(exact.model_path, "/c/mao/other.json");

        let by_name = table.pick_best("https://cdn/x/mao.model3.json").unwrap();
        assert_eq!(by_name.model_path, "/b/mao/mao.model3.json");

        let by_dir = table.pick_best("/elsewhere/shared/renamed.json").unwrap();
        assert_eq!(by_dir.model_path, "/a/shared/model.json");

        assert!(table.pick_best("/nothing/here.json").is_none());
        assert!(table.pick_best("   ").is_none());
    }

    #[test]
    fn test_upsert_rejects_invalid_placement() {
        let mut table = PreferenceTable::default();
        assert!(!table.upsert(&PreferencesSnapshot::new("m").with_position(1.0, 2.0)));
        assert!(!table.upsert(&PreferencesSnapshot::new("m").with_position(1.0, 2.0).with_scale(0.0, 1.0)));
        assert!(!table.upsert(&PreferencesSnapshot::new("m").with_position(f64::NAN, 2.0).with_scale(1.0, 1.0)));
        assert!(table.0.is_empty());

        assert!(table.upsert(&PreferencesSnapshot::new("M").with_position(1.0, 2.0).with_scale(1.0, 1.0)));
        assert!(table.upsert(&PreferencesSnapshot::new("m").with_position(3.0, 4.0).with_scale(1.0, 1.0)));
        assert_eq!(table.0.len(), 1);
        assert_eq!(table.0[0].position, Some(StoredVec2::from(Vec2::new(3.0, 4.0))));
    }

    #[test]
    fn test_partial_stored_vectors_are_dropped() {
        let table: PreferenceTable =
            serde_json::from_str(r#"[{"model_path": "m", "position": {"x": 1.0}, "scale": {"x": 0.5, "y": 0.5}}]"#)
                .unwrap();
        let snapshot = table.pick_best("m").unwrap().to_snapshot("m");
        assert_eq!(snapshot.position, None);
        assert_eq!(snapshot.scale, Some(Vec2::new(0.5, 0.5)));
    }

    #[test]
    fn test_snapshot_transform() {
        assert!(PreferencesSnapshot::new("m").transform().is_none());
        let t = PreferencesSnapshot::new("m").with_scale(0.5, 0.25).transform().unwrap();
        assert_eq!(t.position, None);
        assert_eq!(t.scale, Some(Scale::Axes(Vec2::new(0.5, 0.25))));
    }

    #[test]
    fn test_in_memory_clear() {
        let repository = InMemoryPreferences::new();
        tokio_test::block_on(repository.save(&PreferencesSnapshot::new("m").with_position(1.0, 1.0).with_scale(1.0, 1.0)))
            .unwrap();
        assert_eq!(repository.len(), 1);

        repository.clear();
        assert!(tokio_test::block_on(repository.load("m")).unwrap().is_none());
    }
}
