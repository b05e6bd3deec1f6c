//! Snapshot cache: immutable state captures at stage boundaries.
//!
//! A snapshot is taken when a join stage or a stage with a named checkpoint
//! completes. Resuming from one clones the captured store, clears every key
//! produced by a stage that is not the boundary or one of its ancestors,
//! applies caller overrides and yields a [`RunPlan`] in which the boundary
//! and its ancestors are already complete. Those stages are never re-invoked.
//!
//! Snapshots live until their TTL passes or they are invalidated explicitly.
//! Nothing invalidates them when upstream data changes.

use crate::errors::{OrchestratorError, Result};
use crate::graph::{BranchFailure, JoinReport, PipelineGraph, StageId, StageIndex};
use crate::scheduler::RunPlan;
use crate::state::{PartialState, State, StateStore};
use cascade_common::{RunId, SnapshotId, ValidationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Immutable copy of a run's state store at a stage boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub run_id: RunId,
    pub graph_id: String,
    /// Checkpoint name, or `after:<stage>` for automatic join snapshots.
    pub boundary: String,
    /// Stage whose completion triggered the snapshot.
    pub stage: StageId,
    pub created_at: DateTime<Utc>,
    pub store: StateStore,
    #[serde(default)]
    pub record: BoundaryRecord,
}

/// Scheduler bookkeeping that is not part of the state store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundaryRecord {
    /// Branch outcomes per parallel group, in arrival order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<JoinReport>,
    /// Last validation of the run, if the validator had run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

impl BoundaryRecord {
    /// Keep only what restored stages produced.
    pub fn restrict_to(&self, graph: &PipelineGraph, restored: &BTreeSet<StageIndex>) -> Self {
        let kept = |stage: &str| graph.index_of(stage).is_some_and(|i| restored.contains(&i));
        let joins = self
            .joins
            .iter()
            .filter_map(|report| {
                let completed: Vec<StageId> = report
                    .completed
                    .iter()
                    .filter(|stage| kept(stage))
                    .cloned()
                    .collect();
                let failed: Vec<BranchFailure> = report
                    .failed
                    .iter()
                    .filter(|f| kept(&f.stage))
                    .cloned()
                    .collect();
                if completed.is_empty() && failed.is_empty() {
                    return None;
                }
                Some(JoinReport {
                    group: report.group.clone(),
                    completed,
                    failed,
                })
            })
            .collect();
        let validation = match graph.validator_index() {
            Some(v) if restored.contains(&v) => self.validation.clone(),
            _ => None,
        };
        Self { joins, validation }
    }
}

impl Snapshot {
    pub fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        let Some(ttl) = ttl else {
            return false;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.created_at > ttl,
            Err(_) => false,
        }
    }

    pub fn state(&self) -> State {
        self.store.view()
    }

    pub fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            id: self.id,
            run_id: self.run_id,
            graph_id: self.graph_id.clone(),
            boundary: self.boundary.clone(),
            stage: self.stage.clone(),
            created_at: self.created_at,
            keys: self.store.len(),
        }
    }
}

/// Listing entry for a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub run_id: RunId,
    pub graph_id: String,
    pub boundary: String,
    pub stage: StageId,
    pub created_at: DateTime<Utc>,
    pub keys: usize,
}

/// Shared, long-lived store of snapshots.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: RwLock<HashMap<SnapshotId, Arc<Snapshot>>>,
    ttl: Option<Duration>,
    dir: Option<PathBuf>,
}

impl SnapshotCache {
    /// In-memory cache. `ttl` of `None` keeps snapshots until invalidated.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            dir: None,
        }
    }

    /// Also write each snapshot to `<dir>/<snapshot-id>.json`.
    pub fn with_persistence(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Capture `store` at a stage boundary.
    pub fn snapshot(
        &self,
        run_id: RunId,
        graph_id: &str,
        boundary: &str,
        stage: &str,
        store: StateStore,
    ) -> Result<SnapshotId> {
        self.snapshot_with_record(run_id, graph_id, boundary, stage, store, BoundaryRecord::default())
    }

    /// Capture `store` together with the run's join and validation record.
    pub fn snapshot_with_record(
        &self,
        run_id: RunId,
        graph_id: &str,
        boundary: &str,
        stage: &str,
        store: StateStore,
        record: BoundaryRecord,
    ) -> Result<SnapshotId> {
        let snapshot = Snapshot {
            id: SnapshotId::new(),
            run_id,
            graph_id: graph_id.to_string(),
            boundary: boundary.to_string(),
            stage: stage.to_string(),
            created_at: Utc::now(),
            store,
            record,
        };
        let id = snapshot.id;

        if let Some(dir) = &self.dir {
            persist(dir, &snapshot)?;
        }
        self.write()?.insert(id, Arc::new(snapshot));

        debug!(snapshot_id = %id, run_id = %run_id, boundary, stage, "snapshot created");
        Ok(id)
    }

    /// Fetch a live snapshot. Expired entries are evicted on access.
    pub fn get(&self, id: SnapshotId) -> Result<Arc<Snapshot>> {
        let snapshot = self
            .read()?
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::SnapshotNotFound(id))?;

        if snapshot.is_expired(self.ttl, Utc::now()) {
            self.invalidate(id)?;
            return Err(OrchestratorError::SnapshotNotFound(id));
        }
        Ok(snapshot)
    }

    /// Prepare a new run rooted at the snapshot's boundary.
    ///
    /// Overrides may only target input keys or keys produced by the boundary
    /// stage or its ancestors.
    pub fn resume_plan(
        &self,
        id: SnapshotId,
        graph: Arc<PipelineGraph>,
        overrides: PartialState,
    ) -> Result<RunPlan> {
        let snapshot = self.get(id)?;
        if snapshot.graph_id != graph.id() {
            return Err(OrchestratorError::InvalidGraph(format!(
                "Snapshot {} was taken from graph '{}', not '{}'",
                id,
                snapshot.graph_id,
                graph.id()
            )));
        }
        let boundary = graph.index_of(&snapshot.stage).ok_or_else(|| {
            OrchestratorError::InvalidGraph(format!(
                "Snapshot boundary stage '{}' is not part of graph '{}'",
                snapshot.stage,
                graph.id()
            ))
        })?;

        let mut restored = graph.ancestors(boundary);
        restored.insert(boundary);

        let mut store = snapshot.store.clone();
        for (index, node) in graph.nodes().iter().enumerate() {
            if !restored.contains(&index) {
                store.clear_stage_outputs(node.id(), &node.descriptor.writes);
            }
        }

        for (key, value) in overrides {
            if let Some(&producer) = graph
                .producers_of(&key)
                .iter()
                .find(|&&p| !restored.contains(&p))
            {
                return Err(OrchestratorError::InvalidOverride {
                    reason: format!(
                        "produced by '{}' downstream of boundary '{}'",
                        graph.stage_id(producer),
                        snapshot.boundary
                    ),
                    key,
                });
            }
            store.apply_override(&key, value)?;
        }

        let record = snapshot.record.restrict_to(&graph, &restored);
        let run_id = RunId::new();
        info!(
            snapshot_id = %id,
            run_id = %run_id,
            boundary = %snapshot.boundary,
            restored = restored.len(),
            "resuming from snapshot"
        );

        Ok(RunPlan {
            run_id,
            graph,
            store,
            restored,
            resumed_from: Some(id),
            record,
        })
    }

    /// Drop a snapshot. Returns whether it existed.
    pub fn invalidate(&self, id: SnapshotId) -> Result<bool> {
        let existed = self.write()?.remove(&id).is_some();
        let removed_file = match &self.dir {
            Some(dir) => remove_file(&snapshot_path(dir, id))?,
            None => false,
        };
        Ok(existed || removed_file)
    }

    /// Drop every snapshot taken by a run.
    pub fn invalidate_run(&self, run_id: RunId) -> Result<usize> {
        let ids: Vec<SnapshotId> = self
            .read()?
            .values()
            .filter(|s| s.run_id == run_id)
            .map(|s| s.id)
            .collect();
        for id in &ids {
            self.invalidate(*id)?;
        }
        Ok(ids.len())
    }

    /// Drop every snapshot older than the TTL.
    pub fn evict_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<SnapshotId> = self
            .read()?
            .values()
            .filter(|s| s.is_expired(self.ttl, now))
            .map(|s| s.id)
            .collect();
        for id in &expired {
            self.invalidate(*id)?;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "evicted expired snapshots");
        }
        Ok(expired.len())
    }

    /// Live snapshots, oldest first.
    pub fn list(&self) -> Result<Vec<SnapshotInfo>> {
        let now = Utc::now();
        let mut infos: Vec<SnapshotInfo> = self
            .read()?
            .values()
            .filter(|s| !s.is_expired(self.ttl, now))
            .map(|s| s.info())
            .collect();
        infos.sort_by_key(|i| i.created_at);
        Ok(infos)
    }

    /// Most recent live snapshot a run took at `boundary`.
    pub fn find(&self, run_id: RunId, boundary: &str) -> Result<Option<SnapshotId>> {
        Ok(self
            .list()?
            .into_iter()
            .rfind(|i| i.run_id == run_id && i.boundary == boundary)
            .map(|i| i.id))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    /// Load persisted snapshots from the persistence directory.
    ///
    /// Unreadable files are skipped with a warning and expired ones removed.
    /// Returns the number of snapshots loaded.
    pub fn load_from_disk(&self) -> Result<usize> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }

        let entries = std::fs::read_dir(dir).map_err(|source| OrchestratorError::Persistence {
            what: "snapshot directory",
            path: dir.clone(),
            source,
        })?;

        let now = Utc::now();
        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let snapshot: Snapshot = match std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
            {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "skipping unreadable snapshot");
                    continue;
                }
            };
            if snapshot.is_expired(self.ttl, now) {
                remove_file(&path)?;
                continue;
            }
            self.write()?.insert(snapshot.id, Arc::new(snapshot));
            loaded += 1;
        }
        debug!(dir = %dir.display(), loaded, "loaded persisted snapshots");
        Ok(loaded)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<SnapshotId, Arc<Snapshot>>>> {
        self.entries
            .read()
            .map_err(|_| OrchestratorError::LockPoisoned("snapshot cache"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<SnapshotId, Arc<Snapshot>>>> {
        self.entries
            .write()
            .map_err(|_| OrchestratorError::LockPoisoned("snapshot cache"))
    }
}

fn snapshot_path(dir: &Path, id: SnapshotId) -> PathBuf {
    dir.join(format!("{}.json", id))
}

fn persist(dir: &Path, snapshot: &Snapshot) -> Result<()> {
    let path = snapshot_path(dir, snapshot.id);
    let io_err = |source| OrchestratorError::Persistence {
        what: "snapshot",
        path: path.clone(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(&path, bytes).map_err(io_err)
}

fn remove_file(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(OrchestratorError::Persistence {
            what: "snapshot",
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, StageDescriptor, stage_fn};
    use crate::state::{KeyPolicy, partial};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn chain() -> Arc<PipelineGraph> {
        let noop = || stage_fn(|_| async { Ok(PartialState::new()) });
        Arc::new(
            GraphBuilder::new("chain")
                .stage(StageDescriptor::new("s1").reads(["y"]).writes(["a"]), noop())
                .stage(StageDescriptor::new("s2").reads(["a"]).writes(["b"]), noop())
                .stage(StageDescriptor::new("s3").reads(["b"]).writes(["c"]), noop())
                .build()
                .unwrap(),
        )
    }

    fn store_after_all() -> StateStore {
        let mut store = StateStore::new(BTreeMap::new());
        store.seed(partial([("y", json!(1))])).unwrap();
        store.set_many("s1", partial([("a", json!("A"))]), None).unwrap();
        store.set_many("s2", partial([("b", json!("B"))]), None).unwrap();
        store.set_many("s3", partial([("c", json!("C"))]), None).unwrap();
        store
    }

    #[test]
    fn test_snapshot_and_get() {
        let cache = SnapshotCache::new(None);
        let run = RunId::new();
        let id = cache
            .snapshot(run, "chain", "after-s2", "s2", store_after_all())
            .unwrap();
        let snap = cache.get(id).unwrap();
        assert_eq!(snap.run_id, run);
        assert_eq!(snap.state().get("c"), Some(&json!("C")));
        assert_eq!(cache.find(run, "after-s2").unwrap(), Some(id));
        assert_eq!(cache.find(run, "other").unwrap(), None);
    }

    #[test]
    fn test_unknown_snapshot_not_found() {
        let cache = SnapshotCache::new(None);
        let id = SnapshotId::new();
        assert!(matches!(cache.get(id), Err(OrchestratorError::SnapshotNotFound(found)) if found == id));
    }

    #[test]
    fn test_resume_plan_clears_downstream_keys() {
        let cache = SnapshotCache::new(None);
        let id = cache
            .snapshot(RunId::new(), "chain", "after-s2", "s2", store_after_all())
            .unwrap();
        let plan = cache
            .resume_plan(id, chain(), partial([("y", json!(2))]))
            .unwrap();

        assert_eq!(plan.resumed_from, Some(id));
        assert_eq!(plan.restored.len(), 2);
        assert!(plan.store.contains("a"));
        assert!(plan.store.contains("b"));
        assert!(!plan.store.contains("c"));
        assert_eq!(plan.store.get("y").unwrap(), &json!(2));
    }

    #[test]
    fn test_resume_rejects_downstream_override() {
        let cache = SnapshotCache::new(None);
        let id = cache
            .snapshot(RunId::new(), "chain", "after-s2", "s2", store_after_all())
            .unwrap();
        let err = cache
            .resume_plan(id, chain(), partial([("c", json!("X"))]))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidOverride { ref key, .. } if key == "c"));
    }

    #[test]
    fn test_resume_rejects_other_graph() {
        let cache = SnapshotCache::new(None);
        let id = cache
            .snapshot(RunId::new(), "different", "b", "s2", store_after_all())
            .unwrap();
        assert!(matches!(
            cache.resume_plan(id, chain(), PartialState::new()),
            Err(OrchestratorError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = SnapshotCache::new(Some(Duration::from_secs(60)));
        let id = cache
            .snapshot(RunId::new(), "chain", "b", "s2", store_after_all())
            .unwrap();
        let snap = cache.get(id).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert!(snap.is_expired(cache.ttl(), later));
        assert!(!snap.is_expired(None, later));
        assert!(!snap.is_expired(cache.ttl(), Utc::now()));
    }

    #[test]
    fn test_zero_ttl_evicts() {
        let cache = SnapshotCache::new(Some(Duration::ZERO));
        let id = cache
            .snapshot(RunId::new(), "chain", "b", "s2", store_after_all())
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(id).is_err());
        assert_eq!(cache.len().unwrap(), 0);
    }

    #[test]
    fn test_invalidate_run() {
        let cache = SnapshotCache::new(None);
        let run = RunId::new();
        cache.snapshot(run, "chain", "x", "s1", StateStore::default()).unwrap();
        cache.snapshot(run, "chain", "y", "s2", StateStore::default()).unwrap();
        cache
            .snapshot(RunId::new(), "chain", "x", "s1", StateStore::default())
            .unwrap();
        assert_eq!(cache.invalidate_run(run).unwrap(), 2);
        assert_eq!(cache.list().unwrap().len(), 1);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let policies = BTreeMap::from([("parts".to_string(), KeyPolicy::Accumulating)]);
        let mut store = StateStore::new(policies);
        store
            .set_many("b1", partial([("parts", json!(1))]), Some("g"))
            .unwrap();

        let cache = SnapshotCache::new(None).with_persistence(dir.path());
        let id = cache
            .snapshot(RunId::new(), "chain", "joined", "s2", store)
            .unwrap();
        assert!(dir.path().join(format!("{}.json", id)).exists());

        let reloaded = SnapshotCache::new(None).with_persistence(dir.path());
        assert_eq!(reloaded.load_from_disk().unwrap(), 1);
        let snap = reloaded.get(id).unwrap();
        assert_eq!(snap.store.accumulated("parts").len(), 1);
        assert_eq!(snap.store.policy("parts"), KeyPolicy::Accumulating);

        assert!(reloaded.invalidate(id).unwrap());
        assert!(!dir.path().join(format!("{}.json", id)).exists());
    }

    fn fork() -> Arc<PipelineGraph> {
        let noop = || stage_fn(|_| async { Ok(PartialState::new()) });
        Arc::new(
            GraphBuilder::new("fork")
                .accumulating("parts")
                .stage(StageDescriptor::new("b1").in_group("g").writes(["parts"]), noop())
                .stage(StageDescriptor::new("b2").in_group("g").writes(["parts"]), noop())
                .stage(StageDescriptor::new("join").reads(["parts"]).writes(["merged"]), noop())
                .build()
                .unwrap(),
        )
    }

    fn fork_record() -> BoundaryRecord {
        BoundaryRecord {
            joins: vec![JoinReport {
                group: "g".to_string(),
                completed: vec!["b1".to_string()],
                failed: vec![BranchFailure {
                    stage: "b2".to_string(),
                    error: crate::errors::StageError::failed("boom"),
                }],
            }],
            validation: Some(ValidationResult::evaluate(0.9, vec![], 0.8)),
        }
    }

    #[test]
    fn test_resume_plan_carries_join_record() {
        let mut policies = BTreeMap::new();
        policies.insert("parts".to_string(), KeyPolicy::Accumulating);
        let mut store = StateStore::new(policies);
        store
            .set_many("b1", partial([("parts", json!(1))]), Some("g"))
            .unwrap();
        store.set_many("join", partial([("merged", json!([1]))]), None).unwrap();

        let cache = SnapshotCache::new(None);
        let id = cache
            .snapshot_with_record(RunId::new(), "fork", "after:join", "join", store, fork_record())
            .unwrap();
        let plan = cache.resume_plan(id, fork(), PartialState::new()).unwrap();

        assert_eq!(plan.restored.len(), 3);
        assert_eq!(plan.record.joins, fork_record().joins);
        // no validator in this graph, so nothing to carry
        assert_eq!(plan.record.validation, None);
    }

    #[test]
    fn test_record_restricted_to_restored_stages() {
        let graph = fork();
        let restored = BTreeSet::from([graph.index_of("b1").unwrap()]);
        let record = fork_record().restrict_to(&graph, &restored);
        assert_eq!(record.joins.len(), 1);
        assert_eq!(record.joins[0].completed, vec!["b1"]);
        assert!(record.joins[0].failed.is_empty());

        let nothing = fork_record().restrict_to(&graph, &BTreeSet::new());
        assert_eq!(nothing, BoundaryRecord::default());
    }

    #[test]
    fn test_record_survives_disk_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = SnapshotCache::new(None).with_persistence(dir.path());
        let id = cache
            .snapshot_with_record(
                RunId::new(),
                "fork",
                "after:join",
                "join",
                StateStore::new(BTreeMap::new()),
                fork_record(),
            )
            .unwrap();

        let reloaded = SnapshotCache::new(None).with_persistence(dir.path());
        reloaded.load_from_disk().unwrap();
        assert_eq!(reloaded.get(id).unwrap().record, fork_record());
    }

    #[test]
    fn test_load_skips_corrupt_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("garbage.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let cache = SnapshotCache::new(None).with_persistence(dir.path());
        assert_eq!(cache.load_from_disk().unwrap(), 0);
    }
}
