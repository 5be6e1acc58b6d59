//! Compiled index lifecycle of one rule group.
//!
//! The manager keeps the latest rules buffer of every contributing source
//! and decides when the group's index has to be loaded, rebuilt or dropped.
//! The blocking work is handed out as [`IndexTask`]s; at most one runs at a
//! time.
//!
//! On startup the index saved under the persisted checksum is loaded
//! directly. Once every source's saved rules have been read back, the
//! combined checksum is recomputed and a rebuild only happens if it differs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::RuleServiceConfig;
use crate::group::RuleGroup;
use crate::index::{combined_checksum, IndexBytes, IndexHandle, RuleBuffer, RuleIndex, RuleIndexBuilder};
use crate::source::SourceId;
use crate::storage::{remove_if_exists, write_atomic};
use crate::Result;

/// Compiled index of a group, in `<data_dir>/<group>.index`.
pub fn index_path(data_dir: &Path, group: RuleGroup) -> PathBuf {
    data_dir.join(format!("{}.index", group.dir_name()))
}

/// Availability of a group's compiled index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexStatus {
    /// No index yet, or no rules to build one from
    NotBuilt,
    Ready,
    /// Too many consecutive load or build failures
    Unusable,
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexStatus::NotBuilt => write!(f, "not-built"),
            IndexStatus::Ready => write!(f, "ready"),
            IndexStatus::Unusable => write!(f, "unusable"),
        }
    }
}

/// Blocking index work.
#[derive(Debug, Clone)]
pub enum IndexTask {
    /// Map and verify a previously saved index
    Load {
        group: RuleGroup,
        generation: u64,
        path: PathBuf,
        checksum: String,
    },
    /// Compile `buffers`, save the result and load it
    Build {
        group: RuleGroup,
        generation: u64,
        path: PathBuf,
        checksum: String,
        buffers: Vec<RuleBuffer>,
    },
}

/// Result of an [`IndexTask`].
pub struct IndexCompletion {
    pub group: RuleGroup,
    pub generation: u64,
    pub checksum: String,
    pub built: bool,
    pub outcome: Result<Box<dyn RuleIndex>>,
}

impl fmt::Debug for IndexCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexCompletion")
            .field("group", &self.group)
            .field("generation", &self.generation)
            .field("checksum", &self.checksum)
            .field("built", &self.built)
            .field("ok", &self.outcome.is_ok())
            .finish()
    }
}

impl IndexTask {
    pub fn group(&self) -> RuleGroup {
        match self {
            IndexTask::Load { group, .. } | IndexTask::Build { group, .. } => *group,
        }
    }

    /// Completion reported when the task could not run to the end.
    pub fn aborted(&self) -> IndexCompletion {
        let (group, generation, checksum, built) = match self {
            IndexTask::Load {
                group,
                generation,
                checksum,
                ..
            } => (*group, *generation, checksum.clone(), false),
            IndexTask::Build {
                group,
                generation,
                checksum,
                ..
            } => (*group, *generation, checksum.clone(), true),
        };
        IndexCompletion {
            group,
            generation,
            checksum,
            built,
            outcome: Err(crate::Error::CorruptIndex("index task aborted".to_string())),
        }
    }

    pub fn run(self, builder: &dyn RuleIndexBuilder) -> IndexCompletion {
        match self {
            IndexTask::Load {
                group,
                generation,
                path,
                checksum,
            } => {
                let outcome = IndexBytes::open(&path).and_then(|data| builder.load(data, &checksum));
                IndexCompletion {
                    group,
                    generation,
                    checksum,
                    built: false,
                    outcome,
                }
            }
            IndexTask::Build {
                group,
                generation,
                path,
                checksum,
                buffers,
            } => {
                let outcome = builder.build(&checksum, &buffers).and_then(|bytes| {
                    if let Err(e) = write_atomic(&path, &bytes) {
                        // The index still works from memory; next start rebuilds
                        log::warn!("Failed to save index {}: {}", path.display(), e);
                    }
                    builder.load(IndexBytes::Owned(bytes), &checksum)
                });
                IndexCompletion {
                    group,
                    generation,
                    checksum,
                    built: true,
                    outcome,
                }
            }
        }
    }
}

/// What [`RulesIndexManager::rebuild_if_needed`] decided.
#[derive(Debug)]
pub enum Rebuild {
    /// Nothing to do right now
    UpToDate,
    /// The group has no rules left and its index was dropped
    Cleared,
    Start(IndexTask),
}

/// Owns the compiled index of one rule group.
#[derive(Debug)]
pub struct RulesIndexManager {
    group: RuleGroup,
    index_path: PathBuf,
    handle: Arc<IndexHandle>,
    buffers: BTreeMap<SourceId, RuleBuffer>,
    /// Sources whose saved rules are still being read back
    pending_reads: BTreeSet<SourceId>,
    /// Checksum of the index in `handle`
    index_checksum: String,
    status: IndexStatus,
    load_failures: u32,
    max_load_failures: u32,
    generation: u64,
    in_flight: bool,
    rebuild_count: u64,
}

impl RulesIndexManager {
    pub fn new(group: RuleGroup, config: &RuleServiceConfig) -> Self {
        Self {
            group,
            index_path: index_path(&config.data_dir, group),
            handle: Arc::new(IndexHandle::new(config.decision_cache_capacity)),
            buffers: BTreeMap::new(),
            pending_reads: BTreeSet::new(),
            index_checksum: String::new(),
            status: IndexStatus::NotBuilt,
            load_failures: 0,
            max_load_failures: config.max_index_load_failures,
            generation: 0,
            in_flight: false,
            rebuild_count: 0,
        }
    }

    pub fn group(&self) -> RuleGroup {
        self.group
    }

    /// Shared handle through which the index is queried.
    pub fn handle(&self) -> &Arc<IndexHandle> {
        &self.handle
    }

    /// Checksum of the loaded index, empty when there is none.
    pub fn index_checksum(&self) -> &str {
        &self.index_checksum
    }

    pub fn status(&self) -> IndexStatus {
        self.status
    }

    /// Number of index builds started so far.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count
    }

    /// Begin startup: wait for `reading` sources and load the index saved
    /// under `persisted_checksum`, if there is one.
    pub fn start(
        &mut self,
        persisted_checksum: &str,
        reading: impl IntoIterator<Item = SourceId>,
    ) -> Option<IndexTask> {
        self.pending_reads = reading.into_iter().collect();
        if persisted_checksum.is_empty() {
            return None;
        }
        if !self.index_path.exists() {
            log::info!("No saved index for {}, it will be rebuilt", self.group);
            return None;
        }
        Some(self.next_task(|group, generation, path| IndexTask::Load {
            group,
            generation,
            path,
            checksum: persisted_checksum.to_string(),
        }))
    }

    fn next_task(&mut self, make: impl FnOnce(RuleGroup, u64, PathBuf) -> IndexTask) -> IndexTask {
        self.generation += 1;
        self.in_flight = true;
        make(self.group, self.generation, self.index_path.clone())
    }

    /// Saved rules of `id` have been read back, or could not be (`None`).
    pub fn on_rules_read(&mut self, id: SourceId, buffer: Option<RuleBuffer>) {
        if !self.pending_reads.remove(&id) {
            log::debug!("Ignoring read result for {} in {}", id, self.group);
            return;
        }
        if let Some(buffer) = buffer {
            self.buffers.insert(id, buffer);
        }
    }

    /// Stop waiting for the saved rules of `id`.
    pub fn cancel_read(&mut self, id: SourceId) {
        self.pending_reads.remove(&id);
    }

    /// A source committed new rules. Returns `false` if they are identical to
    /// what the index already has.
    pub fn on_rule_source_updated(&mut self, buffer: RuleBuffer) -> bool {
        self.pending_reads.remove(&buffer.source_id);
        if let Some(existing) = self.buffers.get(&buffer.source_id) {
            if existing.checksum == buffer.checksum {
                log::debug!("Rules of {} unchanged, skipping rebuild", buffer.source_id);
                return false;
            }
        }
        self.buffers.insert(buffer.source_id, buffer);
        self.reset_failures();
        true
    }

    /// A source left the group. Returns `true` if it contributed rules.
    pub fn on_rule_source_deleted(&mut self, id: SourceId) -> bool {
        self.pending_reads.remove(&id);
        self.handle.clear_cache();
        let contributed = self.buffers.remove(&id).is_some();
        if contributed {
            self.reset_failures();
        }
        contributed
    }

    /// A changed set of rules gets a fresh set of attempts.
    fn reset_failures(&mut self) {
        if self.status == IndexStatus::Unusable {
            self.status = IndexStatus::NotBuilt;
        }
        self.load_failures = 0;
    }

    /// Start a rebuild if the combined checksum differs from the index.
    pub fn rebuild_if_needed(&mut self) -> Rebuild {
        if !self.pending_reads.is_empty() || self.in_flight {
            return Rebuild::UpToDate;
        }

        let checksum = combined_checksum(&self.buffers.values().cloned().collect::<Vec<_>>());
        if checksum.is_empty() {
            if self.index_checksum.is_empty() && !self.handle.is_loaded() {
                self.status = IndexStatus::NotBuilt;
                return Rebuild::UpToDate;
            }
            log::info!("No rules left in {}, dropping its index", self.group);
            self.handle.store(None);
            self.index_checksum.clear();
            self.status = IndexStatus::NotBuilt;
            if let Err(e) = remove_if_exists(&self.index_path) {
                log::warn!("Failed to remove {}: {}", self.index_path.display(), e);
            }
            return Rebuild::Cleared;
        }

        if self.status == IndexStatus::Unusable {
            return Rebuild::UpToDate;
        }
        if checksum == self.index_checksum {
            log::debug!("Index of {} is up to date", self.group);
            return Rebuild::UpToDate;
        }

        self.rebuild_count += 1;
        log::info!(
            "Rebuilding index of {} from {} sources",
            self.group,
            self.buffers.len()
        );
        let buffers: Vec<RuleBuffer> = self.buffers.values().cloned().collect();
        Rebuild::Start(self.next_task(|group, generation, path| IndexTask::Build {
            group,
            generation,
            path,
            checksum,
            buffers,
        }))
    }

    /// Apply a finished index task. Returns `true` if a new index was
    /// swapped in.
    pub fn on_index_task_complete(&mut self, completion: IndexCompletion) -> bool {
        if completion.generation != self.generation {
            log::debug!("Dropping stale index result for {}", self.group);
            return false;
        }
        self.in_flight = false;

        match completion.outcome {
            Ok(index) => {
                log::info!(
                    "{} index of {} ({} rules, checksum {})",
                    if completion.built { "Built" } else { "Loaded" },
                    self.group,
                    index.rule_count(),
                    completion.checksum
                );
                self.handle.store(Some(index));
                self.index_checksum = completion.checksum;
                self.status = IndexStatus::Ready;
                self.load_failures = 0;
                true
            }
            Err(e) => {
                self.load_failures += 1;
                log::warn!(
                    "Failed to {} index of {} ({} of {}): {}",
                    if completion.built { "build" } else { "load" },
                    self.group,
                    self.load_failures,
                    self.max_load_failures,
                    e
                );
                if !completion.built {
                    // Forces a rebuild from the source buffers
                    self.index_checksum.clear();
                }
                if self.load_failures >= self.max_load_failures {
                    log::error!("Giving up on the index of {}", self.group);
                    // An index that no longer matches the group's sources is not served
                    self.handle.store(None);
                    self.index_checksum.clear();
                    if let Err(e) = remove_if_exists(&self.index_path) {
                        log::warn!("Failed to remove {}: {}", self.index_path.display(), e);
                    }
                    self.status = IndexStatus::Unusable;
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{sha256_hex, DomainIndexBuilder};
    use crate::Error;

    fn buffer(id: u64, rules: &str) -> RuleBuffer {
        RuleBuffer {
            source_id: SourceId(id),
            checksum: sha256_hex(rules.as_bytes()),
            rules: Arc::from(rules),
        }
    }

    fn manager(dir: &Path) -> RulesIndexManager {
        RulesIndexManager::new(RuleGroup::AdBlocking, &RuleServiceConfig::with_data_dir(dir))
    }

    fn run(manager: &mut RulesIndexManager, builder: &dyn RuleIndexBuilder) -> bool {
        match manager.rebuild_if_needed() {
            Rebuild::Start(task) => manager.on_index_task_complete(task.run(builder)),
            _ => false,
        }
    }

    struct FailingBuilder;

    impl RuleIndexBuilder for FailingBuilder {
        fn build(&self, _checksum: &str, _buffers: &[RuleBuffer]) -> Result<Vec<u8>> {
            Err(Error::CorruptIndex("no".to_string()))
        }

        fn load(&self, _data: IndexBytes, _expected: &str) -> Result<Box<dyn RuleIndex>> {
            Err(Error::CorruptIndex("no".to_string()))
        }
    }

    #[test]
    fn test_checksum_short_circuit() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        assert!(manager.on_rule_source_updated(buffer(1, "||ads.example.com^\n")));
        assert!(run(&mut manager, &DomainIndexBuilder));
        assert_eq!(manager.rebuild_count(), 1);
        assert_eq!(manager.status(), IndexStatus::Ready);
        assert!(manager.handle().is_loaded());

        assert!(matches!(manager.rebuild_if_needed(), Rebuild::UpToDate));
        assert!(!manager.on_rule_source_updated(buffer(1, "||ads.example.com^\n")));
        assert!(matches!(manager.rebuild_if_needed(), Rebuild::UpToDate));
        assert_eq!(manager.rebuild_count(), 1);
    }

    #[test]
    fn test_one_task_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        manager.on_rule_source_updated(buffer(1, "||a.example^\n"));
        let Rebuild::Start(first) = manager.rebuild_if_needed() else {
            panic!("expected a build");
        };
        manager.on_rule_source_updated(buffer(2, "||b.example^\n"));
        assert!(matches!(manager.rebuild_if_needed(), Rebuild::UpToDate));

        assert!(manager.on_index_task_complete(first.run(&DomainIndexBuilder)));
        // The second source is picked up once the first build lands
        assert!(run(&mut manager, &DomainIndexBuilder));
        assert_eq!(manager.handle().load().unwrap().rule_count(), 2);
    }

    #[test]
    fn test_startup_loads_saved_index() {
        let dir = tempfile::tempdir().unwrap();
        let saved = buffer(1, "||ads.example.com^\n");
        let checksum = {
            let mut first = manager(dir.path());
            first.on_rule_source_updated(saved.clone());
            assert!(run(&mut first, &DomainIndexBuilder));
            first.index_checksum().to_string()
        };

        let mut second = manager(dir.path());
        let task = second.start(&checksum, [SourceId(1)]).unwrap();
        assert!(matches!(task, IndexTask::Load { .. }));
        assert!(matches!(second.rebuild_if_needed(), Rebuild::UpToDate));
        assert!(second.on_index_task_complete(task.run(&DomainIndexBuilder)));

        second.on_rules_read(SourceId(1), Some(saved));
        assert!(matches!(second.rebuild_if_needed(), Rebuild::UpToDate));
        assert_eq!(second.rebuild_count(), 0);
        assert_eq!(second.index_checksum(), checksum);
    }

    #[test]
    fn test_corrupt_saved_index_falls_back_to_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let saved = buffer(1, "||ads.example.com^\n");
        let checksum = combined_checksum(&[saved.clone()]);
        std::fs::write(index_path(dir.path(), RuleGroup::AdBlocking), b"garbage").unwrap();

        let mut manager = manager(dir.path());
        let task = manager.start(&checksum, [SourceId(1)]).unwrap();
        assert!(!manager.on_index_task_complete(task.run(&DomainIndexBuilder)));
        manager.on_rules_read(SourceId(1), Some(saved));

        assert!(run(&mut manager, &DomainIndexBuilder));
        assert_eq!(manager.status(), IndexStatus::Ready);
        assert_eq!(manager.index_checksum(), checksum);
    }

    #[test]
    fn test_failures_escalate_to_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        manager.on_rule_source_updated(buffer(1, "||a.example^\n"));
        for _ in 0..3 {
            assert!(!run(&mut manager, &FailingBuilder));
        }
        assert_eq!(manager.status(), IndexStatus::Unusable);
        assert!(matches!(manager.rebuild_if_needed(), Rebuild::UpToDate));

        // New rules reset the attempts
        manager.on_rule_source_updated(buffer(1, "||b.example^\n"));
        assert!(run(&mut manager, &DomainIndexBuilder));
        assert_eq!(manager.status(), IndexStatus::Ready);
    }

    #[test]
    fn test_deleting_source_recovers_unusable_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        manager.on_rule_source_updated(buffer(1, "||a.example^\n"));
        manager.on_rule_source_updated(buffer(2, "||b.example^\n"));
        assert!(run(&mut manager, &DomainIndexBuilder));

        manager.on_rule_source_updated(buffer(1, "||c.example^\n"));
        for _ in 0..3 {
            assert!(!run(&mut manager, &FailingBuilder));
        }
        assert_eq!(manager.status(), IndexStatus::Unusable);
        assert!(!manager.handle().is_loaded());

        assert!(manager.on_rule_source_deleted(SourceId(1)));
        assert_eq!(manager.status(), IndexStatus::NotBuilt);
        assert!(run(&mut manager, &DomainIndexBuilder));
        assert_eq!(manager.handle().load().unwrap().rule_count(), 1);
    }

    #[test]
    fn test_deleting_last_source_of_unusable_group_resets_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        manager.on_rule_source_updated(buffer(1, "||a.example^\n"));
        assert!(run(&mut manager, &DomainIndexBuilder));
        manager.on_rule_source_updated(buffer(1, "||b.example^\n"));
        for _ in 0..3 {
            assert!(!run(&mut manager, &FailingBuilder));
        }
        assert_eq!(manager.status(), IndexStatus::Unusable);
        assert!(!manager.handle().is_loaded());
        assert!(!index_path(dir.path(), RuleGroup::AdBlocking).exists());

        assert!(manager.on_rule_source_deleted(SourceId(1)));
        assert!(matches!(manager.rebuild_if_needed(), Rebuild::UpToDate));
        assert_eq!(manager.status(), IndexStatus::NotBuilt);
        assert_eq!(manager.index_checksum(), "");
        assert_eq!(manager.rebuild_count(), 4);
    }

    #[test]
    fn test_deleting_last_source_clears_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        manager.on_rule_source_updated(buffer(1, "||a.example^\n"));
        assert!(run(&mut manager, &DomainIndexBuilder));
        assert!(index_path(dir.path(), RuleGroup::AdBlocking).exists());

        assert!(manager.on_rule_source_deleted(SourceId(1)));
        assert!(!manager.on_rule_source_deleted(SourceId(1)));
        assert!(matches!(manager.rebuild_if_needed(), Rebuild::Cleared));
        assert!(!manager.handle().is_loaded());
        assert_eq!(manager.status(), IndexStatus::NotBuilt);
        assert!(!index_path(dir.path(), RuleGroup::AdBlocking).exists());
    }

    #[test]
    fn test_waits_for_pending_reads() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        assert!(manager.start("", [SourceId(1), SourceId(2)]).is_none());
        manager.on_rules_read(SourceId(1), Some(buffer(1, "||a.example^\n")));
        assert!(matches!(manager.rebuild_if_needed(), Rebuild::UpToDate));
        manager.on_rules_read(SourceId(2), None);
        assert!(run(&mut manager, &DomainIndexBuilder));
        assert_eq!(manager.handle().load().unwrap().rule_count(), 1);
    }
}
