//! Fetch lifecycle of a single rule source.
//!
//! A handler moves its source through
//! `idle -> fetching -> applied | failed -> scheduled`. The blocking part of
//! a fetch is packaged as a [`FetchTask`] that the owner runs on a worker
//! thread; the result comes back as a [`FetchCompletion`] and is applied on
//! the owning sequence. The task writes the parsed rules to staging files;
//! they are renamed into place only when the completion is applied, so a
//! superseded fetch never touches a source's committed files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::RuleServiceConfig;
use crate::fetch::Fetcher;
use crate::group::RuleGroup;
use crate::index::{sha256_hex, RuleBuffer};
use crate::parser::{ParsedRuleList, RuleListParser, TrackerInfoMap};
use crate::source::{FetchResult, RuleSource, SourceId, SourceOrigin};
use crate::storage::{remove_if_exists, write_atomic};

/// Parsed rules of a source, in `<data_dir>/<group>/<id>.rules`.
pub fn rules_path(data_dir: &Path, group: RuleGroup, id: SourceId) -> PathBuf {
    data_dir
        .join(group.dir_name())
        .join(format!("{}.rules", id.file_stem()))
}

/// Tracker attributions of a source, next to its parsed rules.
pub fn trackers_path(data_dir: &Path, group: RuleGroup, id: SourceId) -> PathBuf {
    data_dir
        .join(group.dir_name())
        .join(format!("{}.trackers.json", id.file_stem()))
}

/// Fetch generations are unique across handlers, so a task started for a
/// deleted source never matches a re-added source with the same id.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

fn staging_path(path: &Path, generation: u64) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.partial", generation));
    path.with_file_name(name)
}

/// Files written by a fetch that have not been moved into place yet.
#[derive(Debug)]
pub struct StagedRules {
    rules: PathBuf,
    trackers: Option<PathBuf>,
}

impl StagedRules {
    fn commit(&self, rules_path: &Path, trackers_path: &Path) -> crate::Result<()> {
        fs::rename(&self.rules, rules_path)?;
        match &self.trackers {
            Some(staged) => fs::rename(staged, trackers_path)?,
            None => remove_if_exists(trackers_path)?,
        }
        Ok(())
    }

    fn discard(&self) {
        for path in std::iter::once(&self.rules).chain(&self.trackers) {
            if let Err(e) = remove_if_exists(path) {
                log::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

/// Rules committed by a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchedRules {
    pub buffer: RuleBuffer,
    pub tracker_infos: TrackerInfoMap,
}

/// Blocking half of a fetch.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub group: RuleGroup,
    pub id: SourceId,
    pub generation: u64,
    origin: SourceOrigin,
    allow_abp_snippets: bool,
    rules_path: PathBuf,
    trackers_path: PathBuf,
}

/// Result of a [`FetchTask`].
#[derive(Debug)]
pub struct FetchCompletion {
    pub group: RuleGroup,
    pub id: SourceId,
    pub generation: u64,
    pub outcome: Result<ParsedRuleList, FetchResult>,
    staged: Option<StagedRules>,
}

impl FetchCompletion {
    /// Remove whatever the task staged. Used when nothing will apply it.
    pub fn discard(self) {
        if let Some(staged) = self.staged {
            staged.discard();
        }
    }
}

impl FetchTask {
    /// Completion reported when the task could not run to the end.
    ///
    /// Any staging files the task may have left are removed with it.
    pub fn aborted(&self) -> FetchCompletion {
        let staged = StagedRules {
            rules: self.staged_rules_path(),
            trackers: Some(self.staged_trackers_path()),
        };
        self.complete(Err(FetchResult::Unknown), Some(staged))
    }

    fn complete(
        &self,
        outcome: Result<ParsedRuleList, FetchResult>,
        staged: Option<StagedRules>,
    ) -> FetchCompletion {
        FetchCompletion {
            group: self.group,
            id: self.id,
            generation: self.generation,
            outcome,
            staged,
        }
    }

    fn staged_rules_path(&self) -> PathBuf {
        staging_path(&self.rules_path, self.generation)
    }

    fn staged_trackers_path(&self) -> PathBuf {
        staging_path(&self.trackers_path, self.generation)
    }

    /// Download or read, parse, and stage the parsed rules.
    pub fn run(self, fetcher: &dyn Fetcher, parser: &dyn RuleListParser) -> FetchCompletion {
        match self.fetch_and_parse(fetcher, parser) {
            Ok((parsed, staged)) => self.complete(Ok(parsed), Some(staged)),
            Err(result) => self.complete(Err(result), None),
        }
    }

    fn fetch_and_parse(
        &self,
        fetcher: &dyn Fetcher,
        parser: &dyn RuleListParser,
    ) -> Result<(ParsedRuleList, StagedRules), FetchResult> {
        let raw = match &self.origin {
            SourceOrigin::Url(url) => fetcher.get(url).map_err(|e| {
                log::warn!("Download of {} failed: {}", url, e);
                FetchResult::DownloadFailed
            })?,
            SourceOrigin::File(path) => fs::read(path).map_err(|e| {
                log::warn!("Reading {} failed: {}", path.display(), e);
                match e.kind() {
                    std::io::ErrorKind::NotFound => FetchResult::FileNotFound,
                    _ => FetchResult::FileReadError,
                }
            })?,
        };

        let parsed = parser.parse(&raw, self.allow_abp_snippets)?;

        let staged = StagedRules {
            rules: self.staged_rules_path(),
            trackers: (!parsed.tracker_infos.is_empty()).then(|| self.staged_trackers_path()),
        };
        let saved = write_atomic(&staged.rules, parsed.rules_buffer.as_bytes()).and_then(|_| {
            match &staged.trackers {
                Some(path) => write_atomic(path, &serde_json::to_vec(&parsed.tracker_infos)?),
                None => Ok(()),
            }
        });
        if let Err(e) = saved {
            log::error!("Saving parsed rules of {} failed: {}", self.id, e);
            staged.discard();
            return Err(FetchResult::FailedSavingParsedRules);
        }
        Ok((parsed, staged))
    }
}

/// Blocking read of a source's previously saved rules.
#[derive(Debug, Clone)]
pub struct ReadTask {
    pub group: RuleGroup,
    pub id: SourceId,
    expected_checksum: String,
    rules_path: PathBuf,
    trackers_path: Option<PathBuf>,
}

/// Result of a [`ReadTask`].
#[derive(Debug)]
pub struct ReadCompletion {
    pub group: RuleGroup,
    pub id: SourceId,
    /// `None` if the saved rules are missing or do not match their checksum
    pub rules: Option<FetchedRules>,
}

impl ReadTask {
    pub fn aborted(&self) -> ReadCompletion {
        ReadCompletion {
            group: self.group,
            id: self.id,
            rules: None,
        }
    }

    pub fn run(self) -> ReadCompletion {
        let rules = self.read();
        ReadCompletion {
            group: self.group,
            id: self.id,
            rules,
        }
    }

    fn read(&self) -> Option<FetchedRules> {
        let text = match fs::read_to_string(&self.rules_path) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Reading saved rules {} failed: {}", self.rules_path.display(), e);
                return None;
            }
        };
        let checksum = sha256_hex(text.as_bytes());
        if checksum != self.expected_checksum {
            log::warn!(
                "Saved rules {} do not match their checksum",
                self.rules_path.display()
            );
            return None;
        }

        let tracker_infos = match &self.trackers_path {
            Some(path) => fs::read(path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<TrackerInfoMap>(&bytes).ok())
                .unwrap_or_else(|| {
                    log::warn!("Saved tracker infos {} are unreadable", path.display());
                    TrackerInfoMap::new()
                }),
            None => TrackerInfoMap::new(),
        };

        Some(FetchedRules {
            buffer: RuleBuffer {
                source_id: self.id,
                checksum,
                rules: Arc::from(text),
            },
            tracker_infos,
        })
    }
}

/// Change applied by a fetch completion.
#[derive(Debug)]
pub enum FetchUpdate {
    /// New rules were committed
    Applied(FetchedRules),
    /// The fetch failed; the previous rules, if any, stay in effect
    Failed(FetchResult),
}

/// Owns one [`RuleSource`] and its fetch lifecycle.
#[derive(Debug)]
pub struct RuleSourceHandler {
    source: RuleSource,
    data_dir: PathBuf,
    generation: u64,
    retried_after_read_failure: bool,
}

impl RuleSourceHandler {
    /// Wrap `source`. A persisted in-progress fetch is not resumed.
    pub fn new(mut source: RuleSource, data_dir: &Path) -> Self {
        source.is_fetching = false;
        Self {
            source,
            data_dir: data_dir.to_path_buf(),
            generation: 0,
            retried_after_read_failure: false,
        }
    }

    pub fn source(&self) -> &RuleSource {
        &self.source
    }

    pub fn id(&self) -> SourceId {
        self.source.id()
    }

    pub fn group(&self) -> RuleGroup {
        self.source.group()
    }

    pub fn rules_path(&self) -> PathBuf {
        rules_path(&self.data_dir, self.group(), self.id())
    }

    pub fn trackers_path(&self) -> PathBuf {
        trackers_path(&self.data_dir, self.group(), self.id())
    }

    /// Whether the refresh scheduler should fetch this source now.
    ///
    /// Only URL sources refresh on a schedule.
    pub fn is_fetch_due(&self, now: SystemTime) -> bool {
        self.source.base.is_from_url()
            && !self.source.is_fetching
            && self.source.next_fetch.map_or(true, |next| next <= now)
    }

    /// Start a fetch. Returns `None` if one is already running.
    pub fn fetch_now(&mut self) -> Option<FetchTask> {
        if self.source.is_fetching {
            log::debug!("Fetch of {} already in progress", self.id());
            return None;
        }
        self.source.is_fetching = true;
        self.generation = next_generation();
        log::info!("Fetching rule source {} ({})", self.id(), self.source.base.origin());
        Some(FetchTask {
            group: self.group(),
            id: self.id(),
            generation: self.generation,
            origin: self.source.base.origin().clone(),
            allow_abp_snippets: self.source.base.allow_abp_snippets,
            rules_path: self.rules_path(),
            trackers_path: self.trackers_path(),
        })
    }

    /// Refetch after the saved rules could not be read back.
    ///
    /// Allowed once until the next successful fetch.
    pub fn fetch_after_read_failure(&mut self) -> Option<FetchTask> {
        if self.retried_after_read_failure {
            log::warn!("Not retrying {} again after a read failure", self.id());
            return None;
        }
        self.retried_after_read_failure = true;
        self.fetch_now()
    }

    /// Read task for the saved rules, if this source has committed any.
    pub fn read_task(&self) -> Option<ReadTask> {
        if !self.source.has_committed_rules() {
            return None;
        }
        Some(ReadTask {
            group: self.group(),
            id: self.id(),
            expected_checksum: self.source.rules_list_checksum.clone(),
            rules_path: self.rules_path(),
            trackers_path: self.source.has_tracker_infos.then(|| self.trackers_path()),
        })
    }

    /// Apply a fetch result. Returns `None` for a superseded fetch.
    pub fn on_fetch_complete(
        &mut self,
        completion: FetchCompletion,
        config: &RuleServiceConfig,
        now: SystemTime,
    ) -> Option<FetchUpdate> {
        if completion.generation != self.generation || !self.source.is_fetching {
            log::debug!("Dropping stale fetch result for {}", self.id());
            completion.discard();
            return None;
        }
        self.source.is_fetching = false;

        let outcome = match (completion.outcome, completion.staged) {
            (Ok(parsed), Some(staged)) => {
                match staged.commit(&self.rules_path(), &self.trackers_path()) {
                    Ok(()) => Ok(parsed),
                    Err(e) => {
                        log::error!("Committing parsed rules of {} failed: {}", self.id(), e);
                        staged.discard();
                        Err(FetchResult::FailedSavingParsedRules)
                    }
                }
            }
            (Ok(_), None) => Err(FetchResult::FailedSavingParsedRules),
            (Err(result), staged) => {
                if let Some(staged) = staged {
                    staged.discard();
                }
                Err(result)
            }
        };

        match outcome {
            Ok(parsed) => {
                log::info!(
                    "Fetched rule source {}: {} valid, {} unsupported, {} invalid rules",
                    self.id(),
                    parsed.rules_info.valid_rules,
                    parsed.rules_info.unsupported_rules,
                    parsed.rules_info.invalid_rules
                );
                let source = &mut self.source;
                source.rules_list_checksum = parsed.checksum.clone();
                source.rules_info = parsed.rules_info;
                source.has_tracker_infos = !parsed.tracker_infos.is_empty();
                source.last_update = Some(now);
                source.next_fetch = source
                    .base
                    .is_from_url()
                    .then(|| now + config.refresh_interval(parsed.metadata.expires));
                source.unsafe_adblock_metadata = parsed.metadata;
                source.last_fetch_result = FetchResult::Success;
                self.retried_after_read_failure = false;

                Some(FetchUpdate::Applied(FetchedRules {
                    buffer: RuleBuffer {
                        source_id: self.id(),
                        checksum: parsed.checksum,
                        rules: Arc::from(parsed.rules_buffer),
                    },
                    tracker_infos: parsed.tracker_infos,
                }))
            }
            Err(result) => {
                log::warn!("Fetch of rule source {} failed: {}", self.id(), result);
                self.source.last_fetch_result = result;
                if self.source.base.is_from_url() {
                    self.source.next_fetch = Some(now + config.retry_backoff());
                }
                Some(FetchUpdate::Failed(result))
            }
        }
    }

    /// Delete saved artifacts and forget the committed rules.
    ///
    /// An in-flight fetch is not cancelled; its result is dropped as stale.
    pub fn clear(&mut self) {
        for path in [self.rules_path(), self.trackers_path()] {
            if let Err(e) = remove_if_exists(&path) {
                log::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
        self.generation = next_generation();
        self.source.is_fetching = false;
        self.source.rules_list_checksum.clear();
        self.source.has_tracker_infos = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;
    use crate::parser::AdBlockListParser;
    use crate::sequence::{Clock, ManualClock};
    use crate::source::RuleSourceBase;
    use std::time::Duration;
    use url::Url;

    const LIST_URL: &str = "https://lists.example.com/ads.txt";

    fn url_handler(data_dir: &Path) -> RuleSourceHandler {
        let origin = SourceOrigin::from_url(Url::parse(LIST_URL).unwrap()).unwrap();
        let base = RuleSourceBase::new(origin, RuleGroup::AdBlocking);
        RuleSourceHandler::new(RuleSource::new(base), data_dir)
    }

    fn file_handler(data_dir: &Path, path: &Path) -> RuleSourceHandler {
        let origin = SourceOrigin::from_file(path).unwrap();
        let base = RuleSourceBase::new(origin, RuleGroup::Tracking);
        RuleSourceHandler::new(RuleSource::new(base), data_dir)
    }

    #[test]
    fn test_fetch_success_updates_source() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let config = RuleServiceConfig::with_data_dir(dir.path());
        let fetcher = MemoryFetcher::new();
        fetcher.insert(
            LIST_URL,
            "! Expires: 2 days\n!#tracker t.example {\"n\":1}\n||ads.example.com^\n",
        );

        let mut handler = url_handler(dir.path());
        assert!(handler.is_fetch_due(clock.now()));
        let task = handler.fetch_now().unwrap();
        assert!(handler.fetch_now().is_none());
        assert!(!handler.is_fetch_due(clock.now()));

        let completion = task.run(&fetcher, &AdBlockListParser::new());
        let update = handler.on_fetch_complete(completion, &config, clock.now());
        let Some(FetchUpdate::Applied(rules)) = update else {
            panic!("expected applied rules");
        };

        let source = handler.source();
        assert!(!source.is_fetching);
        assert_eq!(source.last_fetch_result, FetchResult::Success);
        assert_eq!(source.rules_list_checksum, rules.buffer.checksum);
        assert!(source.has_tracker_infos);
        assert_eq!(source.last_update, Some(clock.now()));
        assert_eq!(
            source.next_fetch,
            Some(clock.now() + Duration::from_secs(2 * 86_400))
        );
        assert_eq!(&*rules.buffer.rules, "||ads.example.com^\n");
        assert!(handler.rules_path().exists());
        assert!(handler.trackers_path().exists());
    }

    #[test]
    fn test_download_failure_schedules_retry() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let config = RuleServiceConfig::with_data_dir(dir.path());
        let fetcher = MemoryFetcher::new();

        let mut handler = url_handler(dir.path());
        let completion = handler
            .fetch_now()
            .unwrap()
            .run(&fetcher, &AdBlockListParser::new());
        let update = handler.on_fetch_complete(completion, &config, clock.now());
        assert!(matches!(update, Some(FetchUpdate::Failed(FetchResult::DownloadFailed))));

        let source = handler.source();
        assert_eq!(source.last_fetch_result, FetchResult::DownloadFailed);
        assert_eq!(source.next_fetch, Some(clock.now() + config.retry_backoff()));
        assert!(!source.has_committed_rules());
    }

    #[test]
    fn test_file_source_results() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let config = RuleServiceConfig::with_data_dir(dir.path().join("data"));
        let fetcher = MemoryFetcher::new();
        let parser = AdBlockListParser::new();
        let list = dir.path().join("mine.txt");

        let mut handler = file_handler(&config.data_dir, &list);
        assert!(!handler.is_fetch_due(clock.now()));

        let completion = handler.fetch_now().unwrap().run(&fetcher, &parser);
        let update = handler.on_fetch_complete(completion, &config, clock.now());
        assert!(matches!(update, Some(FetchUpdate::Failed(FetchResult::FileNotFound))));
        assert_eq!(handler.source().next_fetch, None);

        fs::write(&list, "<!DOCTYPE html><html></html>").unwrap();
        let completion = handler.fetch_now().unwrap().run(&fetcher, &parser);
        let update = handler.on_fetch_complete(completion, &config, clock.now());
        assert!(matches!(update, Some(FetchUpdate::Failed(FetchResult::FileUnsupported))));

        fs::write(&list, "||tracker.example^\n").unwrap();
        let completion = handler.fetch_now().unwrap().run(&fetcher, &parser);
        let update = handler.on_fetch_complete(completion, &config, clock.now());
        assert!(matches!(update, Some(FetchUpdate::Applied(_))));
        assert_eq!(handler.source().next_fetch, None);
        assert_eq!(fetcher.request_count(), 0);
    }

    #[test]
    fn test_stale_completion_dropped_after_clear() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let config = RuleServiceConfig::with_data_dir(dir.path());
        let fetcher = MemoryFetcher::new();
        fetcher.insert(LIST_URL, "||ads.example.com^\n");

        let mut handler = url_handler(dir.path());
        let task = handler.fetch_now().unwrap();
        handler.clear();
        let completion = task.run(&fetcher, &AdBlockListParser::new());
        assert!(!handler.rules_path().exists());
        assert!(handler.on_fetch_complete(completion, &config, clock.now()).is_none());
        assert!(!handler.source().has_committed_rules());
        assert!(!handler.rules_path().exists());
        assert_eq!(fs::read_dir(dir.path().join("ad-blocking")).unwrap().count(), 0);
    }

    #[test]
    fn test_fetch_for_replaced_handler_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let config = RuleServiceConfig::with_data_dir(dir.path());
        let fetcher = MemoryFetcher::new();
        let parser = AdBlockListParser::new();
        fetcher.insert(LIST_URL, "||ads.example.com^\n");

        let mut deleted = url_handler(dir.path());
        let old_task = deleted.fetch_now().unwrap();
        deleted.clear();

        let mut readded = url_handler(dir.path());
        let new_task = readded.fetch_now().unwrap();
        let old = old_task.run(&fetcher, &parser);
        let new = new_task.run(&fetcher, &parser);

        assert!(readded.on_fetch_complete(old, &config, clock.now()).is_none());
        assert!(readded.source().is_fetching);
        assert!(matches!(
            readded.on_fetch_complete(new, &config, clock.now()),
            Some(FetchUpdate::Applied(_))
        ));
        assert!(readded.rules_path().exists());
    }

    #[test]
    fn test_read_back_verifies_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let config = RuleServiceConfig::with_data_dir(dir.path());
        let fetcher = MemoryFetcher::new();
        fetcher.insert(LIST_URL, "!#tracker t.example {\"n\":1}\n||ads.example.com^\n");

        let mut handler = url_handler(dir.path());
        assert!(handler.read_task().is_none());
        let completion = handler
            .fetch_now()
            .unwrap()
            .run(&fetcher, &AdBlockListParser::new());
        handler.on_fetch_complete(completion, &config, clock.now());

        let read = handler.read_task().unwrap().run();
        let rules = read.rules.unwrap();
        assert_eq!(rules.buffer.checksum, handler.source().rules_list_checksum);
        assert!(rules.tracker_infos.contains_key("t.example"));

        fs::write(handler.rules_path(), "||tampered.example^\n").unwrap();
        assert!(handler.read_task().unwrap().run().rules.is_none());
    }

    #[test]
    fn test_retry_after_read_failure_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = url_handler(dir.path());
        let task = handler.fetch_after_read_failure().unwrap();
        assert!(handler.fetch_after_read_failure().is_none());

        // Completing the fetch unblocks the fetch guard but not the retry
        let completion = task.aborted();
        let config = RuleServiceConfig::with_data_dir(dir.path());
        handler.on_fetch_complete(completion, &config, ManualClock::default().now());
        assert!(handler.fetch_after_read_failure().is_none());
        assert!(handler.fetch_now().is_some());
    }
}
