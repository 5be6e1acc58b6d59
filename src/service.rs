//! The rule engine.
//!
//! [`RuleServiceBuilder::load`] reads the persisted state in the background
//! and returns a [`PendingRuleService`]; only once that finishes is a
//! [`RuleService`] available, so nothing can touch the engine before its
//! state is loaded.
//!
//! The service owns every component and runs on one thread. Blocking work
//! (fetches, saved-rule reads, index builds) runs on worker threads and its
//! results are applied by [`RuleService::run_pending`] or
//! [`RuleService::run_until_idle`], which also fire due timers: the source
//! refresh scheduler, the blocked-URL notification and the debounced state
//! write.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use url::Url;

use crate::config::RuleServiceConfig;
use crate::error::SourceError;
use crate::exceptions::{ExceptionLists, ExceptionsList};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::group::{PerGroup, RuleGroup};
use crate::index::{
    ActivationFlags, DomainIndexBuilder, IndexHandle, ResourceKind, RuleIndexBuilder,
};
use crate::index_manager::{IndexCompletion, IndexStatus, IndexTask, Rebuild, RulesIndexManager};
use crate::known_sources::{KnownRuleSources, KnownRuleSourcesHandler};
use crate::observer::{EventKind, Observer, ObserverId, ObserverList, RuleServiceEvent};
use crate::parser::{AdBlockListParser, RuleListParser, TrackerInfoMap};
use crate::reporter::{BlockedUrlsReporter, FrameContext, NavigationId, TabId};
use crate::sequence::{Clock, SystemClock, TaskRunner};
use crate::source::{KnownRuleSource, RuleSource, RuleSourceBase, SourceId, SourceOrigin};
use crate::source_handler::{
    FetchCompletion, FetchTask, FetchUpdate, ReadCompletion, ReadTask, RuleSourceHandler,
};
use crate::storage::{load_state, GroupState, RuleServiceStorage, ServiceState};

/// A request to be matched against the enabled groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: Url,
    /// Page that made the request; `None` for browser-initiated requests
    pub initiator: Option<Url>,
    pub frame: FrameContext,
    pub kind: ResourceKind,
}

impl Request {
    pub fn new(url: Url, initiator: Option<Url>, kind: ResourceKind) -> Self {
        Self {
            url,
            initiator,
            frame: FrameContext::default(),
            kind,
        }
    }

    pub fn with_frame(mut self, frame: FrameContext) -> Self {
        self.frame = frame;
        self
    }
}

/// Collaborator that reads compiled indexes without owning them.
pub trait CosmeticFilter {
    fn set_rules_indexes(&mut self, indexes: PerGroup<Weak<IndexHandle>>);
}

/// Only these schemes are filtered.
fn is_filterable(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https" | "ftp")
}

enum Completion {
    Fetch(FetchCompletion),
    Read(ReadCompletion),
    Index(IndexCompletion),
}

struct Collaborators {
    config: RuleServiceConfig,
    clock: Arc<dyn Clock>,
    fetcher: Arc<dyn Fetcher>,
    parser: Arc<dyn RuleListParser>,
    index_builder: Arc<dyn RuleIndexBuilder>,
    observers: ObserverList,
}

/// Configures and starts a [`RuleService`].
pub struct RuleServiceBuilder {
    config: RuleServiceConfig,
    clock: Option<Arc<dyn Clock>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    parser: Option<Arc<dyn RuleListParser>>,
    index_builder: Option<Arc<dyn RuleIndexBuilder>>,
    observers: ObserverList,
}

impl RuleServiceBuilder {
    pub fn new(config: RuleServiceConfig) -> Self {
        Self {
            config,
            clock: None,
            fetcher: None,
            parser: None,
            index_builder: None,
            observers: ObserverList::new(),
        }
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    pub fn parser(mut self, parser: impl RuleListParser + 'static) -> Self {
        self.parser = Some(Arc::new(parser));
        self
    }

    pub fn index_builder(mut self, builder: impl RuleIndexBuilder + 'static) -> Self {
        self.index_builder = Some(Arc::new(builder));
        self
    }

    /// Register an observer that also sees [`RuleServiceEvent::Loaded`].
    pub fn observer(mut self, observer: Observer) -> Self {
        self.observers.add(observer);
        self
    }

    /// Start reading the persisted state.
    pub fn load(self) -> crate::Result<PendingRuleService> {
        self.config.validate()?;
        let fetch_timeout = self.config.fetch_timeout();
        let parts = Collaborators {
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            fetcher: self
                .fetcher
                .unwrap_or_else(|| Arc::new(HttpFetcher::new(fetch_timeout))),
            parser: self
                .parser
                .unwrap_or_else(|| Arc::new(AdBlockListParser::new())),
            index_builder: self
                .index_builder
                .unwrap_or_else(|| Arc::new(DomainIndexBuilder)),
            observers: self.observers,
            config: self.config,
        };

        let runner = TaskRunner::new();
        let path = parts.config.state_path();
        log::info!("Loading rule service state from {}", path.display());
        runner.post("load-state", move || load_state(&path), ServiceState::default());
        Ok(PendingRuleService { parts, runner })
    }
}

/// A service whose persisted state is still being read.
pub struct PendingRuleService {
    parts: Collaborators,
    runner: TaskRunner<ServiceState>,
}

impl PendingRuleService {
    /// Finish loading if the state has been read, otherwise hand `self` back.
    pub fn try_finish(self) -> Result<RuleService, PendingRuleService> {
        if let Some(outcome) = self.runner.try_next() {
            return Ok(RuleService::start(self.parts, outcome.into_inner()));
        }
        if self.runner.is_idle() {
            // The load task never started
            return Ok(RuleService::start(self.parts, ServiceState::default()));
        }
        Err(self)
    }

    /// Block until the state has been read.
    pub fn wait(self) -> RuleService {
        loop {
            if let Some(outcome) = self.runner.next_timeout(Duration::from_millis(100)) {
                return RuleService::start(self.parts, outcome.into_inner());
            }
            if self.runner.is_idle() {
                return RuleService::start(self.parts, ServiceState::default());
            }
        }
    }
}

struct GroupRuntime {
    enabled: bool,
    exceptions: ExceptionLists,
    handlers: Vec<RuleSourceHandler>,
    index: RulesIndexManager,
}

impl GroupRuntime {
    fn handler(&self, id: SourceId) -> Option<&RuleSourceHandler> {
        self.handlers.iter().find(|h| h.id() == id)
    }

    fn handler_mut(&mut self, id: SourceId) -> Option<&mut RuleSourceHandler> {
        self.handlers.iter_mut().find(|h| h.id() == id)
    }
}

/// The loaded rule engine.
pub struct RuleService {
    config: RuleServiceConfig,
    clock: Arc<dyn Clock>,
    fetcher: Arc<dyn Fetcher>,
    parser: Arc<dyn RuleListParser>,
    index_builder: Arc<dyn RuleIndexBuilder>,
    runner: TaskRunner<Completion>,
    groups: PerGroup<GroupRuntime>,
    catalog: KnownRuleSources,
    reporter: BlockedUrlsReporter,
    storage: RuleServiceStorage,
    observers: ObserverList,
    version: i64,
}

impl RuleService {
    fn start(parts: Collaborators, mut state: ServiceState) -> Self {
        let migrated = state.migrate();
        let config = parts.config;

        let mut catalog = KnownRuleSources::new();
        let mut reporter = BlockedUrlsReporter::new(config.notification_interval());
        let mut persisted_checksums = PerGroup::<String>::default();

        let groups = {
            let ServiceState { groups, .. } = &mut state;
            PerGroup::from_fn(|group| {
                let state = std::mem::take(&mut groups[group]);
                let GroupState {
                    exceptions,
                    enabled,
                    index_checksum,
                    rule_sources,
                    known_sources,
                    deleted_presets,
                    counters,
                } = state;
                catalog.restore(group, known_sources, deleted_presets);
                reporter.set_counters(group, counters);
                persisted_checksums[group] = index_checksum;
                GroupRuntime {
                    enabled,
                    exceptions,
                    handlers: rule_sources
                        .into_iter()
                        .map(|source| RuleSourceHandler::new(source, &config.data_dir))
                        .collect(),
                    index: RulesIndexManager::new(group, &config),
                }
            })
        };

        let mut service = Self {
            storage: RuleServiceStorage::new(&config),
            config,
            clock: parts.clock,
            fetcher: parts.fetcher,
            parser: parts.parser,
            index_builder: parts.index_builder,
            runner: TaskRunner::new(),
            groups,
            catalog,
            reporter,
            observers: parts.observers,
            version: state.version,
        };

        for group in RuleGroup::ALL {
            service.start_group(group, &persisted_checksums[group]);
        }
        if migrated {
            service.schedule_persist();
        }
        log::info!(
            "Rule service loaded: {} tracking and {} ad-blocking sources",
            service.groups[RuleGroup::Tracking].handlers.len(),
            service.groups[RuleGroup::AdBlocking].handlers.len()
        );
        service.notify(RuleServiceEvent::Loaded);
        service
    }

    fn start_group(&mut self, group: RuleGroup, persisted_checksum: &str) {
        let runtime = &mut self.groups[group];
        let reads: Vec<ReadTask> = runtime.handlers.iter().filter_map(|h| h.read_task()).collect();
        let index_task = runtime
            .index
            .start(persisted_checksum, reads.iter().map(|r| r.id));

        // Sources that never committed rules are fetched right away
        let fetches: Vec<FetchTask> = runtime
            .handlers
            .iter_mut()
            .filter(|h| !h.source().has_committed_rules())
            .filter_map(|h| h.fetch_now())
            .collect();

        if let Some(task) = index_task {
            self.post_index(task);
        }
        for read in reads {
            self.post_read(read);
        }
        for fetch in fetches {
            self.post_fetch(fetch);
        }
        self.rebuild(group);
    }

    fn now(&self) -> SystemTime {
        self.clock.now()
    }

    pub fn config(&self) -> &RuleServiceConfig {
        &self.config
    }

    // Background work

    fn post_fetch(&self, task: FetchTask) {
        let fetcher = self.fetcher.clone();
        let parser = self.parser.clone();
        let aborted = Completion::Fetch(task.aborted());
        self.runner.post(
            "fetch",
            move || Completion::Fetch(task.run(fetcher.as_ref(), parser.as_ref())),
            aborted,
        );
    }

    fn post_read(&self, task: ReadTask) {
        let aborted = Completion::Read(task.aborted());
        self.runner
            .post("read-rules", move || Completion::Read(task.run()), aborted);
    }

    fn post_index(&self, task: IndexTask) {
        let builder = self.index_builder.clone();
        let aborted = Completion::Index(task.aborted());
        self.runner.post(
            "index",
            move || Completion::Index(task.run(builder.as_ref())),
            aborted,
        );
    }

    fn rebuild(&mut self, group: RuleGroup) {
        match self.groups[group].index.rebuild_if_needed() {
            Rebuild::UpToDate => {}
            Rebuild::Cleared => {
                self.notify(RuleServiceEvent::RulesIndexUpdated {
                    group,
                    checksum: String::new(),
                });
                self.schedule_persist();
            }
            Rebuild::Start(task) => self.post_index(task),
        }
    }

    /// Apply finished background work and fire due timers without blocking.
    ///
    /// Returns the number of background results applied.
    pub fn run_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Some(outcome) = self.runner.try_next() {
            self.on_completion(outcome.into_inner());
            applied += 1;
        }
        self.run_timers();
        applied
    }

    /// Run until no background work is in flight.
    pub fn run_until_idle(&mut self) {
        loop {
            self.run_pending();
            if self.runner.is_idle() {
                break;
            }
            if let Some(outcome) = self.runner.next_timeout(Duration::from_millis(50)) {
                self.on_completion(outcome.into_inner());
            }
        }
    }

    /// Whether background work is in flight.
    pub fn is_idle(&self) -> bool {
        self.runner.is_idle()
    }

    /// Earliest time at which a timer or a scheduled fetch is due.
    pub fn next_wakeup(&self) -> Option<SystemTime> {
        let fetches = self.groups.iter().flat_map(|(_, runtime)| {
            runtime
                .handlers
                .iter()
                .filter(|h| h.source().base.is_from_url())
                .filter_map(|h| h.source().next_fetch)
        });
        fetches
            .chain(self.reporter.next_deadline())
            .chain(self.storage.next_deadline())
            .min()
    }

    fn run_timers(&mut self) {
        let now = self.now();

        let mut due = Vec::new();
        for (_, runtime) in self.groups.iter_mut() {
            for handler in runtime.handlers.iter_mut() {
                if handler.is_fetch_due(now) {
                    due.extend(handler.fetch_now());
                }
            }
        }
        for task in due {
            self.post_fetch(task);
        }

        if let Some(tabs) = self.reporter.poll_notification(now) {
            self.notify(RuleServiceEvent::NewBlockedUrlsReported { tabs });
        }

        if self.storage.take_due(now) {
            let state = self.snapshot();
            self.storage.write(&state);
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Fetch(fetch) => self.on_fetch_complete(fetch),
            Completion::Read(read) => self.on_rules_read(read),
            Completion::Index(index) => self.on_index_complete(index),
        }
    }

    fn on_fetch_complete(&mut self, completion: FetchCompletion) {
        let group = completion.group;
        let id = completion.id;
        let now = self.now();
        let config = &self.config;
        let Some(handler) = self.groups[group].handler_mut(id) else {
            log::debug!("Dropping fetch result for deleted source {}", id);
            completion.discard();
            return;
        };
        let Some(update) = handler.on_fetch_complete(completion, config, now) else {
            return;
        };

        if let FetchUpdate::Applied(rules) = update {
            self.reporter
                .on_tracker_infos_updated(group, id, &rules.tracker_infos);
            if self.groups[group].index.on_rule_source_updated(rules.buffer) {
                self.rebuild(group);
            }
        }
        self.notify(RuleServiceEvent::RuleSourceUpdated { group, id });
        self.schedule_persist();
    }

    fn on_rules_read(&mut self, completion: ReadCompletion) {
        let group = completion.group;
        let id = completion.id;
        let runtime = &mut self.groups[group];
        let Some(handler) = runtime.handler_mut(id) else {
            runtime.index.cancel_read(id);
            self.rebuild(group);
            return;
        };

        let retry = match completion.rules {
            Some(rules) => {
                runtime.index.on_rules_read(id, Some(rules.buffer));
                self.reporter
                    .on_tracker_infos_updated(group, id, &rules.tracker_infos);
                None
            }
            None => {
                let retry = handler.fetch_after_read_failure();
                runtime.index.on_rules_read(id, None);
                retry
            }
        };
        if let Some(task) = retry {
            self.post_fetch(task);
        }
        self.rebuild(group);
    }

    fn on_index_complete(&mut self, completion: IndexCompletion) {
        let group = completion.group;
        let checksum = completion.checksum.clone();
        if self.groups[group].index.on_index_task_complete(completion) {
            self.notify(RuleServiceEvent::RulesIndexUpdated { group, checksum });
            self.schedule_persist();
        }
        self.rebuild(group);
    }

    // Observers and persistence

    pub fn add_observer(&mut self, observer: Observer) -> ObserverId {
        self.observers.add(observer)
    }

    /// Register for the listed event kinds only.
    pub fn add_observer_for(&mut self, kinds: &[EventKind], observer: Observer) -> ObserverId {
        self.observers.add_filtered(kinds, observer)
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    pub(crate) fn notify(&mut self, event: RuleServiceEvent) {
        log::debug!("Event: {:?}", event.kind());
        self.observers.notify(&event);
    }

    pub(crate) fn schedule_persist(&mut self) {
        let now = self.now();
        self.storage.schedule_write(now);
    }

    /// Current state in its persisted form.
    pub fn snapshot(&self) -> ServiceState {
        ServiceState {
            groups: self.groups.map(|group, runtime| GroupState {
                exceptions: runtime.exceptions.clone(),
                enabled: runtime.enabled,
                index_checksum: runtime.index.index_checksum().to_string(),
                rule_sources: runtime.handlers.iter().map(|h| h.source().clone()).collect(),
                known_sources: self.catalog.sources(group).to_vec(),
                deleted_presets: self.catalog.deleted_presets(group).clone(),
                counters: self.reporter.blocked_domains(group).clone(),
            }),
            version: self.version,
        }
    }

    /// Write the state now, cancelling any pending debounced write.
    pub fn flush(&mut self) -> bool {
        let state = self.snapshot();
        self.storage.flush(&state)
    }

    pub fn has_pending_write(&self) -> bool {
        self.storage.has_pending_write()
    }

    /// Number of state writes completed so far.
    pub fn write_count(&self) -> usize {
        self.storage.write_count()
    }

    /// Flush and stop. Background work still in flight is abandoned.
    pub fn shutdown(mut self) -> bool {
        self.flush()
    }

    // Rule groups

    pub fn is_rule_group_enabled(&self, group: RuleGroup) -> bool {
        self.groups[group].enabled
    }

    pub fn set_rule_group_enabled(&mut self, group: RuleGroup, enabled: bool) {
        if self.groups[group].enabled == enabled {
            return;
        }
        self.groups[group].enabled = enabled;
        log::info!("{} {}", if enabled { "Enabled" } else { "Disabled" }, group);
        self.notify(RuleServiceEvent::GroupStateChanged { group, enabled });
        self.schedule_persist();
    }

    pub fn index_status(&self, group: RuleGroup) -> IndexStatus {
        self.groups[group].index.status()
    }

    pub fn index_checksum(&self, group: RuleGroup) -> &str {
        self.groups[group].index.index_checksum()
    }

    /// Number of index builds started for `group` in this session.
    pub fn rebuild_count(&self, group: RuleGroup) -> u64 {
        self.groups[group].index.rebuild_count()
    }

    // Rule sources

    pub fn add_rules_from_url(&mut self, group: RuleGroup, url: &Url) -> Result<SourceId, SourceError> {
        let origin = SourceOrigin::from_url(url.clone())?;
        self.add_and_catalog(RuleSourceBase::new(origin, group))
    }

    pub fn add_rules_from_file(&mut self, group: RuleGroup, path: &Path) -> Result<SourceId, SourceError> {
        let origin = SourceOrigin::from_file(path)?;
        self.add_and_catalog(RuleSourceBase::new(origin, group))
    }

    fn add_and_catalog(&mut self, base: RuleSourceBase) -> Result<SourceId, SourceError> {
        let group = base.group();
        let id = self.add_rule_source(base.clone())?;
        if self.catalog.add(KnownRuleSource::new(base)).is_ok() {
            self.notify(RuleServiceEvent::KnownSourceAdded { group, id });
        }
        Ok(id)
    }

    /// Activate a source and start its first fetch.
    pub(crate) fn add_rule_source(&mut self, base: RuleSourceBase) -> Result<SourceId, SourceError> {
        let group = base.group();
        let id = base.id();
        if self.groups[group].handler(id).is_some() {
            return Err(SourceError::AlreadyExists);
        }
        log::info!("Adding rule source {} ({}) to {}", id, base.origin(), group);
        let mut handler = RuleSourceHandler::new(RuleSource::new(base), &self.config.data_dir);
        let task = handler.fetch_now();
        self.groups[group].handlers.push(handler);
        if let Some(task) = task {
            self.post_fetch(task);
        }
        self.notify(RuleServiceEvent::RuleSourceAdded { group, id });
        self.schedule_persist();
        Ok(id)
    }

    pub(crate) fn has_rule_source(&self, group: RuleGroup, id: SourceId) -> bool {
        self.groups[group].handler(id).is_some()
    }

    pub fn get_rule_source(&self, group: RuleGroup, id: SourceId) -> Option<&RuleSource> {
        self.groups[group].handler(id).map(RuleSourceHandler::source)
    }

    pub fn get_rule_sources(&self, group: RuleGroup) -> Vec<&RuleSource> {
        self.groups[group]
            .handlers
            .iter()
            .map(RuleSourceHandler::source)
            .collect()
    }

    /// Fetch a source now. A fetch already in progress is left alone.
    pub fn fetch_rule_source_now(&mut self, group: RuleGroup, id: SourceId) -> Result<(), SourceError> {
        let handler = self.groups[group]
            .handler_mut(id)
            .ok_or(SourceError::NotFound)?;
        if let Some(task) = handler.fetch_now() {
            self.post_fetch(task);
        }
        Ok(())
    }

    pub fn delete_rule_source(&mut self, group: RuleGroup, id: SourceId) -> Result<(), SourceError> {
        let runtime = &mut self.groups[group];
        let pos = runtime
            .handlers
            .iter()
            .position(|h| h.id() == id)
            .ok_or(SourceError::NotFound)?;
        let mut handler = runtime.handlers.remove(pos);
        handler.clear();
        runtime.index.on_rule_source_deleted(id);
        log::info!("Deleted rule source {} from {}", id, group);

        self.reporter
            .on_tracker_infos_updated(group, id, &TrackerInfoMap::new());
        self.rebuild(group);
        self.notify(RuleServiceEvent::RuleSourceDeleted { group, id });
        self.schedule_persist();
        Ok(())
    }

    // Known sources

    pub fn known_sources(&mut self) -> KnownRuleSourcesHandler<'_> {
        KnownRuleSourcesHandler::new(self)
    }

    pub(crate) fn catalog(&self) -> &KnownRuleSources {
        &self.catalog
    }

    pub(crate) fn catalog_mut(&mut self) -> &mut KnownRuleSources {
        &mut self.catalog
    }

    // Exceptions

    pub fn get_active_exception_list(&self, group: RuleGroup) -> ExceptionsList {
        self.groups[group].exceptions.active()
    }

    /// Switch the active exception list. Always notifies and persists.
    pub fn set_active_exception_list(&mut self, group: RuleGroup, list: ExceptionsList) {
        let runtime = &mut self.groups[group];
        runtime.exceptions.set_active(list);
        runtime.index.handle().clear_cache();
        self.notify(RuleServiceEvent::ExceptionListStateChanged {
            group,
            active: list,
        });
        self.schedule_persist();
    }

    pub fn exception_domains(&self, group: RuleGroup, list: ExceptionsList) -> &BTreeSet<String> {
        self.groups[group].exceptions.domains(list)
    }

    /// Add `domain` to one exception list. Returns `true` if it changed.
    pub fn add_exception_for_domain(&mut self, group: RuleGroup, list: ExceptionsList, domain: &str) -> bool {
        let changed = self.groups[group].exceptions.add_domain(list, domain);
        self.exceptions_changed(group, list, changed)
    }

    /// Remove `domain` and each of its parent domains from one exception
    /// list. Returns `true` if it changed.
    pub fn remove_exception_for_domain(&mut self, group: RuleGroup, list: ExceptionsList, domain: &str) -> bool {
        let changed = self.groups[group].exceptions.remove_domain(list, domain);
        self.exceptions_changed(group, list, changed)
    }

    pub fn remove_all_exceptions(&mut self, group: RuleGroup, list: ExceptionsList) -> bool {
        let changed = self.groups[group].exceptions.remove_all(list);
        self.exceptions_changed(group, list, changed)
    }

    fn exceptions_changed(&mut self, group: RuleGroup, list: ExceptionsList, changed: bool) -> bool {
        if changed {
            self.groups[group].index.handle().clear_cache();
            self.notify(RuleServiceEvent::ExceptionListChanged { group, list });
            self.schedule_persist();
        }
        changed
    }

    /// Whether requests from `origin` skip filtering in `group`.
    pub fn is_exempt_of_filtering(&self, group: RuleGroup, origin: Option<&Url>) -> bool {
        self.groups[group].exceptions.is_exempt(origin)
    }

    // Matching

    /// Whether the main-frame document at `url` is blocked by `group`.
    pub fn is_document_blocked(&mut self, group: RuleGroup, frame: FrameContext, url: &Url) -> bool {
        let runtime = &self.groups[group];
        if !runtime.enabled || !is_filterable(url) || runtime.exceptions.is_exempt(Some(url)) {
            return false;
        }
        let handle = runtime.index.handle();
        if handle.activations(url).contains(ActivationFlags::ALLOW_ALL) {
            return false;
        }
        let blocked = handle
            .find_request_match(url, None, ResourceKind::Document)
            .is_blocked();
        if blocked {
            self.on_blocked(group, url, frame);
        }
        blocked
    }

    /// Match a request against every enabled group and report a block.
    pub fn should_block_request(&mut self, request: &Request) -> bool {
        if !is_filterable(&request.url) {
            return false;
        }
        let origin = match (&request.initiator, request.kind) {
            (Some(initiator), _) => Some(initiator),
            (None, ResourceKind::Document) => Some(&request.url),
            (None, _) => None,
        };

        for group in RuleGroup::ALL {
            let runtime = &self.groups[group];
            if !runtime.enabled || runtime.exceptions.is_exempt(origin) {
                continue;
            }
            let handle = runtime.index.handle();
            if let Some(page) = origin {
                if handle.activations(page).contains(ActivationFlags::ALLOW_ALL) {
                    continue;
                }
            }
            let result =
                handle.find_request_match(&request.url, request.initiator.as_ref(), request.kind);
            if result.is_blocked() {
                self.on_blocked(group, &request.url, request.frame);
                return true;
            }
        }
        false
    }

    fn on_blocked(&mut self, group: RuleGroup, url: &Url, frame: FrameContext) {
        let now = self.now();
        self.reporter.on_url_blocked(group, url, frame, now);
        self.schedule_persist();
    }

    /// Give `filter` read access to both groups' indexes.
    pub fn initialize_cosmetic_filter(&self, filter: &mut dyn CosmeticFilter) {
        filter.set_rules_indexes(
            self.groups
                .map(|_, runtime| Arc::downgrade(runtime.index.handle())),
        );
    }

    // Telemetry

    pub fn reporter(&self) -> &BlockedUrlsReporter {
        &self.reporter
    }

    pub fn get_tracker_info(
        &self,
        group: RuleGroup,
        domain: &str,
    ) -> Option<&std::collections::BTreeMap<SourceId, serde_json::Value>> {
        self.reporter.tracker_info(group, domain)
    }

    pub fn clear_blocked_counters(&mut self) {
        if self.reporter.clear_counters() {
            self.schedule_persist();
        }
    }

    pub fn did_start_navigation(&mut self, tab: TabId, navigation: NavigationId) {
        self.reporter.did_start_navigation(tab, navigation);
    }

    pub fn did_finish_navigation(&mut self, tab: TabId, navigation: NavigationId, committed: bool) {
        self.reporter
            .did_finish_navigation(tab, navigation, committed);
    }

    pub fn on_tab_removed(&mut self, tab: TabId) {
        self.reporter.on_tab_removed(tab);
    }
}

impl Drop for RuleService {
    fn drop(&mut self) {
        if self.storage.has_pending_write() {
            self.flush();
        }
    }
}

impl std::fmt::Debug for RuleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleService")
            .field("data_dir", &self.config.data_dir)
            .field("in_flight", &self.runner.in_flight())
            .field("observers", &self.observers.len())
            .finish()
    }
}
