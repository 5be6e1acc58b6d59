//! Blocked request telemetry.
//!
//! Every block is counted per domain and recorded on the tab that made the
//! request. Tabs keep blocks of a navigation that has not committed yet in
//! a separate buffer, so an abandoned navigation never shows up on the tab.
//! Observers are told which tabs changed at most once per notification
//! interval.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, SystemTime};

use url::Url;

use crate::exceptions::{canonicalize_domain, domain_suffixes};
use crate::group::{PerGroup, RuleGroup};
use crate::parser::TrackerInfoMap;
use crate::sequence::OneShotTimer;
use crate::source::SourceId;

/// Browser tab identifier.
pub type TabId = u64;

/// Navigation identifier, increasing over time within a tab.
pub type NavigationId = u64;

/// Where a request was made from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameContext {
    pub tab_id: TabId,
    pub is_main_frame: bool,
}

/// Blocks recorded for one page in one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockedUrlsInfo {
    /// URLs blocked by generic rules
    pub blocked_urls: BTreeSet<String>,
    /// URLs blocked as known trackers, keyed by tracker domain
    pub trackers: BTreeMap<String, BTreeSet<String>>,
}

impl BlockedUrlsInfo {
    pub fn is_empty(&self) -> bool {
        self.blocked_urls.is_empty() && self.trackers.is_empty()
    }

    /// Total number of distinct blocked URLs.
    pub fn len(&self) -> usize {
        self.blocked_urls.len() + self.trackers.values().map(BTreeSet::len).sum::<usize>()
    }
}

/// Per-tab blocked URL detail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabBlockedUrls {
    committed: PerGroup<BlockedUrlsInfo>,
    /// Navigations that started but have not finished, oldest first
    pending: Vec<(NavigationId, PerGroup<BlockedUrlsInfo>)>,
}

impl TabBlockedUrls {
    /// Blocks of the page currently shown in the tab.
    pub fn committed(&self, group: RuleGroup) -> &BlockedUrlsInfo {
        &self.committed[group]
    }

    pub fn has_pending_navigation(&self) -> bool {
        !self.pending.is_empty()
    }

    fn start_navigation(&mut self, navigation: NavigationId) {
        self.pending.retain(|(id, _)| *id != navigation);
        self.pending.push((navigation, PerGroup::default()));
    }

    fn finish_navigation(&mut self, navigation: NavigationId, committed: bool) {
        let Some(pos) = self.pending.iter().position(|(id, _)| *id == navigation) else {
            return;
        };
        let (_, info) = self.pending.remove(pos);
        if committed {
            self.committed = info;
            // Older navigations can no longer commit over this one
            self.pending.retain(|(id, _)| *id > navigation);
        }
    }

    /// Buffer that receives new blocks: the newest pending navigation, or the
    /// committed page when nothing is pending.
    fn current_mut(&mut self, group: RuleGroup) -> &mut BlockedUrlsInfo {
        match self.pending.last_mut() {
            Some((_, info)) => &mut info[group],
            None => &mut self.committed[group],
        }
    }
}

/// Aggregates block events into counters and per-tab detail.
#[derive(Debug)]
pub struct BlockedUrlsReporter {
    counters: PerGroup<BTreeMap<String, u64>>,
    tracker_infos: PerGroup<HashMap<String, BTreeMap<SourceId, serde_json::Value>>>,
    tabs: HashMap<TabId, TabBlockedUrls>,
    new_blocked_tabs: PerGroup<BTreeSet<TabId>>,
    notification_timer: OneShotTimer,
    last_notification: Option<SystemTime>,
    interval: Duration,
}

impl BlockedUrlsReporter {
    pub fn new(interval: Duration) -> Self {
        Self {
            counters: PerGroup::default(),
            tracker_infos: PerGroup::default(),
            tabs: HashMap::new(),
            new_blocked_tabs: PerGroup::default(),
            notification_timer: OneShotTimer::new(),
            last_notification: None,
            interval,
        }
    }

    /// Restore persisted counters.
    pub fn set_counters(&mut self, group: RuleGroup, counters: BTreeMap<String, u64>) {
        self.counters[group] = counters;
    }

    /// Per-domain block counts of `group`.
    pub fn blocked_domains(&self, group: RuleGroup) -> &BTreeMap<String, u64> {
        &self.counters[group]
    }

    /// Reset every counter. Returns `true` if any counter was set.
    pub fn clear_counters(&mut self) -> bool {
        let mut changed = false;
        for (_, counters) in self.counters.iter_mut() {
            changed |= !counters.is_empty();
            counters.clear();
        }
        changed
    }

    pub fn tab_blocked_urls(&self, tab: TabId) -> Option<&TabBlockedUrls> {
        self.tabs.get(&tab)
    }

    /// Tracker attributions for exactly `domain`, keyed by contributing source.
    pub fn tracker_info(
        &self,
        group: RuleGroup,
        domain: &str,
    ) -> Option<&BTreeMap<SourceId, serde_json::Value>> {
        self.tracker_infos[group].get(domain)
    }

    /// Replace the tracker attributions contributed by `source`.
    ///
    /// Domains left without any contributing source are dropped.
    pub fn on_tracker_infos_updated(
        &mut self,
        group: RuleGroup,
        source: SourceId,
        infos: &TrackerInfoMap,
    ) {
        let map = &mut self.tracker_infos[group];
        map.retain(|_, by_source| {
            by_source.remove(&source);
            !by_source.is_empty()
        });
        for (domain, info) in infos {
            map.entry(domain.clone())
                .or_default()
                .insert(source, info.clone());
        }
    }

    /// Record a blocked request.
    pub fn on_url_blocked(&mut self, group: RuleGroup, url: &Url, frame: FrameContext, now: SystemTime) {
        let Some(host) = url.host_str().and_then(canonicalize_domain) else {
            return;
        };

        let tracker = domain_suffixes(&host)
            .find(|suffix| self.tracker_infos[group].contains_key(*suffix))
            .map(str::to_string);

        let tab = self.tabs.entry(frame.tab_id).or_default();
        let info = tab.current_mut(group);
        let counted_domain = match tracker {
            Some(domain) => {
                info.trackers
                    .entry(domain.clone())
                    .or_default()
                    .insert(url.to_string());
                domain
            }
            None => {
                info.blocked_urls.insert(url.to_string());
                host
            }
        };
        *self.counters[group].entry(counted_domain).or_insert(0) += 1;

        self.new_blocked_tabs[group].insert(frame.tab_id);
        self.schedule_notification(now);
    }

    /// The first block of a burst arms the timer; everything blocked until it
    /// fires goes out in one notification, at most one per interval.
    fn schedule_notification(&mut self, now: SystemTime) {
        if self.notification_timer.is_running() {
            return;
        }
        let since_last = self
            .last_notification
            .and_then(|last| now.duration_since(last).ok());
        let delay = match since_last {
            Some(elapsed) if elapsed < self.interval => self.interval - elapsed,
            _ => self.interval,
        };
        self.notification_timer.start(now, delay);
    }

    /// When the pending notification is due, if one is scheduled.
    pub fn next_deadline(&self) -> Option<SystemTime> {
        self.notification_timer.deadline()
    }

    /// Take the tabs to report if the notification is due.
    pub fn poll_notification(&mut self, now: SystemTime) -> Option<PerGroup<BTreeSet<TabId>>> {
        if !self.notification_timer.take_if_due(now) {
            return None;
        }
        self.last_notification = Some(now);
        let tabs = std::mem::take(&mut self.new_blocked_tabs);
        if tabs.iter().all(|(_, t)| t.is_empty()) {
            return None;
        }
        Some(tabs)
    }

    /// A main-frame navigation started in `tab`.
    pub fn did_start_navigation(&mut self, tab: TabId, navigation: NavigationId) {
        self.tabs.entry(tab).or_default().start_navigation(navigation);
    }

    /// A main-frame navigation finished, committed or not.
    pub fn did_finish_navigation(&mut self, tab: TabId, navigation: NavigationId, committed: bool) {
        if let Some(state) = self.tabs.get_mut(&tab) {
            state.finish_navigation(navigation, committed);
        }
    }

    pub fn on_tab_removed(&mut self, tab: TabId) {
        self.tabs.remove(&tab);
        for (_, tabs) in self.new_blocked_tabs.iter_mut() {
            tabs.remove(&tab);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{Clock, ManualClock};
    use serde_json::json;

    const TAB: TabId = 7;

    fn frame() -> FrameContext {
        FrameContext {
            tab_id: TAB,
            is_main_frame: false,
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn reporter() -> BlockedUrlsReporter {
        BlockedUrlsReporter::new(Duration::from_secs(1))
    }

    #[test]
    fn test_generic_block_counts_full_host() {
        let clock = ManualClock::default();
        let mut reporter = reporter();
        reporter.on_url_blocked(RuleGroup::AdBlocking, &url("https://a.ads.example.com/x"), frame(), clock.now());
        reporter.on_url_blocked(RuleGroup::AdBlocking, &url("https://a.ads.example.com/y"), frame(), clock.now());

        assert_eq!(reporter.blocked_domains(RuleGroup::AdBlocking)["a.ads.example.com"], 2);
        assert!(reporter.blocked_domains(RuleGroup::Tracking).is_empty());
        let tab = reporter.tab_blocked_urls(TAB).unwrap();
        assert_eq!(tab.committed(RuleGroup::AdBlocking).blocked_urls.len(), 2);
    }

    #[test]
    fn test_tracker_block_counts_matched_domain() {
        let clock = ManualClock::default();
        let mut reporter = reporter();
        let mut infos = TrackerInfoMap::new();
        infos.insert("tracker.example".to_string(), json!({"company": "Example"}));
        reporter.on_tracker_infos_updated(RuleGroup::Tracking, SourceId(1), &infos);

        reporter.on_url_blocked(RuleGroup::Tracking, &url("https://cdn.tracker.example/p.gif"), frame(), clock.now());

        assert_eq!(reporter.blocked_domains(RuleGroup::Tracking)["tracker.example"], 1);
        let info = reporter.tab_blocked_urls(TAB).unwrap().committed(RuleGroup::Tracking);
        assert!(info.blocked_urls.is_empty());
        assert_eq!(info.trackers["tracker.example"].len(), 1);
    }

    #[test]
    fn test_tracker_info_garbage_collection() {
        let mut reporter = reporter();
        let mut infos = TrackerInfoMap::new();
        infos.insert("d.example".to_string(), json!({"n": 1}));
        reporter.on_tracker_infos_updated(RuleGroup::Tracking, SourceId(1), &infos);
        reporter.on_tracker_infos_updated(RuleGroup::Tracking, SourceId(2), &infos);

        reporter.on_tracker_infos_updated(RuleGroup::Tracking, SourceId(1), &TrackerInfoMap::new());
        assert_eq!(reporter.tracker_info(RuleGroup::Tracking, "d.example").unwrap().len(), 1);

        reporter.on_tracker_infos_updated(RuleGroup::Tracking, SourceId(2), &TrackerInfoMap::new());
        assert!(reporter.tracker_info(RuleGroup::Tracking, "d.example").is_none());
    }

    #[test]
    fn test_navigation_rollback() {
        let clock = ManualClock::default();
        let mut reporter = reporter();
        reporter.on_url_blocked(RuleGroup::AdBlocking, &url("https://ads.example.com/1"), frame(), clock.now());
        let before = reporter.tab_blocked_urls(TAB).unwrap().clone();

        reporter.did_start_navigation(TAB, 1);
        reporter.on_url_blocked(RuleGroup::AdBlocking, &url("https://ads.example.com/2"), frame(), clock.now());
        reporter.on_url_blocked(RuleGroup::Tracking, &url("https://t.example.com/3"), frame(), clock.now());
        reporter.did_finish_navigation(TAB, 1, false);

        let after = reporter.tab_blocked_urls(TAB).unwrap();
        assert_eq!(after.committed(RuleGroup::AdBlocking), before.committed(RuleGroup::AdBlocking));
        assert_eq!(after.committed(RuleGroup::Tracking), before.committed(RuleGroup::Tracking));
        assert!(!after.has_pending_navigation());
    }

    #[test]
    fn test_commit_replaces_page_blocks() {
        let clock = ManualClock::default();
        let mut reporter = reporter();
        reporter.on_url_blocked(RuleGroup::AdBlocking, &url("https://ads.example.com/old"), frame(), clock.now());

        reporter.did_start_navigation(TAB, 1);
        reporter.on_url_blocked(RuleGroup::AdBlocking, &url("https://ads.example.com/new"), frame(), clock.now());
        reporter.did_finish_navigation(TAB, 1, true);

        let info = reporter.tab_blocked_urls(TAB).unwrap().committed(RuleGroup::AdBlocking);
        let urls: Vec<&str> = info.blocked_urls.iter().map(String::as_str).collect();
        assert_eq!(urls, vec!["https://ads.example.com/new"]);
    }

    #[test]
    fn test_older_navigation_cannot_clobber_newer() {
        let clock = ManualClock::default();
        let mut reporter = reporter();
        reporter.did_start_navigation(TAB, 1);
        reporter.did_start_navigation(TAB, 2);
        reporter.on_url_blocked(RuleGroup::AdBlocking, &url("https://ads.example.com/b"), frame(), clock.now());
        reporter.did_finish_navigation(TAB, 2, true);
        // The older navigation was superseded by the commit and is gone
        reporter.did_finish_navigation(TAB, 1, true);

        let info = reporter.tab_blocked_urls(TAB).unwrap().committed(RuleGroup::AdBlocking);
        assert_eq!(info.len(), 1);
    }

    #[test]
    fn test_debounced_notification() {
        let clock = ManualClock::default();
        let mut reporter = reporter();

        for i in 0..100 {
            let tab = FrameContext {
                tab_id: i % 3,
                is_main_frame: false,
            };
            reporter.on_url_blocked(RuleGroup::AdBlocking, &url(&format!("https://ads.example.com/{}", i)), tab, clock.now());
            // Polling between blocks does not split the burst
            assert!(reporter.poll_notification(clock.now()).is_none());
            clock.advance(Duration::from_millis(1));
        }

        clock.advance(Duration::from_millis(899));
        assert!(reporter.poll_notification(clock.now()).is_none());
        clock.advance(Duration::from_millis(1));
        let tabs = reporter.poll_notification(clock.now()).unwrap();
        assert_eq!(tabs[RuleGroup::AdBlocking].len(), 3);
        assert!(reporter.poll_notification(clock.now()).is_none());

        // Within the interval the next report waits for the remainder
        reporter.on_url_blocked(RuleGroup::Tracking, &url("https://t.example.com/"), frame(), clock.now());
        assert!(reporter.poll_notification(clock.now()).is_none());
        clock.advance(Duration::from_millis(999));
        assert!(reporter.poll_notification(clock.now()).is_none());
        clock.advance(Duration::from_millis(1));
        let tabs = reporter.poll_notification(clock.now()).unwrap();
        assert!(tabs[RuleGroup::Tracking].contains(&TAB));
    }

    #[test]
    fn test_tab_removal_drops_pending_report() {
        let clock = ManualClock::default();
        let mut reporter = reporter();
        reporter.on_url_blocked(RuleGroup::AdBlocking, &url("https://ads.example.com/"), frame(), clock.now());
        reporter.on_tab_removed(TAB);
        assert!(reporter.tab_blocked_urls(TAB).is_none());
        assert!(reporter.poll_notification(clock.now()).is_none());
    }

    #[test]
    fn test_clear_counters() {
        let clock = ManualClock::default();
        let mut reporter = reporter();
        assert!(!reporter.clear_counters());
        reporter.on_url_blocked(RuleGroup::AdBlocking, &url("https://ads.example.com/"), frame(), clock.now());
        assert!(reporter.clear_counters());
        assert!(reporter.blocked_domains(RuleGroup::AdBlocking).is_empty());
    }
}
