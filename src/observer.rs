//! Engine events and observer registration.
//!
//! Observers are plain closures called synchronously on the owning sequence,
//! in registration order, after the state change they describe.

use std::collections::BTreeSet;

use crate::exceptions::ExceptionsList;
use crate::group::{PerGroup, RuleGroup};
use crate::reporter::TabId;
use crate::source::SourceId;

/// Everything the engine reports to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleServiceEvent {
    /// Persisted state has been read and the engine is usable.
    Loaded,
    RuleSourceAdded { group: RuleGroup, id: SourceId },
    /// A fetch finished, successfully or not.
    RuleSourceUpdated { group: RuleGroup, id: SourceId },
    RuleSourceDeleted { group: RuleGroup, id: SourceId },
    GroupStateChanged { group: RuleGroup, enabled: bool },
    ExceptionListStateChanged { group: RuleGroup, active: ExceptionsList },
    ExceptionListChanged { group: RuleGroup, list: ExceptionsList },
    /// A group's compiled index was replaced.
    RulesIndexUpdated { group: RuleGroup, checksum: String },
    /// Tabs that saw new blocks since the previous report, per group.
    NewBlockedUrlsReported { tabs: PerGroup<BTreeSet<TabId>> },
    KnownSourceAdded { group: RuleGroup, id: SourceId },
    KnownSourceRemoved { group: RuleGroup, id: SourceId },
    KnownSourceEnabled { group: RuleGroup, id: SourceId },
    KnownSourceDisabled { group: RuleGroup, id: SourceId },
}

/// Discriminant of a [`RuleServiceEvent`], for filtered observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Loaded,
    RuleSourceAdded,
    RuleSourceUpdated,
    RuleSourceDeleted,
    GroupStateChanged,
    ExceptionListStateChanged,
    ExceptionListChanged,
    RulesIndexUpdated,
    NewBlockedUrlsReported,
    KnownSourceAdded,
    KnownSourceRemoved,
    KnownSourceEnabled,
    KnownSourceDisabled,
}

impl RuleServiceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RuleServiceEvent::Loaded => EventKind::Loaded,
            RuleServiceEvent::RuleSourceAdded { .. } => EventKind::RuleSourceAdded,
            RuleServiceEvent::RuleSourceUpdated { .. } => EventKind::RuleSourceUpdated,
            RuleServiceEvent::RuleSourceDeleted { .. } => EventKind::RuleSourceDeleted,
            RuleServiceEvent::GroupStateChanged { .. } => EventKind::GroupStateChanged,
            RuleServiceEvent::ExceptionListStateChanged { .. } => {
                EventKind::ExceptionListStateChanged
            }
            RuleServiceEvent::ExceptionListChanged { .. } => EventKind::ExceptionListChanged,
            RuleServiceEvent::RulesIndexUpdated { .. } => EventKind::RulesIndexUpdated,
            RuleServiceEvent::NewBlockedUrlsReported { .. } => EventKind::NewBlockedUrlsReported,
            RuleServiceEvent::KnownSourceAdded { .. } => EventKind::KnownSourceAdded,
            RuleServiceEvent::KnownSourceRemoved { .. } => EventKind::KnownSourceRemoved,
            RuleServiceEvent::KnownSourceEnabled { .. } => EventKind::KnownSourceEnabled,
            RuleServiceEvent::KnownSourceDisabled { .. } => EventKind::KnownSourceDisabled,
        }
    }
}

/// Handle returned by observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// Callback invoked for each event.
pub type Observer = Box<dyn FnMut(&RuleServiceEvent)>;

struct Registration {
    id: ObserverId,
    /// Empty means every kind
    kinds: BTreeSet<EventKind>,
    callback: Observer,
}

/// Registered observers.
#[derive(Default)]
pub struct ObserverList {
    next_id: u64,
    observers: Vec<Registration>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for every event.
    pub fn add(&mut self, callback: Observer) -> ObserverId {
        self.add_filtered(&[], callback)
    }

    /// Register for the listed kinds only. An empty list means every kind.
    pub fn add_filtered(&mut self, kinds: &[EventKind], callback: Observer) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push(Registration {
            id,
            kinds: kinds.iter().copied().collect(),
            callback,
        });
        id
    }

    /// Returns `true` if the observer was registered.
    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|r| r.id != id);
        self.observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn notify(&mut self, event: &RuleServiceEvent) {
        let kind = event.kind();
        for registration in &mut self.observers {
            if registration.kinds.is_empty() || registration.kinds.contains(&kind) {
                (registration.callback)(event);
            }
        }
    }
}

impl std::fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<RuleServiceEvent>>>, Observer) {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        (events, Box::new(move |e: &RuleServiceEvent| sink.borrow_mut().push(e.clone())))
    }

    #[test]
    fn test_notify_all_and_remove() {
        let mut list = ObserverList::new();
        let (events, observer) = recorder();
        let id = list.add(observer);

        list.notify(&RuleServiceEvent::Loaded);
        assert_eq!(events.borrow().len(), 1);

        assert!(list.remove(id));
        assert!(!list.remove(id));
        list.notify(&RuleServiceEvent::Loaded);
        assert_eq!(events.borrow().len(), 1);
    }

    #[test]
    fn test_filtered_observer() {
        let mut list = ObserverList::new();
        let (events, observer) = recorder();
        list.add_filtered(&[EventKind::GroupStateChanged], observer);

        list.notify(&RuleServiceEvent::Loaded);
        list.notify(&RuleServiceEvent::GroupStateChanged {
            group: RuleGroup::Tracking,
            enabled: false,
        });
        assert_eq!(
            *events.borrow(),
            vec![RuleServiceEvent::GroupStateChanged {
                group: RuleGroup::Tracking,
                enabled: false,
            }]
        );
    }
}
