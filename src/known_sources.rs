//! Catalog of rule sources the user could enable.
//!
//! Catalog membership is independent of activation: a known source can be
//! listed and disabled. Built-in presets that the user removed are
//! remembered by preset id, so resetting presets never brings them back.

use std::collections::BTreeSet;
use std::path::Path;

use url::Url;

use crate::error::SourceError;
use crate::group::{PerGroup, RuleGroup};
use crate::observer::RuleServiceEvent;
use crate::presets::presets_for;
use crate::service::RuleService;
use crate::source::{KnownRuleSource, RuleSourceBase, SourceId, SourceOrigin};

/// Known sources of both groups, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownRuleSources {
    sources: PerGroup<Vec<KnownRuleSource>>,
    deleted_presets: PerGroup<BTreeSet<String>>,
}

impl KnownRuleSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore one group from persisted state.
    pub fn restore(
        &mut self,
        group: RuleGroup,
        sources: Vec<KnownRuleSource>,
        deleted_presets: BTreeSet<String>,
    ) {
        self.sources[group] = sources
            .into_iter()
            .filter(|s| s.base.group() == group)
            .collect();
        self.deleted_presets[group] = deleted_presets;
    }

    pub fn sources(&self, group: RuleGroup) -> &[KnownRuleSource] {
        &self.sources[group]
    }

    pub fn deleted_presets(&self, group: RuleGroup) -> &BTreeSet<String> {
        &self.deleted_presets[group]
    }

    pub fn get(&self, group: RuleGroup, id: SourceId) -> Option<&KnownRuleSource> {
        self.sources[group].iter().find(|s| s.id() == id)
    }

    pub fn contains(&self, group: RuleGroup, id: SourceId) -> bool {
        self.get(group, id).is_some()
    }

    /// Insert a catalog entry.
    pub fn add(&mut self, known: KnownRuleSource) -> Result<SourceId, SourceError> {
        let group = known.base.group();
        let id = known.id();
        if self.contains(group, id) {
            return Err(SourceError::AlreadyExists);
        }
        self.sources[group].push(known);
        Ok(id)
    }

    pub fn add_from_url(&mut self, group: RuleGroup, url: &Url) -> Result<SourceId, SourceError> {
        let origin = SourceOrigin::from_url(url.clone())?;
        self.add(KnownRuleSource::new(RuleSourceBase::new(origin, group)))
    }

    pub fn add_from_file(&mut self, group: RuleGroup, path: &Path) -> Result<SourceId, SourceError> {
        let origin = SourceOrigin::from_file(path)?;
        self.add(KnownRuleSource::new(RuleSourceBase::new(origin, group)))
    }

    /// Remove a catalog entry. A removed preset is recorded as deleted.
    pub fn remove(&mut self, group: RuleGroup, id: SourceId) -> Result<KnownRuleSource, SourceError> {
        let pos = self.sources[group]
            .iter()
            .position(|s| s.id() == id)
            .ok_or(SourceError::NotFound)?;
        let removed = self.sources[group].remove(pos);
        if removed.is_preset() {
            self.deleted_presets[group].insert(removed.preset_id.clone());
        }
        Ok(removed)
    }

    /// Re-derive the preset entries of `group` from the built-in presets.
    ///
    /// Missing presets are added unless the user deleted them, and entries
    /// for presets that no longer exist are dropped. Returns the added and
    /// the removed ids.
    pub fn reset_presets(&mut self, group: RuleGroup) -> (Vec<SourceId>, Vec<SourceId>) {
        let builtin: Vec<KnownRuleSource> = presets_for(group)
            .filter_map(|preset| preset.known_source())
            .collect();

        let mut removed = Vec::new();
        self.sources[group].retain(|s| {
            let keep = !s.is_preset() || builtin.iter().any(|b| b.preset_id == s.preset_id);
            if !keep {
                removed.push(s.id());
            }
            keep
        });

        let mut added = Vec::new();
        for known in builtin {
            if self.deleted_presets[group].contains(&known.preset_id) {
                continue;
            }
            if let Ok(id) = self.add(known) {
                added.push(id);
            }
        }
        (added, removed)
    }
}

/// Catalog operations bound to a running [`RuleService`].
///
/// Every mutating call notifies observers synchronously before returning.
pub struct KnownRuleSourcesHandler<'a> {
    service: &'a mut RuleService,
}

impl<'a> KnownRuleSourcesHandler<'a> {
    pub(crate) fn new(service: &'a mut RuleService) -> Self {
        Self { service }
    }

    pub fn sources(&self, group: RuleGroup) -> &[KnownRuleSource] {
        self.service.catalog().sources(group)
    }

    pub fn get(&self, group: RuleGroup, id: SourceId) -> Option<&KnownRuleSource> {
        self.service.catalog().get(group, id)
    }

    pub fn add_source_from_url(&mut self, group: RuleGroup, url: &Url) -> Result<SourceId, SourceError> {
        let id = self.service.catalog_mut().add_from_url(group, url)?;
        self.added(group, id);
        Ok(id)
    }

    pub fn add_source_from_file(
        &mut self,
        group: RuleGroup,
        path: &Path,
    ) -> Result<SourceId, SourceError> {
        let id = self.service.catalog_mut().add_from_file(group, path)?;
        self.added(group, id);
        Ok(id)
    }

    fn added(&mut self, group: RuleGroup, id: SourceId) {
        self.service
            .notify(RuleServiceEvent::KnownSourceAdded { group, id });
        self.service.schedule_persist();
    }

    /// Remove a catalog entry, disabling the source first if it is active.
    pub fn remove_source(&mut self, group: RuleGroup, id: SourceId) -> Result<(), SourceError> {
        if !self.service.catalog().contains(group, id) {
            return Err(SourceError::NotFound);
        }
        if self.service.has_rule_source(group, id) {
            self.service.delete_rule_source(group, id)?;
        }
        self.service.catalog_mut().remove(group, id)?;
        self.service
            .notify(RuleServiceEvent::KnownSourceRemoved { group, id });
        self.service.schedule_persist();
        Ok(())
    }

    /// Activate a known source. Enabling an active source does nothing.
    pub fn enable_source(&mut self, group: RuleGroup, id: SourceId) -> Result<(), SourceError> {
        let known = self
            .service
            .catalog()
            .get(group, id)
            .ok_or(SourceError::NotFound)?
            .clone();
        if self.service.has_rule_source(group, id) {
            return Ok(());
        }
        self.service.add_rule_source(known.base)?;
        self.service
            .notify(RuleServiceEvent::KnownSourceEnabled { group, id });
        Ok(())
    }

    /// Deactivate a known source. Disabling an inactive source does nothing.
    pub fn disable_source(&mut self, group: RuleGroup, id: SourceId) -> Result<(), SourceError> {
        if !self.service.catalog().contains(group, id) {
            return Err(SourceError::NotFound);
        }
        if !self.service.has_rule_source(group, id) {
            return Ok(());
        }
        self.service.delete_rule_source(group, id)?;
        self.service
            .notify(RuleServiceEvent::KnownSourceDisabled { group, id });
        Ok(())
    }

    pub fn is_source_enabled(&self, group: RuleGroup, id: SourceId) -> bool {
        self.service.has_rule_source(group, id)
    }

    /// Re-derive the preset entries of `group`. Returns the ids added.
    pub fn reset_preset_sources(&mut self, group: RuleGroup) -> Vec<SourceId> {
        let (added, removed) = self.service.catalog_mut().reset_presets(group);
        for &id in &removed {
            self.service
                .notify(RuleServiceEvent::KnownSourceRemoved { group, id });
        }
        for &id in &added {
            self.service
                .notify(RuleServiceEvent::KnownSourceAdded { group, id });
        }
        if !added.is_empty() || !removed.is_empty() {
            self.service.schedule_persist();
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets::find;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_add_rejects_duplicates_and_bad_input() {
        let mut catalog = KnownRuleSources::new();
        let id = catalog
            .add_from_url(RuleGroup::AdBlocking, &url("https://lists.example.com/a.txt"))
            .unwrap();
        assert_eq!(
            catalog.add_from_url(RuleGroup::AdBlocking, &url("https://lists.example.com/a.txt")),
            Err(SourceError::AlreadyExists)
        );
        // Same origin in the other group is a different source
        assert_ne!(
            catalog
                .add_from_url(RuleGroup::Tracking, &url("https://lists.example.com/a.txt"))
                .unwrap(),
            id
        );
        assert_eq!(
            catalog.add_from_url(RuleGroup::Tracking, &url("file:///etc/hosts")),
            Err(SourceError::InvalidUrl)
        );
        assert_eq!(
            catalog.add_from_file(RuleGroup::Tracking, Path::new("../lists/a.txt")),
            Err(SourceError::InvalidPath)
        );
        assert_eq!(catalog.sources(RuleGroup::AdBlocking).len(), 1);
    }

    #[test]
    fn test_removing_preset_records_deletion() {
        let mut catalog = KnownRuleSources::new();
        let (added, _) = catalog.reset_presets(RuleGroup::AdBlocking);
        assert_eq!(added.len(), 2);

        let easylist = find("easylist").unwrap().known_source().unwrap().id();
        let removed = catalog.remove(RuleGroup::AdBlocking, easylist).unwrap();
        assert!(removed.is_preset());
        assert!(catalog.deleted_presets(RuleGroup::AdBlocking).contains("easylist"));
        assert_eq!(
            catalog.remove(RuleGroup::AdBlocking, easylist),
            Err(SourceError::NotFound)
        );

        let (added, removed) = catalog.reset_presets(RuleGroup::AdBlocking);
        assert!(added.is_empty());
        assert!(removed.is_empty());
        assert!(!catalog.contains(RuleGroup::AdBlocking, easylist));
    }

    #[test]
    fn test_reset_drops_unknown_presets_and_keeps_user_sources() {
        let mut catalog = KnownRuleSources::new();
        let user = catalog
            .add_from_url(RuleGroup::Tracking, &url("https://lists.example.com/mine.txt"))
            .unwrap();
        let mut stale = KnownRuleSource::new(RuleSourceBase::new(
            SourceOrigin::from_url(url("https://old.example.com/list.txt")).unwrap(),
            RuleGroup::Tracking,
        ));
        stale.preset_id = "retired".to_string();
        stale.removable = false;
        let stale_id = catalog.add(stale).unwrap();

        let (added, removed) = catalog.reset_presets(RuleGroup::Tracking);
        assert_eq!(added.len(), 1);
        assert_eq!(removed, vec![stale_id]);
        assert!(catalog.contains(RuleGroup::Tracking, user));
    }

    #[test]
    fn test_restore_filters_foreign_group() {
        let mut catalog = KnownRuleSources::new();
        let foreign = KnownRuleSource::new(RuleSourceBase::new(
            SourceOrigin::from_url(url("https://lists.example.com/a.txt")).unwrap(),
            RuleGroup::AdBlocking,
        ));
        catalog.restore(RuleGroup::Tracking, vec![foreign], BTreeSet::new());
        assert!(catalog.sources(RuleGroup::Tracking).is_empty());
    }
}
