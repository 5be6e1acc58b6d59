//! Built-in rule source presets.

use url::Url;

use crate::group::RuleGroup;
use crate::source::{KnownRuleSource, RuleSourceBase, SourceOrigin};

/// A rule list shipped with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    /// Stable identifier, persisted in `deleted-presets`
    pub preset_id: &'static str,
    pub group: RuleGroup,
    pub url: &'static str,
    /// State schema version that first enabled this preset
    pub since_version: i64,
}

/// Every built-in preset.
pub const PRESETS: &[Preset] = &[
    Preset {
        preset_id: "easyprivacy",
        group: RuleGroup::Tracking,
        url: "https://easylist.to/easylist/easyprivacy.txt",
        since_version: 1,
    },
    Preset {
        preset_id: "easylist",
        group: RuleGroup::AdBlocking,
        url: "https://easylist.to/easylist/easylist.txt",
        since_version: 1,
    },
    Preset {
        preset_id: "fanboy-annoyance",
        group: RuleGroup::AdBlocking,
        url: "https://secure.fanboy.co.nz/fanboy-annoyance.txt",
        since_version: 3,
    },
];

impl Preset {
    /// Catalog entry for this preset.
    ///
    /// Returns `None` only if the built-in URL does not parse.
    pub fn known_source(&self) -> Option<KnownRuleSource> {
        let url = Url::parse(self.url).ok()?;
        let origin = SourceOrigin::from_url(url).ok()?;
        let mut known = KnownRuleSource::new(RuleSourceBase::new(origin, self.group));
        known.removable = false;
        known.preset_id = self.preset_id.to_string();
        Some(known)
    }
}

/// Presets belonging to `group`.
pub fn presets_for(group: RuleGroup) -> impl Iterator<Item = &'static Preset> {
    PRESETS.iter().filter(move |p| p.group == group)
}

/// Presets introduced by schema `version`.
pub fn presets_since(version: i64) -> impl Iterator<Item = &'static Preset> {
    PRESETS.iter().filter(move |p| p.since_version == version)
}

pub fn find(preset_id: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.preset_id == preset_id)
}
