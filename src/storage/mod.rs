//! Persisted engine state.
//!
//! The whole engine state lives in one JSON file:
//!
//! ```text
//! {
//!   "tracking-rules":    { <group state> },
//!   "ad-blocking-rules": { <group state> },
//!   "version": 3
//! }
//! ```
//!
//! Every field is optional and falls back to its
//! default, and a file that cannot be parsed at all is replaced by its backup
//! or, failing that, by an empty state. Timestamps and durations are stored
//! as integer microseconds since the Unix epoch.

mod writer;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};
use url::Url;

use crate::config::RuleServiceConfig;
use crate::exceptions::{ExceptionLists, ExceptionsList};
use crate::group::{PerGroup, RuleGroup};
use crate::presets::presets_since;
use crate::source::{
    AdBlockMetadata, FetchResult, KnownRuleSource, RuleSource, RuleSourceBase, RulesInfo,
    SourceOrigin,
};
use crate::Result;

pub use writer::{backup_path, DebouncedWriter};
pub(crate) use writer::{remove_if_exists, write_atomic};

/// Schema version written by this build.
pub const CURRENT_VERSION: i64 = 3;

/// Persisted state of one rule group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupState {
    pub exceptions: ExceptionLists,
    pub enabled: bool,
    pub index_checksum: String,
    pub rule_sources: Vec<RuleSource>,
    pub known_sources: Vec<KnownRuleSource>,
    /// Preset ids the user removed from the catalog
    pub deleted_presets: BTreeSet<String>,
    pub counters: BTreeMap<String, u64>,
}

impl Default for GroupState {
    fn default() -> Self {
        Self {
            exceptions: ExceptionLists::default(),
            enabled: true,
            index_checksum: String::new(),
            rule_sources: Vec::new(),
            known_sources: Vec::new(),
            deleted_presets: BTreeSet::new(),
            counters: BTreeMap::new(),
        }
    }
}

/// Persisted state of the whole engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceState {
    pub groups: PerGroup<GroupState>,
    /// Zero for a state that has never been written
    pub version: i64,
}

impl ServiceState {
    /// Serialize to the on-disk JSON form.
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        for (group, state) in self.groups.iter() {
            root.insert(group.storage_key().to_string(), group_to_json(state));
        }
        root.insert("version".to_string(), json!(self.version));
        Value::Object(root)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.to_json())?)
    }

    /// Deserialize from the on-disk JSON form, tolerating missing and
    /// malformed fields.
    pub fn from_json(value: &Value) -> Self {
        let groups = PerGroup::from_fn(|group| match value.get(group.storage_key()) {
            Some(Value::Object(obj)) => group_from_json(group, obj),
            _ => GroupState::default(),
        });
        let version = value.get("version").and_then(Value::as_i64).unwrap_or(0);
        Self { groups, version }
    }

    /// Bring a state written by an older build up to [`CURRENT_VERSION`].
    ///
    /// Each step runs only when the stored version is below it. Returns
    /// `true` if anything changed.
    pub fn migrate(&mut self) -> bool {
        let from = self.version;
        if from >= CURRENT_VERSION {
            return false;
        }
        if from < 1 {
            self.seed_presets(1);
        }
        if from < 2 {
            self.backfill_known_sources();
        }
        if from < 3 {
            self.seed_presets(3);
        }
        self.version = CURRENT_VERSION;
        log::info!("Migrated rule service state from version {} to {}", from, CURRENT_VERSION);
        true
    }

    fn seed_presets(&mut self, version: i64) {
        for preset in presets_since(version) {
            let Some(known) = preset.known_source() else {
                log::warn!("Skipping preset {} with invalid URL", preset.preset_id);
                continue;
            };
            let state = &mut self.groups[preset.group];
            if state.deleted_presets.contains(preset.preset_id) {
                continue;
            }
            let id = known.id();
            if !state.rule_sources.iter().any(|s| s.id() == id) {
                state.rule_sources.push(RuleSource::new(known.base.clone()));
            }
            if !state.known_sources.iter().any(|k| k.id() == id) {
                state.known_sources.push(known);
            }
            log::debug!("Seeded preset {} into {}", preset.preset_id, preset.group);
        }
    }

    /// Versions before 2 had no catalog; every active source becomes known.
    fn backfill_known_sources(&mut self) {
        for (_, state) in self.groups.iter_mut() {
            for source in &state.rule_sources {
                if !state.known_sources.iter().any(|k| k.id() == source.id()) {
                    state.known_sources.push(KnownRuleSource::new(source.base.clone()));
                }
            }
        }
    }
}

/// Read the state file, falling back to its backup and then to defaults.
pub fn load_state(path: &Path) -> ServiceState {
    for candidate in [path.to_path_buf(), backup_path(path)] {
        match fs::read(&candidate) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) if value.is_object() => {
                    log::debug!("Loaded rule service state from {}", candidate.display());
                    return ServiceState::from_json(&value);
                }
                Ok(_) => log::warn!("Ignoring {}: not a JSON object", candidate.display()),
                Err(e) => log::warn!("Ignoring {}: {}", candidate.display(), e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to read {}: {}", candidate.display(), e),
        }
    }
    log::info!("No usable state at {}, starting from defaults", path.display());
    ServiceState::default()
}

/// Owns the state file writer.
#[derive(Debug)]
pub struct RuleServiceStorage {
    writer: DebouncedWriter,
}

impl RuleServiceStorage {
    pub fn new(config: &RuleServiceConfig) -> Self {
        Self {
            writer: DebouncedWriter::new(config.state_path(), config.persist_delay()),
        }
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    /// Schedule a debounced write.
    pub fn schedule_write(&mut self, now: SystemTime) {
        self.writer.schedule(now);
    }

    pub fn has_pending_write(&self) -> bool {
        self.writer.has_pending_write()
    }

    pub fn next_deadline(&self) -> Option<SystemTime> {
        self.writer.next_deadline()
    }

    /// Disarm and return `true` if the debounced write is due.
    pub fn take_due(&mut self, now: SystemTime) -> bool {
        self.writer.take_due(now)
    }

    /// Queue `state` for writing.
    pub fn write(&self, state: &ServiceState) {
        match state.to_bytes() {
            Ok(bytes) => self.writer.write(bytes),
            Err(e) => log::error!("Failed to serialize rule service state: {}", e),
        }
    }

    /// Write `state` synchronously, cancelling any pending debounced write.
    pub fn flush(&mut self, state: &ServiceState) -> bool {
        match state.to_bytes() {
            Ok(bytes) => self.writer.flush(bytes),
            Err(e) => {
                log::error!("Failed to serialize rule service state: {}", e);
                false
            }
        }
    }

    pub fn write_count(&self) -> usize {
        self.writer.write_count()
    }
}

/// Microseconds in `duration`, saturating at `i64::MAX`.
fn saturating_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

fn time_to_json(time: SystemTime) -> Value {
    let micros = time
        .duration_since(UNIX_EPOCH)
        .map(saturating_micros)
        .unwrap_or(0);
    json!(micros)
}

fn time_from_json(value: Option<&Value>) -> Option<SystemTime> {
    let micros = value?.as_i64()?;
    let micros = u64::try_from(micros).ok()?;
    UNIX_EPOCH.checked_add(Duration::from_micros(micros))
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn bool_field(obj: &Map<String, Value>, key: &str, default: bool) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn u64_field(obj: &Map<String, Value>, key: &str) -> u64 {
    obj.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn url_field(obj: &Map<String, Value>, key: &str) -> Option<Url> {
    str_field(obj, key).and_then(|s| Url::parse(s).ok())
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn object_array<'a>(obj: &'a Map<String, Value>, key: &str) -> Vec<&'a Map<String, Value>> {
    obj.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

fn base_to_json(base: &RuleSourceBase, obj: &mut Map<String, Value>) {
    match base.origin() {
        SourceOrigin::Url(url) => obj.insert("source-url".to_string(), json!(url.as_str())),
        SourceOrigin::File(path) => {
            obj.insert("source-file".to_string(), json!(path.to_string_lossy()))
        }
    };
    obj.insert("group".to_string(), json!(base.group().as_i64()));
    obj.insert("allow-abp-snippets".to_string(), json!(base.allow_abp_snippets));
}

fn base_from_json(obj: &Map<String, Value>, expected: RuleGroup) -> Option<RuleSourceBase> {
    let group = match obj.get("group").and_then(Value::as_i64) {
        Some(v) => RuleGroup::from_i64(v)?,
        None => expected,
    };
    if group != expected {
        log::warn!(
            "Skipping source filed under {} but tagged {}",
            expected,
            group
        );
        return None;
    }

    let origin = if let Some(url) = str_field(obj, "source-url") {
        SourceOrigin::from_url(Url::parse(url).ok()?).ok()?
    } else {
        SourceOrigin::from_file(Path::new(str_field(obj, "source-file")?)).ok()?
    };

    let mut base = RuleSourceBase::new(origin, group);
    base.allow_abp_snippets = bool_field(obj, "allow-abp-snippets", false);
    Some(base)
}

fn rule_source_to_json(source: &RuleSource) -> Value {
    let mut obj = Map::new();
    base_to_json(&source.base, &mut obj);
    obj.insert("rules-list-checksum".to_string(), json!(source.rules_list_checksum));
    if let Some(time) = source.last_update {
        obj.insert("last-upate".to_string(), time_to_json(time));
    }
    if let Some(time) = source.next_fetch {
        obj.insert("next-fetch".to_string(), time_to_json(time));
    }
    obj.insert("last-fetch-result".to_string(), json!(source.last_fetch_result.as_i64()));
    obj.insert("has-tracker-infos".to_string(), json!(source.has_tracker_infos));
    obj.insert("valid-rules-count".to_string(), json!(source.rules_info.valid_rules));
    obj.insert(
        "unsupported-rules-count".to_string(),
        json!(source.rules_info.unsupported_rules),
    );
    obj.insert("invalid-rules-count".to_string(), json!(source.rules_info.invalid_rules));

    let metadata = &source.unsafe_adblock_metadata;
    obj.insert("title".to_string(), json!(metadata.title));
    for (key, url) in [
        ("homepage", &metadata.homepage),
        ("license", &metadata.license),
        ("redirect", &metadata.redirect),
    ] {
        if let Some(url) = url {
            obj.insert(key.to_string(), json!(url.as_str()));
        }
    }
    obj.insert("version".to_string(), json!(metadata.version));
    if let Some(expires) = metadata.expires {
        obj.insert("expires".to_string(), json!(saturating_micros(expires)));
    }
    Value::Object(obj)
}

fn rule_source_from_json(obj: &Map<String, Value>, group: RuleGroup) -> Option<RuleSource> {
    let mut source = RuleSource::new(base_from_json(obj, group)?);
    source.rules_list_checksum = str_field(obj, "rules-list-checksum")
        .unwrap_or_default()
        .to_string();
    source.last_update = time_from_json(obj.get("last-upate"));
    source.next_fetch = time_from_json(obj.get("next-fetch"));
    source.last_fetch_result = obj
        .get("last-fetch-result")
        .and_then(Value::as_i64)
        .map(FetchResult::from_i64)
        .unwrap_or_default();
    source.has_tracker_infos = bool_field(obj, "has-tracker-infos", false);
    source.rules_info = RulesInfo {
        valid_rules: u64_field(obj, "valid-rules-count"),
        unsupported_rules: u64_field(obj, "unsupported-rules-count"),
        invalid_rules: u64_field(obj, "invalid-rules-count"),
    };
    source.unsafe_adblock_metadata = AdBlockMetadata {
        homepage: url_field(obj, "homepage"),
        title: str_field(obj, "title").unwrap_or_default().to_string(),
        expires: obj
            .get("expires")
            .and_then(Value::as_u64)
            .map(Duration::from_micros),
        license: url_field(obj, "license"),
        redirect: url_field(obj, "redirect"),
        version: obj.get("version").and_then(Value::as_i64).unwrap_or(0),
    };
    Some(source)
}

fn known_source_to_json(known: &KnownRuleSource) -> Value {
    let mut obj = Map::new();
    base_to_json(&known.base, &mut obj);
    obj.insert("preset-id".to_string(), json!(known.preset_id));
    Value::Object(obj)
}

fn known_source_from_json(obj: &Map<String, Value>, group: RuleGroup) -> Option<KnownRuleSource> {
    let mut known = KnownRuleSource::new(base_from_json(obj, group)?);
    known.preset_id = str_field(obj, "preset-id").unwrap_or_default().to_string();
    // Presets stay non-removable; only the catalog entry can be hidden
    known.removable = !known.is_preset();
    Some(known)
}

fn group_to_json(state: &GroupState) -> Value {
    let mut obj = Map::new();
    obj.insert(
        "exceptions-type".to_string(),
        json!(state.exceptions.active().as_i64()),
    );
    for list in ExceptionsList::ALL {
        let domains: Vec<&str> = state.exceptions.domains(list).iter().map(String::as_str).collect();
        obj.insert(list.storage_key().to_string(), json!(domains));
    }
    obj.insert("enabled".to_string(), json!(state.enabled));
    obj.insert("index-checksum".to_string(), json!(state.index_checksum));
    obj.insert(
        "rule-sources".to_string(),
        Value::Array(state.rule_sources.iter().map(rule_source_to_json).collect()),
    );
    obj.insert(
        "known-sources".to_string(),
        Value::Array(state.known_sources.iter().map(known_source_to_json).collect()),
    );
    obj.insert("deleted-presets".to_string(), json!(state.deleted_presets));
    obj.insert("counters".to_string(), json!(state.counters));
    Value::Object(obj)
}

fn group_from_json(group: RuleGroup, obj: &Map<String, Value>) -> GroupState {
    let mut state = GroupState::default();

    let active = obj
        .get("exceptions-type")
        .and_then(Value::as_i64)
        .and_then(ExceptionsList::from_i64)
        .unwrap_or_default();
    state.exceptions.set_active(active);
    for list in ExceptionsList::ALL {
        state
            .exceptions
            .set_domains(list, string_array(obj.get(list.storage_key())));
    }

    state.enabled = bool_field(obj, "enabled", true);
    state.index_checksum = str_field(obj, "index-checksum")
        .unwrap_or_default()
        .to_string();

    for entry in object_array(obj, "rule-sources") {
        match rule_source_from_json(entry, group) {
            Some(source) if state.rule_sources.iter().all(|s| s.id() != source.id()) => {
                state.rule_sources.push(source)
            }
            Some(source) => log::warn!("Dropping duplicate rule source {}", source.id()),
            None => log::warn!("Dropping unreadable rule source entry in {}", group),
        }
    }
    for entry in object_array(obj, "known-sources") {
        match known_source_from_json(entry, group) {
            Some(known) if state.known_sources.iter().all(|k| k.id() != known.id()) => {
                state.known_sources.push(known)
            }
            Some(_) => {}
            None => log::warn!("Dropping unreadable known source entry in {}", group),
        }
    }

    state.deleted_presets = string_array(obj.get("deleted-presets")).into_iter().collect();
    if let Some(Value::Object(counters)) = obj.get("counters") {
        state.counters = counters
            .iter()
            .filter_map(|(domain, count)| Some((domain.clone(), count.as_u64()?)))
            .collect();
    }
    state
}
