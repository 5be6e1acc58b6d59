//! Rule source data model.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use url::Url;

use crate::error::SourceError;
use crate::group::RuleGroup;
use crate::index::fnv1a_hash;

/// Deterministic identifier of a rule source.
///
/// Derived from the source origin and its group; two sources with the same
/// origin in the same group always share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

impl SourceId {
    /// File stem used for this source's on-disk artifacts.
    pub fn file_stem(self) -> String {
        format!("{:016x}", self.0)
    }

    /// Parse the hex form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        u64::from_str_radix(s, 16).ok().map(SourceId)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Where a rule list comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOrigin {
    /// Downloaded from a remote URL
    Url(Url),
    /// Read from a local file
    File(PathBuf),
}

impl SourceOrigin {
    /// Validate and wrap a remote URL. Only http and https are accepted.
    pub fn from_url(url: Url) -> Result<Self, SourceError> {
        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(SourceOrigin::Url(url)),
            _ => Err(SourceError::InvalidUrl),
        }
    }

    /// Validate and wrap a local file path.
    ///
    /// The path must be absolute and must not contain `..` components. `.`
    /// components are dropped so that equivalent spellings share an id.
    pub fn from_file(path: &Path) -> Result<Self, SourceError> {
        if !path.is_absolute() {
            return Err(SourceError::InvalidPath);
        }
        let mut canonical = PathBuf::new();
        for component in path.components() {
            match component {
                Component::ParentDir => return Err(SourceError::InvalidPath),
                Component::CurDir => {}
                other => canonical.push(other.as_os_str()),
            }
        }
        if canonical.file_name().is_none() {
            return Err(SourceError::InvalidPath);
        }
        Ok(SourceOrigin::File(canonical))
    }

    /// String used for hashing and persistence.
    pub fn spec(&self) -> String {
        match self {
            SourceOrigin::Url(url) => url.as_str().to_string(),
            SourceOrigin::File(path) => path.to_string_lossy().into_owned(),
        }
    }
}

impl fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec())
    }
}

/// Identity shared by known and active rule sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSourceBase {
    origin: SourceOrigin,
    group: RuleGroup,
    id: SourceId,
    /// Whether scriptlet/snippet rules from this list may be honoured.
    pub allow_abp_snippets: bool,
}

impl RuleSourceBase {
    pub fn new(origin: SourceOrigin, group: RuleGroup) -> Self {
        let mut key = Vec::with_capacity(64);
        key.push(group as u8);
        key.push(b':');
        key.extend_from_slice(origin.spec().as_bytes());
        let id = SourceId(fnv1a_hash(&key));
        Self {
            origin,
            group,
            id,
            allow_abp_snippets: false,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn group(&self) -> RuleGroup {
        self.group
    }

    pub fn origin(&self) -> &SourceOrigin {
        &self.origin
    }

    pub fn is_from_url(&self) -> bool {
        matches!(self.origin, SourceOrigin::Url(_))
    }

    pub fn source_url(&self) -> Option<&Url> {
        match &self.origin {
            SourceOrigin::Url(url) => Some(url),
            SourceOrigin::File(_) => None,
        }
    }

    pub fn source_file(&self) -> Option<&Path> {
        match &self.origin {
            SourceOrigin::Url(_) => None,
            SourceOrigin::File(path) => Some(path),
        }
    }
}

/// Catalog entry for a source the user could enable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownRuleSource {
    pub base: RuleSourceBase,
    /// False for built-in presets that cannot be deleted
    pub removable: bool,
    /// Empty for user-added sources
    pub preset_id: String,
}

impl KnownRuleSource {
    pub fn new(base: RuleSourceBase) -> Self {
        Self {
            base,
            removable: true,
            preset_id: String::new(),
        }
    }

    pub fn id(&self) -> SourceId {
        self.base.id()
    }

    pub fn is_preset(&self) -> bool {
        !self.preset_id.is_empty()
    }
}

/// Outcome of the most recent fetch of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FetchResult {
    Success = 0,
    DownloadFailed = 1,
    FileNotFound = 2,
    FileReadError = 3,
    FileUnsupported = 4,
    FailedSavingParsedRules = 5,
    #[default]
    Unknown = 6,
}

impl FetchResult {
    /// Convert from the persisted integer value; unknown values map to `Unknown`.
    pub fn from_i64(v: i64) -> Self {
        match v {
            0 => FetchResult::Success,
            1 => FetchResult::DownloadFailed,
            2 => FetchResult::FileNotFound,
            3 => FetchResult::FileReadError,
            4 => FetchResult::FileUnsupported,
            5 => FetchResult::FailedSavingParsedRules,
            _ => FetchResult::Unknown,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn is_success(self) -> bool {
        self == FetchResult::Success
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchResult::Success => "success",
            FetchResult::DownloadFailed => "download-failed",
            FetchResult::FileNotFound => "file-not-found",
            FetchResult::FileReadError => "file-read-error",
            FetchResult::FileUnsupported => "file-unsupported",
            FetchResult::FailedSavingParsedRules => "failed-saving-parsed-rules",
            FetchResult::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FetchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule counts from the last successful parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RulesInfo {
    pub valid_rules: u64,
    pub unsupported_rules: u64,
    pub invalid_rules: u64,
}

/// Metadata parsed out of the list content itself.
///
/// This comes from untrusted input and is for display only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdBlockMetadata {
    pub homepage: Option<Url>,
    pub title: String,
    pub expires: Option<Duration>,
    pub license: Option<Url>,
    pub redirect: Option<Url>,
    pub version: i64,
}

/// Live state of a source attached to a rule group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSource {
    pub base: RuleSourceBase,
    pub rules_list_checksum: String,
    pub unsafe_adblock_metadata: AdBlockMetadata,
    pub last_update: Option<SystemTime>,
    pub next_fetch: Option<SystemTime>,
    pub is_fetching: bool,
    pub last_fetch_result: FetchResult,
    pub rules_info: RulesInfo,
    pub has_tracker_infos: bool,
}

impl RuleSource {
    pub fn new(base: RuleSourceBase) -> Self {
        Self {
            base,
            rules_list_checksum: String::new(),
            unsafe_adblock_metadata: AdBlockMetadata::default(),
            last_update: None,
            next_fetch: None,
            is_fetching: false,
            last_fetch_result: FetchResult::Unknown,
            rules_info: RulesInfo::default(),
            has_tracker_infos: false,
        }
    }

    pub fn id(&self) -> SourceId {
        self.base.id()
    }

    pub fn group(&self) -> RuleGroup {
        self.base.group()
    }

    /// Whether a parsed rules buffer has been committed for this source.
    pub fn has_committed_rules(&self) -> bool {
        !self.rules_list_checksum.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_source(url: &str, group: RuleGroup) -> RuleSourceBase {
        let origin = SourceOrigin::from_url(Url::parse(url).unwrap()).unwrap();
        RuleSourceBase::new(origin, group)
    }

    #[test]
    fn test_id_is_deterministic() {
        let a = url_source("https://example.com/list.txt", RuleGroup::AdBlocking);
        let b = url_source("https://example.com/list.txt", RuleGroup::AdBlocking);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_id_depends_on_group() {
        let a = url_source("https://example.com/list.txt", RuleGroup::AdBlocking);
        let b = url_source("https://example.com/list.txt", RuleGroup::Tracking);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_id_display_parse() {
        let a = url_source("https://example.com/list.txt", RuleGroup::Tracking);
        assert_eq!(SourceId::parse(&a.id().to_string()), Some(a.id()));
    }

    #[test]
    fn test_from_url_rejects_other_schemes() {
        let ftp = Url::parse("ftp://example.com/list.txt").unwrap();
        assert_eq!(SourceOrigin::from_url(ftp), Err(SourceError::InvalidUrl));
        let data = Url::parse("data:text/plain,hello").unwrap();
        assert_eq!(SourceOrigin::from_url(data), Err(SourceError::InvalidUrl));
    }

    #[cfg(unix)]
    #[test]
    fn test_from_file_validation() {
        assert_eq!(
            SourceOrigin::from_file(Path::new("relative/list.txt")),
            Err(SourceError::InvalidPath)
        );
        assert_eq!(
            SourceOrigin::from_file(Path::new("/lists/../etc/passwd")),
            Err(SourceError::InvalidPath)
        );
        let a = SourceOrigin::from_file(Path::new("/lists/./mine.txt")).unwrap();
        let b = SourceOrigin::from_file(Path::new("/lists/mine.txt")).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            RuleSourceBase::new(a, RuleGroup::Tracking).id(),
            RuleSourceBase::new(b, RuleGroup::Tracking).id()
        );
    }

    #[test]
    fn test_fetch_result_roundtrip() {
        assert_eq!(FetchResult::from_i64(0), FetchResult::Success);
        assert_eq!(FetchResult::from_i64(5), FetchResult::FailedSavingParsedRules);
        assert_eq!(FetchResult::from_i64(42), FetchResult::Unknown);
        assert_eq!(FetchResult::default(), FetchResult::Unknown);
    }

    #[test]
    fn test_new_rule_source_has_no_committed_rules() {
        let source = RuleSource::new(url_source("https://example.com/a", RuleGroup::Tracking));
        assert!(!source.has_committed_rules());
        assert_eq!(source.last_fetch_result, FetchResult::Unknown);
        assert!(source.base.is_from_url());
    }
}
