//! Exception lists and the exemption algorithm.
//!
//! Each rule group keeps two domain sets. Only one is active at a time:
//!
//! - [`ExceptionsList::ProcessList`]: only listed domains are filtered.
//! - [`ExceptionsList::ExemptList`]: everything is filtered except listed domains.
//!
//! Both sets are always kept, so switching the active list changes behaviour
//! without re-entering domains.

use std::collections::BTreeSet;

use url::Url;

/// Which named exception set a domain belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ExceptionsList {
    /// Domains whose pages get filtered
    ProcessList = 0,
    /// Domains whose pages are left alone
    #[default]
    ExemptList = 1,
}

impl ExceptionsList {
    pub const ALL: [ExceptionsList; 2] = [ExceptionsList::ProcessList, ExceptionsList::ExemptList];

    /// Convert from the persisted integer value.
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(ExceptionsList::ProcessList),
            1 => Some(ExceptionsList::ExemptList),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Key of this list's array in the state file.
    pub fn storage_key(self) -> &'static str {
        match self {
            ExceptionsList::ProcessList => "process_list",
            ExceptionsList::ExemptList => "exempt_list",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "process" | "process_list" | "process-list" => Some(ExceptionsList::ProcessList),
            "exempt" | "exempt_list" | "exempt-list" => Some(ExceptionsList::ExemptList),
            _ => None,
        }
    }
}

/// Lowercase a host and strip one trailing dot.
///
/// Returns `None` for an empty host.
pub fn canonicalize_domain(domain: &str) -> Option<String> {
    let trimmed = domain.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_lowercase())
}

/// Iterate over `host` and each parent domain, most specific first.
///
/// `a.b.example.com` yields `a.b.example.com`, `b.example.com`,
/// `example.com`, `com`.
pub fn domain_suffixes(host: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(host);
    std::iter::from_fn(move || {
        let current = next?;
        next = current.find('.').map(|pos| &current[pos + 1..]).filter(|s| !s.is_empty());
        Some(current)
    })
}

/// Both exception sets of one rule group plus which one is active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionLists {
    active: ExceptionsList,
    process_list: BTreeSet<String>,
    exempt_list: BTreeSet<String>,
}

impl ExceptionLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> ExceptionsList {
        self.active
    }

    /// Switch the active list. Returns `true` if it changed.
    pub fn set_active(&mut self, list: ExceptionsList) -> bool {
        let changed = self.active != list;
        self.active = list;
        changed
    }

    pub fn domains(&self, list: ExceptionsList) -> &BTreeSet<String> {
        match list {
            ExceptionsList::ProcessList => &self.process_list,
            ExceptionsList::ExemptList => &self.exempt_list,
        }
    }

    fn domains_mut(&mut self, list: ExceptionsList) -> &mut BTreeSet<String> {
        match list {
            ExceptionsList::ProcessList => &mut self.process_list,
            ExceptionsList::ExemptList => &mut self.exempt_list,
        }
    }

    /// Add a domain to one list. Returns `true` if the list changed.
    pub fn add_domain(&mut self, list: ExceptionsList, domain: &str) -> bool {
        match canonicalize_domain(domain) {
            Some(domain) => self.domains_mut(list).insert(domain),
            None => false,
        }
    }

    /// Remove a domain and every parent domain of it from one list.
    ///
    /// Walks the same suffixes as [`is_exempt_host`](Self::is_exempt_host), so
    /// after removing `a.example.com` neither `a.example.com` nor any of its
    /// parents remains listed. Returns `true` if the list changed.
    pub fn remove_domain(&mut self, list: ExceptionsList, domain: &str) -> bool {
        let Some(domain) = canonicalize_domain(domain) else {
            return false;
        };
        let set = self.domains_mut(list);
        let mut changed = false;
        for suffix in domain_suffixes(&domain) {
            changed |= set.remove(suffix);
        }
        changed
    }

    /// Empty one list. Returns `true` if the list changed.
    pub fn remove_all(&mut self, list: ExceptionsList) -> bool {
        let set = self.domains_mut(list);
        let changed = !set.is_empty();
        set.clear();
        changed
    }

    /// Replace the content of one list, used when restoring persisted state.
    pub fn set_domains<I, S>(&mut self, list: ExceptionsList, domains: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = self.domains_mut(list);
        set.clear();
        set.extend(domains.into_iter().filter_map(|d| canonicalize_domain(d.as_ref())));
    }

    fn default_exempt(&self) -> bool {
        self.active == ExceptionsList::ProcessList
    }

    /// Decide whether requests from `origin` skip filtering.
    ///
    /// An opaque origin (`None`, or a URL without a host) gets the default of
    /// the active list.
    pub fn is_exempt(&self, origin: Option<&Url>) -> bool {
        match origin.and_then(|o| o.host_str()) {
            Some(host) => self.is_exempt_host(host),
            None => self.default_exempt(),
        }
    }

    /// Host-level form of [`is_exempt`](Self::is_exempt).
    pub fn is_exempt_host(&self, host: &str) -> bool {
        let default_exempt = self.default_exempt();
        let Some(host) = canonicalize_domain(host) else {
            return default_exempt;
        };
        let active = self.domains(self.active);
        if domain_suffixes(&host).any(|suffix| active.contains(suffix)) {
            return !default_exempt;
        }
        default_exempt
    }
}
