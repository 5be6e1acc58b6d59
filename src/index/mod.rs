//! Compiled rule index.
//!
//! The engine only talks to a compiled index through [`RuleIndex`] and builds
//! one through [`RuleIndexBuilder`]. The default implementation is a binary
//! domain table that is either memory-mapped from disk or owned in memory.
//!
//! # File Structure
//!
//! ```text
//! +------------------+
//! |     HEADER       |  128 bytes (fixed)
//! +------------------+
//! |  DOMAIN ENTRIES  |  24 bytes each, sorted by (hash, flags)
//! +------------------+
//! |     PAYLOAD      |  domain strings
//! +------------------+
//! ```

mod format;
mod handle;
mod reader;
mod writer;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use url::Url;

use crate::parser::NetworkRule;
use crate::source::SourceId;
use crate::Result;

pub use format::{
    checksum_bytes, fnv1a_hash, sha256_hex, DomainEntry, EntryFlags, FormatFlags, IndexHeader,
    ENTRY_SIZE, FORMAT_VERSION, HEADER_SIZE, MAGIC,
};
pub use handle::{CacheStats, IndexHandle, IndexSnapshot};
pub use reader::{CompiledIndex, IndexBytes};
pub use writer::IndexWriter;

/// Kind of resource a request loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceKind {
    /// Main-frame document
    Document,
    /// Frame document
    Subdocument,
    Script,
    Image,
    Stylesheet,
    Font,
    Media,
    Xhr,
    #[default]
    Other,
}

impl ResourceKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "document" | "main_frame" => Some(ResourceKind::Document),
            "subdocument" | "sub_frame" => Some(ResourceKind::Subdocument),
            "script" => Some(ResourceKind::Script),
            "image" => Some(ResourceKind::Image),
            "stylesheet" | "css" => Some(ResourceKind::Stylesheet),
            "font" => Some(ResourceKind::Font),
            "media" => Some(ResourceKind::Media),
            "xhr" | "xmlhttprequest" | "fetch" => Some(ResourceKind::Xhr),
            "other" => Some(ResourceKind::Other),
            _ => None,
        }
    }
}

/// Outcome of matching one request against an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMatch {
    NoMatch,
    Blocked,
    /// An `@@` rule matched and overrides any block rule
    Allowed,
}

impl RequestMatch {
    pub fn is_blocked(self) -> bool {
        self == RequestMatch::Blocked
    }
}

impl fmt::Display for RequestMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestMatch::NoMatch => write!(f, "no-match"),
            RequestMatch::Blocked => write!(f, "blocked"),
            RequestMatch::Allowed => write!(f, "allowed"),
        }
    }
}

bitflags! {
    /// Page-level activations for a document.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ActivationFlags: u8 {
        /// `@@||domain^$document`: nothing on the page is filtered
        const ALLOW_ALL = 0b0000_0001;
        /// `||domain^$document`: the document itself is blocked
        const BLOCK_DOCUMENT = 0b0000_0010;
    }
}

/// Parsed rules of one source, as fed to an index build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleBuffer {
    pub source_id: SourceId,
    /// Checksum of `rules`, as reported by the parser
    pub checksum: String,
    pub rules: Arc<str>,
}

/// Checksum identifying a set of rule buffers.
///
/// Only the `(source id, buffer checksum)` pairs contribute, sorted by id, so
/// the result does not depend on the order of `buffers`. An empty set has the
/// empty checksum.
pub fn combined_checksum(buffers: &[RuleBuffer]) -> String {
    if buffers.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<(SourceId, &str)> = buffers
        .iter()
        .map(|b| (b.source_id, b.checksum.as_str()))
        .collect();
    pairs.sort_unstable();

    let mut input = String::with_capacity(pairs.len() * 82);
    for (id, checksum) in pairs {
        input.push_str(&id.file_stem());
        input.push(':');
        input.push_str(checksum);
        input.push('\n');
    }
    sha256_hex(input.as_bytes())
}

/// A compiled, queryable rule index.
pub trait RuleIndex: Send + Sync {
    /// Checksum of the rule buffers this index was built from.
    fn checksum(&self) -> &str;

    /// Number of distinct rules in the index.
    fn rule_count(&self) -> usize;

    /// Match a request for `url` made by a page at `initiator`.
    fn find_request_match(&self, url: &Url, initiator: Option<&Url>, kind: ResourceKind)
        -> RequestMatch;

    /// Page-level activations for a document at `url`.
    fn activations(&self, url: &Url) -> ActivationFlags;
}

/// Builds compiled index bytes and loads them back.
pub trait RuleIndexBuilder: Send + Sync {
    /// Compile `buffers` into index bytes stamped with `checksum`.
    fn build(&self, checksum: &str, buffers: &[RuleBuffer]) -> Result<Vec<u8>>;

    /// Load previously built bytes, rejecting them unless they were built
    /// for `expected_checksum`.
    fn load(&self, data: IndexBytes, expected_checksum: &str) -> Result<Box<dyn RuleIndex>>;
}

/// Builder for the default domain-table index.
#[derive(Debug, Default, Clone, Copy)]
pub struct DomainIndexBuilder;

impl RuleIndexBuilder for DomainIndexBuilder {
    fn build(&self, checksum: &str, buffers: &[RuleBuffer]) -> Result<Vec<u8>> {
        let mut writer = IndexWriter::new();
        for buffer in buffers {
            for line in buffer.rules.lines() {
                if let Some(rule) = NetworkRule::parse(line) {
                    writer.add(&rule);
                }
            }
        }
        writer.write(checksum)
    }

    fn load(&self, data: IndexBytes, expected_checksum: &str) -> Result<Box<dyn RuleIndex>> {
        Ok(Box::new(CompiledIndex::load(data, expected_checksum)?))
    }
}

/// Site of a host: its last two labels.
pub(crate) fn site_of(host: &str) -> &str {
    let host = host.strip_suffix('.').unwrap_or(host);
    match host.rmatch_indices('.').nth(1) {
        Some((pos, _)) => &host[pos + 1..],
        None => host,
    }
}
