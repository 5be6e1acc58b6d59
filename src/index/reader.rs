//! Compiled index reader with memory-mapping support.

use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap;
use sha2::{Digest, Sha256};
use url::Url;

use super::format::*;
use super::{site_of, ActivationFlags, RequestMatch, ResourceKind, RuleIndex};
use crate::exceptions::domain_suffixes;
use crate::{Error, Result};

/// Bytes backing a compiled index.
pub enum IndexBytes {
    /// Memory-mapped from a file on disk
    Mapped(Mmap),
    /// Built in memory
    Owned(Vec<u8>),
}

impl IndexBytes {
    /// Memory-map a compiled index file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // The file is only replaced by rename, never rewritten in place
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(IndexBytes::Mapped(mmap))
    }
}

impl Deref for IndexBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            IndexBytes::Mapped(mmap) => mmap,
            IndexBytes::Owned(data) => data,
        }
    }
}

impl std::fmt::Debug for IndexBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexBytes::Mapped(m) => write!(f, "Mapped({} bytes)", m.len()),
            IndexBytes::Owned(v) => write!(f, "Owned({} bytes)", v.len()),
        }
    }
}

/// A verified compiled index.
#[derive(Debug)]
pub struct CompiledIndex {
    data: IndexBytes,
    header: IndexHeader,
    checksum: String,
}

impl CompiledIndex {
    /// Verify and wrap compiled bytes.
    ///
    /// Fails unless the magic, version and section bounds are valid, the
    /// body digest matches and the bytes were built for `expected_checksum`.
    pub fn load(data: IndexBytes, expected_checksum: &str) -> Result<Self> {
        let header = IndexHeader::from_bytes(&data)?;
        header.validate()?;

        let checksum = header.source_checksum_hex();
        if checksum != expected_checksum {
            return Err(Error::ChecksumMismatch {
                expected: expected_checksum.to_string(),
                actual: checksum,
            });
        }

        let entries_end = (header.entry_offset as usize)
            .checked_add(header.entry_count as usize * ENTRY_SIZE)
            .ok_or_else(|| Error::CorruptIndex("entry table overflows".to_string()))?;
        let payload_end = (header.payload_offset as usize)
            .checked_add(header.payload_size as usize)
            .ok_or_else(|| Error::CorruptIndex("payload overflows".to_string()))?;
        if (header.entry_offset as usize) < HEADER_SIZE
            || entries_end > data.len()
            || (header.payload_offset as usize) < entries_end
            || payload_end > data.len()
        {
            return Err(Error::CorruptIndex(format!(
                "section bounds out of range for {} bytes",
                data.len()
            )));
        }

        if Sha256::digest(&data[HEADER_SIZE..]).as_slice() != header.body_digest {
            return Err(Error::CorruptIndex("body digest mismatch".to_string()));
        }

        Ok(Self {
            data,
            header,
            checksum,
        })
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    fn entry(&self, i: usize) -> DomainEntry {
        let start = self.header.entry_offset as usize + i * ENTRY_SIZE;
        DomainEntry::from_bytes(&self.data[start..start + ENTRY_SIZE])
    }

    fn entry_domain(&self, entry: &DomainEntry) -> Option<&str> {
        let start = self.header.payload_offset as usize + entry.payload_offset as usize;
        let end = start + entry.domain_len as usize;
        let payload_end = self.header.payload_offset as usize + self.header.payload_size as usize;
        if end > payload_end {
            return None;
        }
        std::str::from_utf8(&self.data[start..end]).ok()
    }

    /// Flags of every entry for exactly `domain`.
    fn lookup(&self, domain: &str) -> impl Iterator<Item = EntryFlags> + '_ {
        let hash = fnv1a_hash(domain.as_bytes());
        let count = self.header.entry_count as usize;

        // Binary search for the first entry with this hash
        let (mut lo, mut hi) = (0, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry(mid).hash < hash {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let domain = domain.to_string();
        (lo..count)
            .map(move |i| self.entry(i))
            .take_while(move |e| e.hash == hash)
            .filter(move |e| self.entry_domain(e) == Some(domain.as_str()))
            .map(|e| e.flags)
    }

    /// Flags of every entry for `host` and each of its parent domains.
    fn lookup_suffixes<'a>(&'a self, host: &'a str) -> impl Iterator<Item = EntryFlags> + 'a {
        domain_suffixes(host).flat_map(move |suffix| self.lookup(suffix))
    }
}

fn normalized_host(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

impl RuleIndex for CompiledIndex {
    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn rule_count(&self) -> usize {
        self.header.entry_count as usize
    }

    fn find_request_match(
        &self,
        url: &Url,
        initiator: Option<&Url>,
        kind: ResourceKind,
    ) -> RequestMatch {
        let Some(host) = normalized_host(url) else {
            return RequestMatch::NoMatch;
        };
        let initiator_host = initiator.and_then(normalized_host);

        // A page allow-listed with `@@...$document` loads everything
        if let Some(page) = &initiator_host {
            if self
                .lookup_suffixes(page)
                .any(|f| f.contains(EntryFlags::ALLOW | EntryFlags::DOCUMENT))
            {
                return RequestMatch::Allowed;
            }
        }

        let third_party = initiator_host
            .as_deref()
            .is_some_and(|page| site_of(page) != site_of(&host));
        let is_document = kind == ResourceKind::Document;

        let mut blocked = false;
        for flags in self.lookup_suffixes(&host) {
            if flags.contains(EntryFlags::THIRD_PARTY) && !third_party {
                continue;
            }
            if flags.contains(EntryFlags::ALLOW) {
                return RequestMatch::Allowed;
            }
            if !is_document || flags.contains(EntryFlags::DOCUMENT) {
                blocked = true;
            }
        }

        if blocked {
            RequestMatch::Blocked
        } else {
            RequestMatch::NoMatch
        }
    }

    fn activations(&self, url: &Url) -> ActivationFlags {
        let Some(host) = normalized_host(url) else {
            return ActivationFlags::empty();
        };
        let mut activations = ActivationFlags::empty();
        for flags in self.lookup_suffixes(&host) {
            if !flags.contains(EntryFlags::DOCUMENT) {
                continue;
            }
            if flags.contains(EntryFlags::ALLOW) {
                return ActivationFlags::ALLOW_ALL;
            }
            activations |= ActivationFlags::BLOCK_DOCUMENT;
        }
        activations
    }
}
