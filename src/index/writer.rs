//! Compiled index writer.

use ahash::{AHashMap, AHashSet};
use sha2::{Digest, Sha256};

use super::format::*;
use crate::parser::{NetworkRule, RuleOptions};
use crate::{Error, Result};

/// Collects network rules and serializes them into the compiled format.
#[derive(Debug, Default)]
pub struct IndexWriter {
    rules: AHashSet<(String, EntryFlags)>,
}

impl IndexWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule. Duplicates across sources collapse into one entry.
    pub fn add(&mut self, rule: &NetworkRule) {
        let mut flags = EntryFlags::empty();
        if rule.options.contains(RuleOptions::ALLOW) {
            flags |= EntryFlags::ALLOW;
        }
        if rule.options.contains(RuleOptions::DOCUMENT) {
            flags |= EntryFlags::DOCUMENT;
        }
        if rule.options.contains(RuleOptions::THIRD_PARTY) {
            flags |= EntryFlags::THIRD_PARTY;
        }
        self.rules.insert((rule.domain.to_lowercase(), flags));
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Serialize the collected rules, stamping `source_checksum` into the header.
    pub fn write(&self, source_checksum: &str) -> Result<Vec<u8>> {
        let mut sorted: Vec<(u64, &str, EntryFlags)> = self
            .rules
            .iter()
            .map(|(domain, flags)| (fnv1a_hash(domain.as_bytes()), domain.as_str(), *flags))
            .collect();
        sorted.sort_unstable_by(|a, b| {
            (a.0, a.2.bits(), a.1).cmp(&(b.0, b.2.bits(), b.1))
        });

        // Payload (domain strings, each stored once)
        let mut payload = Vec::new();
        let mut offsets: AHashMap<&str, u32> = AHashMap::new();
        let mut entries = Vec::with_capacity(sorted.len());
        for (hash, domain, flags) in &sorted {
            let domain_len = u16::try_from(domain.len())
                .map_err(|_| Error::CorruptIndex(format!("domain too long: {}", domain)))?;
            let payload_offset = match offsets.get(*domain) {
                Some(offset) => *offset,
                None => {
                    let offset = payload.len() as u32;
                    payload.extend_from_slice(domain.as_bytes());
                    offsets.insert(*domain, offset);
                    offset
                }
            };
            entries.push(DomainEntry {
                hash: *hash,
                flags: *flags,
                payload_offset,
                domain_len,
            });
        }

        let entry_offset = HEADER_SIZE;
        let payload_offset = entry_offset + entries.len() * ENTRY_SIZE;
        let mut buffer = Vec::with_capacity(payload_offset + payload.len());
        buffer.resize(HEADER_SIZE, 0);
        for entry in &entries {
            buffer.extend_from_slice(&entry.to_bytes());
        }
        buffer.extend_from_slice(&payload);

        let allow_count = entries
            .iter()
            .filter(|e| e.flags.contains(EntryFlags::ALLOW))
            .count();
        let mut format_flags = FormatFlags::empty();
        if allow_count > 0 {
            format_flags |= FormatFlags::HAS_ALLOW_RULES;
        }
        if entries.iter().any(|e| e.flags.contains(EntryFlags::DOCUMENT)) {
            format_flags |= FormatFlags::HAS_DOCUMENT_RULES;
        }

        let mut body_digest = [0u8; 32];
        body_digest.copy_from_slice(&Sha256::digest(&buffer[HEADER_SIZE..]));

        let header = IndexHeader {
            flags: format_flags.bits(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64,
            source_checksum: checksum_bytes(source_checksum)?,
            body_digest,
            entry_offset: entry_offset as u32,
            entry_count: entries.len() as u32,
            payload_offset: payload_offset as u32,
            payload_size: payload.len() as u32,
            block_count: (entries.len() - allow_count) as u32,
            allow_count: allow_count as u32,
            ..IndexHeader::new()
        };
        buffer[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

        Ok(buffer)
    }
}
