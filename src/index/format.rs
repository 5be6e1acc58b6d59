//! Compiled index format constants and structures.
//!
//! All multi-byte integers are little-endian. Structures are encoded field by
//! field, so the on-disk layout does not depend on the in-memory layout.

use bitflags::bitflags;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Magic bytes for identifying compiled index files.
pub const MAGIC: [u8; 8] = *b"K2FLTR\x00\x01";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 128;

/// Domain entry size in bytes.
pub const ENTRY_SIZE: usize = 24;

bitflags! {
    /// Format flags for compiled index files.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FormatFlags: u32 {
        /// At least one `@@` entry is present.
        const HAS_ALLOW_RULES = 0b00000001;
        /// At least one `$document` entry is present.
        const HAS_DOCUMENT_RULES = 0b00000010;
    }
}

bitflags! {
    /// Per-entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u8 {
        const ALLOW = 0b0000_0001;
        const DOCUMENT = 0b0000_0010;
        const THIRD_PARTY = 0b0000_0100;
    }
}

/// Compiled index header (128 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    /// Magic bytes: "K2FLTR\x00\x01"
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// Format flags
    pub flags: u32,
    /// Unix timestamp when the index was built
    pub timestamp: i64,
    /// Checksum of the rule sources this index was built from
    pub source_checksum: [u8; 32],
    /// SHA-256 of everything after the header
    pub body_digest: [u8; 32],
    /// Offset to the domain entry table
    pub entry_offset: u32,
    /// Number of domain entries
    pub entry_count: u32,
    /// Offset to the domain string payload
    pub payload_offset: u32,
    /// Size of the payload
    pub payload_size: u32,
    /// Number of block entries
    pub block_count: u32,
    /// Number of allow entries
    pub allow_count: u32,
}

impl IndexHeader {
    /// Create a new header with default values.
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            flags: 0,
            timestamp: 0,
            source_checksum: [0; 32],
            body_digest: [0; 32],
            entry_offset: HEADER_SIZE as u32,
            entry_count: 0,
            payload_offset: HEADER_SIZE as u32,
            payload_size: 0,
            block_count: 0,
            allow_count: 0,
        }
    }

    /// Encode to the fixed-size on-disk form.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0x00..0x08].copy_from_slice(&self.magic);
        out[0x08..0x0C].copy_from_slice(&self.version.to_le_bytes());
        out[0x0C..0x10].copy_from_slice(&self.flags.to_le_bytes());
        out[0x10..0x18].copy_from_slice(&self.timestamp.to_le_bytes());
        out[0x18..0x38].copy_from_slice(&self.source_checksum);
        out[0x38..0x58].copy_from_slice(&self.body_digest);
        out[0x58..0x5C].copy_from_slice(&self.entry_offset.to_le_bytes());
        out[0x5C..0x60].copy_from_slice(&self.entry_count.to_le_bytes());
        out[0x60..0x64].copy_from_slice(&self.payload_offset.to_le_bytes());
        out[0x64..0x68].copy_from_slice(&self.payload_size.to_le_bytes());
        out[0x68..0x6C].copy_from_slice(&self.block_count.to_le_bytes());
        out[0x6C..0x70].copy_from_slice(&self.allow_count.to_le_bytes());
        out
    }

    /// Decode from the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidHeaderSize {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let mut header = Self::new();
        header.magic.copy_from_slice(&data[0x00..0x08]);
        header.version = read_u32(data, 0x08);
        header.flags = read_u32(data, 0x0C);
        header.timestamp = i64::from_le_bytes(array(data, 0x10));
        header.source_checksum.copy_from_slice(&data[0x18..0x38]);
        header.body_digest.copy_from_slice(&data[0x38..0x58]);
        header.entry_offset = read_u32(data, 0x58);
        header.entry_count = read_u32(data, 0x5C);
        header.payload_offset = read_u32(data, 0x60);
        header.payload_size = read_u32(data, 0x64);
        header.block_count = read_u32(data, 0x68);
        header.allow_count = read_u32(data, 0x6C);
        Ok(header)
    }

    /// Validate the header magic and version.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        if self.version > FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    /// Get format flags.
    pub fn format_flags(&self) -> FormatFlags {
        FormatFlags::from_bits_truncate(self.flags)
    }

    /// Source checksum as the hex string used everywhere else.
    pub fn source_checksum_hex(&self) -> String {
        hex::encode(self.source_checksum)
    }
}

impl Default for IndexHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Domain entry (24 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DomainEntry {
    /// FNV-1a hash of the domain
    pub hash: u64,
    /// Entry flags
    pub flags: EntryFlags,
    /// Offset to domain string in payload
    pub payload_offset: u32,
    /// Length of domain string
    pub domain_len: u16,
}

impl DomainEntry {
    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[0..8].copy_from_slice(&self.hash.to_le_bytes());
        out[8] = self.flags.bits();
        out[12..16].copy_from_slice(&self.payload_offset.to_le_bytes());
        out[16..18].copy_from_slice(&self.domain_len.to_le_bytes());
        out
    }

    /// Decode an entry. `data` must hold at least `ENTRY_SIZE` bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            hash: u64::from_le_bytes(array(data, 0)),
            flags: EntryFlags::from_bits_truncate(data[8]),
            payload_offset: read_u32(data, 12),
            domain_len: u16::from_le_bytes(array(data, 16)),
        }
    }
}

fn array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(array(data, offset))
}

/// FNV-1a 64-bit hash function.
pub fn fnv1a_hash(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 14695981039346656037;
    const FNV_PRIME: u64 = 1099511628211;

    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// SHA-256 of `data` as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Decode a 64-character hex checksum into raw bytes.
pub fn checksum_bytes(checksum: &str) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(checksum, &mut out)
        .map_err(|e| Error::Config(format!("invalid checksum {:?}: {}", checksum, e)))?;
    Ok(out)
}
