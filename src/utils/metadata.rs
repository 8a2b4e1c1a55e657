//! Contract code identity.
//!
//! Solidity appends a CBOR-encoded metadata blob (plus a two-byte big-endian
//! length trailer) to emitted bytecode. Coverage and distance maps are keyed by a
//! lookup hash that must be stable across re-deployments of the same source, so
//! the hash embedded in the metadata is preferred when present and the blob (and,
//! for init bytecode, the constructor arguments following it) is stripped before
//! hashing otherwise.

use alloy::primitives::{keccak256, B256};

/// A parsed metadata blob located inside a bytecode buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractMetadata {
    /// Byte offset where the CBOR map starts.
    pub start: usize,
    /// Byte offset one past the two-byte length trailer.
    pub end: usize,
    entries: Vec<(String, Vec<u8>)>,
}

impl ContractMetadata {
    /// The bytecode hash solc embedded in the metadata, if any.
    ///
    /// `ipfs` payloads are 34-byte multihashes, `bzzr0`/`bzzr1` are 32-byte
    /// digests; callers get the raw payload.
    pub fn bytecode_hash(&self) -> Option<&[u8]> {
        for key in ["ipfs", "bzzr0", "bzzr1"] {
            if let Some((_, value)) = self.entries.iter().find(|(k, _)| k == key) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        None
    }

    /// The embedded hash right-aligned into 32 bytes (long payloads keep their
    /// trailing 32 bytes, short ones are left-padded with zeroes).
    pub fn bytecode_lookup_hash(&self) -> Option<B256> {
        let hash = self.bytecode_hash()?;
        let mut out = B256::ZERO;
        if hash.len() >= 32 {
            out.copy_from_slice(&hash[hash.len() - 32..]);
        } else {
            out[32 - hash.len()..].copy_from_slice(hash);
        }
        Some(out)
    }
}

/// Locate and parse the solc metadata blob inside `bytecode`.
///
/// Runtime bytecode carries the blob at the very end, so the two-byte trailer is
/// tried first. Init bytecode may carry constructor arguments *after* the
/// trailer; for that case the buffer is scanned backwards for a self-consistent
/// CBOR map whose trailer records its own length.
pub fn extract_metadata(bytecode: &[u8]) -> Option<ContractMetadata> {
    if bytecode.len() < 2 {
        return None;
    }

    // Fast path: blob terminates the buffer.
    let trailer = u16::from_be_bytes([bytecode[bytecode.len() - 2], bytecode[bytecode.len() - 1]]) as usize;
    if trailer > 0 && trailer + 2 <= bytecode.len() {
        let start = bytecode.len() - 2 - trailer;
        if let Some(entries) = parse_cbor_map(&bytecode[start..bytecode.len() - 2]) {
            return Some(ContractMetadata {
                start,
                end: bytecode.len(),
                entries,
            });
        }
    }

    // Slow path: scan backwards for a map followed by a matching length trailer
    // (init bytecode with appended constructor arguments).
    for start in (0..bytecode.len().saturating_sub(2)).rev() {
        let header = bytecode[start];
        if !(0xa1..=0xb7).contains(&header) {
            continue;
        }
        let Some((entries, blob_len)) = parse_cbor_map_prefix(&bytecode[start..]) else {
            continue;
        };
        let trailer_at = start + blob_len;
        if trailer_at + 2 > bytecode.len() {
            continue;
        }
        let recorded = u16::from_be_bytes([bytecode[trailer_at], bytecode[trailer_at + 1]]) as usize;
        if recorded == blob_len {
            return Some(ContractMetadata {
                start,
                end: trailer_at + 2,
                entries,
            });
        }
    }
    None
}

/// Strip the metadata blob, its length trailer, and everything after it
/// (constructor arguments, for init bytecode). Returns the input unchanged when
/// no metadata is found.
pub fn strip_metadata(bytecode: &[u8]) -> &[u8] {
    match extract_metadata(bytecode) {
        Some(metadata) => &bytecode[..metadata.start],
        None => bytecode,
    }
}

/// Compute the lookup hash keying all per-code maps for `bytecode`.
///
/// Runtime bytecode prefers the hash embedded in its metadata; init bytecode (and
/// runtime bytecode without a usable embedded hash) falls back to
/// `keccak256(strip_metadata(bytecode))`. Two deployments of the same effective
/// code therefore share fitness maps.
pub fn code_lookup_hash(bytecode: &[u8], init: bool) -> B256 {
    if !init {
        if let Some(metadata) = extract_metadata(bytecode) {
            if let Some(hash) = metadata.bytecode_lookup_hash() {
                return hash;
            }
        }
    }
    keccak256(strip_metadata(bytecode))
}

/// Parse a complete CBOR map occupying the whole slice.
fn parse_cbor_map(blob: &[u8]) -> Option<Vec<(String, Vec<u8>)>> {
    let (entries, consumed) = parse_cbor_map_prefix(blob)?;
    (consumed == blob.len()).then_some(entries)
}

/// Parse a CBOR map at the start of the slice, returning the entries and the
/// number of bytes consumed. Only the tiny subset solc emits is supported: a
/// small map of text keys to definite-length text/byte strings.
fn parse_cbor_map_prefix(blob: &[u8]) -> Option<(Vec<(String, Vec<u8>)>, usize)> {
    let header = *blob.first()?;
    if !(0xa0..=0xb7).contains(&header) {
        return None;
    }
    let pairs = (header - 0xa0) as usize;
    if pairs == 0 || pairs > 8 {
        return None;
    }

    let mut cursor = 1usize;
    let mut entries = Vec::with_capacity(pairs);
    for _ in 0..pairs {
        let (key, next) = read_text(blob, cursor)?;
        let (value, next) = read_string_value(blob, next)?;
        entries.push((key, value));
        cursor = next;
    }
    Some((entries, cursor))
}

/// Definite-length CBOR text string (major type 3, short lengths only).
fn read_text(blob: &[u8], cursor: usize) -> Option<(String, usize)> {
    let header = *blob.get(cursor)?;
    if !(0x60..=0x77).contains(&header) {
        return None;
    }
    let len = (header - 0x60) as usize;
    let start = cursor + 1;
    let bytes = blob.get(start..start + len)?;
    let text = std::str::from_utf8(bytes).ok()?;
    Some((text.to_string(), start + len))
}

/// Definite-length CBOR byte or text string value.
fn read_string_value(blob: &[u8], cursor: usize) -> Option<(Vec<u8>, usize)> {
    let header = *blob.get(cursor)?;
    let (len, start) = match header {
        0x40..=0x57 => ((header - 0x40) as usize, cursor + 1),
        0x58 => (*blob.get(cursor + 1)? as usize, cursor + 2),
        0x60..=0x77 => ((header - 0x60) as usize, cursor + 1),
        0x78 => (*blob.get(cursor + 1)? as usize, cursor + 2),
        _ => return None,
    };
    let bytes = blob.get(start..start + len)?;
    Some((bytes.to_vec(), start + len))
}
