//! Key types, the typed comparator, and the persisted key/record flag
//! bytes (spec.md #3, #4.4).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The semantic type a database's keys carry (spec.md #6
/// "Key/record parameter contract"). Numeric types compare numerically;
/// `Binary` compares lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Real32,
    Real64,
    /// `Some(k)`: fixed-length binary keys of exactly `k` bytes.
    /// `None`: unbounded binary, capped by `EnvironmentConfig::max_key_size`.
    Binary(Option<u32>),
}

impl KeyType {
    pub fn is_numeric(&self) -> bool {
        !matches!(self, KeyType::Binary(_))
    }

    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            KeyType::Uint8 => Some(1),
            KeyType::Uint16 => Some(2),
            KeyType::Uint32 => Some(4),
            KeyType::Uint64 => Some(8),
            KeyType::Real32 => Some(4),
            KeyType::Real64 => Some(8),
            KeyType::Binary(Some(k)) => Some(*k as usize),
            KeyType::Binary(None) => None,
        }
    }
}

/// Compare two encoded key byte strings under `key_type`'s semantics.
/// Numeric keys are stored little-endian on disk (spec.md #6
/// "Endian-neutral") but compared by numeric value, not byte order.
pub fn compare_keys(key_type: KeyType, a: &[u8], b: &[u8]) -> Ordering {
    match key_type {
        KeyType::Uint8 => a[0].cmp(&b[0]),
        KeyType::Uint16 => {
            u16::from_le_bytes(a[0..2].try_into().unwrap())
                .cmp(&u16::from_le_bytes(b[0..2].try_into().unwrap()))
        }
        KeyType::Uint32 => {
            u32::from_le_bytes(a[0..4].try_into().unwrap())
                .cmp(&u32::from_le_bytes(b[0..4].try_into().unwrap()))
        }
        KeyType::Uint64 => {
            u64::from_le_bytes(a[0..8].try_into().unwrap())
                .cmp(&u64::from_le_bytes(b[0..8].try_into().unwrap()))
        }
        KeyType::Real32 => {
            let fa = f32::from_le_bytes(a[0..4].try_into().unwrap());
            let fb = f32::from_le_bytes(b[0..4].try_into().unwrap());
            fa.total_cmp(&fb)
        }
        KeyType::Real64 => {
            let fa = f64::from_le_bytes(a[0..8].try_into().unwrap());
            let fb = f64::from_le_bytes(b[0..8].try_into().unwrap());
            fa.total_cmp(&fb)
        }
        KeyType::Binary(_) => a.cmp(b),
    }
}

/// Persisted per-slot key flags (spec.md #4.4, 1 byte).
pub const KEY_FLAG_EXTENDED_KEY: u8 = 0x01;
pub const KEY_FLAG_EXTENDED_DUPLICATES: u8 = 0x02;
pub const KEY_FLAG_INITIALIZED: u8 = 0x04;
pub const KEY_FLAG_HAS_NO_RECORDS: u8 = 0x08;
pub const KEY_FLAG_COMPRESSED: u8 = 0x80;

/// Record-size-class flags: a record of length 1..7 is tagged `TINY` with
/// the length folded into the low nibble of the flags byte's reserved
/// bits; length 8 is `SMALL`; length 0 is `EMPTY`. Any other length is
/// stored as a blob.
pub const RECORD_FLAG_BLOB_SIZE_TINY: u8 = 0x10;
pub const RECORD_FLAG_BLOB_SIZE_SMALL: u8 = 0x20;
pub const RECORD_FLAG_BLOB_SIZE_EMPTY: u8 = 0x40;

/// Transient (never persisted) approximate-match marker attached to a
/// lookup result (spec.md #3 "transient flags that mark approximate-match
/// results").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Lower,
    Greater,
}

/// The approximate-match mode requested by a lookup (spec.md #4.4 "find").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindMode {
    Exact,
    Lt,
    Gt,
    Le,
    Ge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_keys_compare_numerically_not_lexicographically() {
        let a = 1u32.to_le_bytes();
        let b = 256u32.to_le_bytes();
        // Lexicographic byte order would put `a` (01 00 00 00) after `b`'s
        // first byte (00 ...); numeric comparison must say Less.
        assert_eq!(compare_keys(KeyType::Uint32, &a, &b), Ordering::Less);
    }

    #[test]
    fn binary_keys_compare_lexicographically() {
        assert_eq!(
            compare_keys(KeyType::Binary(None), b"aaa", b"aab"),
            Ordering::Less
        );
    }
}
