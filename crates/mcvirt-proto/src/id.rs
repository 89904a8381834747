//! Stable entity identifiers.
//!
//! Every persisted entity (VM, hard drive, storage backend) is addressed
//! by `<prefix>-<16 hex>-<24 hex>`: the first block is derived from the
//! human name, the second from the creation timestamp. IDs are what nodes
//! exchange; names are for operators.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha512};

const NAME_BLOCK_LEN: usize = 16;
const TIME_BLOCK_LEN: usize = 24;

fn checksum(data: &[u8]) -> String {
    hex::encode(Sha512::digest(data))
}

/// Generate an ID for `name` created at `timestamp_nanos`.
pub fn generate_id_at(prefix: &str, name: &str, timestamp_nanos: u128) -> String {
    let name_block = checksum(name.as_bytes());
    let time_block = checksum(timestamp_nanos.to_string().as_bytes());
    format!(
        "{}-{}-{}",
        prefix,
        &name_block[..NAME_BLOCK_LEN],
        &time_block[..TIME_BLOCK_LEN]
    )
}

/// Generate an ID for `name` created now.
pub fn generate_id(prefix: &str, name: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    generate_id_at(prefix, name, now)
}

/// Check that `id` is well-formed for the given prefix.
pub fn is_valid_id(prefix: &str, id: &str) -> bool {
    let mut parts = id.split('-');
    let (Some(p), Some(a), Some(b), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    p == prefix
        && a.len() == NAME_BLOCK_LEN
        && b.len() == TIME_BLOCK_LEN
        && a.chars().chain(b.chars()).all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{HARD_DRIVE_ID_PREFIX, VM_ID_PREFIX};

    #[test]
    fn test_id_shape() {
        let id = generate_id(VM_ID_PREFIX, "vm1");
        assert!(id.starts_with("vm-"));
        assert_eq!(id.len(), 2 + 1 + 16 + 1 + 24);
        assert!(is_valid_id(VM_ID_PREFIX, &id));
        assert!(!is_valid_id(HARD_DRIVE_ID_PREFIX, &id));
    }

    #[test]
    fn test_name_block_is_stable() {
        let a = generate_id_at(VM_ID_PREFIX, "vm1", 1);
        let b = generate_id_at(VM_ID_PREFIX, "vm1", 2);
        assert_eq!(a[..19], b[..19]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_ids() {
        assert!(!is_valid_id("vm", "vm-1234"));
        assert!(!is_valid_id("vm", "vm-zzzzzzzzzzzzzzzz-000000000000000000000000"));
        assert!(!is_valid_id("vm", "vm-0000000000000000-000000000000000000000000-x"));
    }
}
