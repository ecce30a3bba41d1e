use sha2::{Digest, Sha256};

/// Stable hash of a program binary, used to derive a room name that
/// guarantees peers running mismatched binaries never share a room.
/// Hex-encoded, the same rendering convention used for info-hashes.
pub fn stable_hash_hex(binary: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(binary);
    hex::encode(hasher.finalize())
}

/// Appends the hex digest of `binary` to `room_name`, separated by `-`.
pub fn room_name_for_binary(room_name: &str, binary: &[u8]) -> String {
    format!("{room_name}-{}", stable_hash_hex(binary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let binary = b"(module)";
        assert_eq!(stable_hash_hex(binary), stable_hash_hex(binary));
    }

    #[test]
    fn mismatched_binaries_hash_differently() {
        assert_ne!(stable_hash_hex(b"a"), stable_hash_hex(b"b"));
    }

    #[test]
    fn room_name_embeds_the_hash() {
        let name = room_name_for_binary("tangle", b"(module)");
        assert!(name.starts_with("tangle-"));
        assert_eq!(name, format!("tangle-{}", stable_hash_hex(b"(module)")));
    }
}
