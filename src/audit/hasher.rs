//! ST-070: BLAKE3 fingerprints for IR documents and module sources.

/// Fingerprint of raw bytes. Returns `"blake3:{hex}"`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}

/// Fingerprint of a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hex digest without the `blake3:` scheme, if the fingerprint is well formed.
pub fn digest_hex(fingerprint: &str) -> Option<&str> {
    let hex = fingerprint.strip_prefix("blake3:")?;
    (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())).then_some(hex)
}

/// Composite fingerprint over ordered parts (NUL separated).
pub fn composite_hash(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}
