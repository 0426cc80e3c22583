use sha2::{Digest, Sha256};

/// SHA-256 (hex) of the directory. Pairs are sorted by name first, so the
/// hash only changes when a name appears, disappears or moves address.
pub fn compute_hash(services: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = services.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for (name, address) in sorted {
        // Length prefixes keep ("ab", "c") distinct from ("a", "bc").
        hasher.update((name.len() as u64).to_be_bytes());
        hasher.update(name.as_bytes());
        hasher.update((address.len() as u64).to_be_bytes());
        hasher.update(address.as_bytes());
    }
    hex::encode(hasher.finalize())
}
