use std::time::SystemTime;

use rand::RngCore;

pub mod resettable_timer;

pub use resettable_timer::ResettableTimer;

/// Returns `len` random bytes encoded as lowercase hex.
pub fn random_hex_id(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_hex_id() {
        let id = random_hex_id(8);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_hex_id(8));
    }
}
