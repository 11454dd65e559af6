use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

// Fresh id for characters, elements, hallways, messages and songs
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// Six digit login code
pub fn generate_code() -> u32 {
    rand::thread_rng().gen_range(0..1_000_000)
}

// Backoff before the given retry attempt, doubling from 250ms up to 8s
pub fn backoff(attempt: u32) -> Duration {
    let millis = 250u64.saturating_mul(1 << attempt.min(5));
    Duration::from_millis(millis)
}
