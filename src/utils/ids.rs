use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static ID_SEQ: AtomicU64 = AtomicU64::new(0);

const ALPHANUMERIC: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub fn request_id() -> String {
    let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req_{}_{seq}", now_millis())
}

pub fn task_id() -> String {
    format!("task_{}", random_string(20))
}

/// `USR{user}NO{6 random chars}{unix seconds}`
pub fn trade_no(user_id: i64, unix_seconds: i64) -> String {
    format!("USR{user_id}NO{}{unix_seconds}", random_string(6))
}

pub fn random_string(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    if getrandom::fill(&mut bytes).is_err() {
        let mut seed = now_millis() ^ ID_SEQ.fetch_add(1, Ordering::Relaxed).rotate_left(17);
        for byte in &mut bytes {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            *byte = seed as u8;
        }
    }
    bytes
        .into_iter()
        .map(|b| ALPHANUMERIC[usize::from(b) % ALPHANUMERIC.len()] as char)
        .collect()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_numbers_follow_the_user_prefix_layout() {
        let trade_no = trade_no(42, 1_700_000_000);
        assert!(trade_no.starts_with("USR42NO"));
        assert!(trade_no.ends_with("1700000000"));
        assert_eq!(trade_no.len(), "USR42NO".len() + 6 + 10);
    }

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(task_id(), task_id());
        assert!(request_id().starts_with("req_"));
    }
}
