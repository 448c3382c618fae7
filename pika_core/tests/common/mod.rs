//! Shared helpers for pika_core integration tests.

/// Channel name unique to this process and instant, so parallel test
/// processes cannot collide on `/dev/shm` artifacts or registry entries.
pub fn unique_channel_name(prefix: &str) -> String {
    format!(
        "/pika_test_{}_{}_{}",
        prefix,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    )
}
