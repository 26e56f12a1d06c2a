//! Memory substrate conformance.

mod backlog;

use postbus_core::MemoryBacklog;

#[tokio::test]
async fn test_publish_assigns_sequential_ids() {
    backlog::publish_assigns_sequential_ids(&MemoryBacklog::new()).await;
}

#[tokio::test]
async fn test_backlog_is_trimmed() {
    backlog::backlog_is_trimmed(&MemoryBacklog::new()).await;
}

#[tokio::test]
async fn test_global_backlog_spans_channels() {
    backlog::global_backlog_spans_channels(&MemoryBacklog::new()).await;
}

#[tokio::test]
async fn test_targeting_survives_storage() {
    backlog::targeting_survives_storage(&MemoryBacklog::new()).await;
}

#[tokio::test]
async fn test_listen_receives_publishes() {
    backlog::listen_receives_publishes(&MemoryBacklog::new()).await;
}

#[tokio::test]
async fn test_reset_clears_state() {
    backlog::reset_clears_state(&MemoryBacklog::new()).await;
}

#[tokio::test]
async fn test_rejects_invalid_input() {
    backlog::rejects_invalid_input(&MemoryBacklog::new()).await;
}
