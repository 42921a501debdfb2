use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::{now_ms, Ms};
use crate::observability::ACTIVITIES_EXPIRED_TOTAL;

const REAP_INTERVAL: Duration = Duration::from_secs(60);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// One retention pass: soft-delete activities older than `retention_ms`.
pub async fn reap_once(engine: &Engine, retention_ms: Ms) -> usize {
    let cutoff = now_ms().saturating_sub(retention_ms);
    match engine.expire_activities(cutoff).await {
        Ok(0) => {
            debug!(cutoff, "reaper: nothing to expire");
            0
        }
        Ok(n) => {
            metrics::counter!(ACTIVITIES_EXPIRED_TOTAL).increment(n as u64);
            info!(expired = n, cutoff, "reaped old activities");
            n
        }
        Err(e) => {
            warn!("activity reaper failed: {e}");
            0
        }
    }
}

/// Background task enforcing the activity retention window.
pub async fn run_reaper(engine: Arc<Engine>, retention_ms: Ms) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        reap_once(&engine, retention_ms).await;
    }
}

/// One compaction check. Returns true if the WAL was rewritten.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(events) => {
            info!(appends, events, "compacted WAL");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that compacts the WAL once `threshold` appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("pawbook_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reaper_expires_only_old_activities() {
        let engine = Engine::new(test_wal_path("reaper_expire.wal")).unwrap();
        let user = Ulid::new();
        engine.emit_activity(user, "old", "", "note").await.unwrap();

        // A day-long window keeps everything just written.
        assert_eq!(reap_once(&engine, 86_400_000).await, 0);
        assert_eq!(engine.list_activities(user, None).unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(reap_once(&engine, 1).await, 1);
        assert!(engine.list_activities(user, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let engine = Engine::new(test_wal_path("reaper_compact.wal")).unwrap();
        let offer = Ulid::new();
        for i in 0..4 {
            engine
                .create_slot(offer, i * 3_600_000, (i + 1) * 3_600_000)
                .await
                .unwrap();
        }

        assert!(!compact_if_needed(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 4);
        assert!(compact_if_needed(&engine, 4).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(
            engine.list_slots(offer, false, 0, 10 * 3_600_000).await.unwrap().len(),
            4
        );
    }
}
