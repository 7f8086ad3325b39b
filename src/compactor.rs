use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, EngineError};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` appends happened since the last
/// compaction. Returns the number of events written, if it ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<Option<usize>, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(None);
    }
    let written = engine.compact_wal().await?;
    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
    info!("compacted WAL: {appends} appends -> {written} events");
    Ok(Some(written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LeasePolicy;
    use crate::model::ApartmentInput;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("leasehold_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let engine = Engine::new(test_wal_path("threshold.wal"), LeasePolicy::default()).unwrap();
        for i in 0..3 {
            let a = engine
                .create_apartment(ApartmentInput {
                    name: format!("Unit {i}"),
                    address: format!("{i} Elm St"),
                })
                .await
                .unwrap();
            if i > 0 {
                engine.delete_apartment(a.id).await.unwrap();
            }
        }

        assert_eq!(compact_if_due(&engine, 10).await.unwrap(), None);
        // Sequence floor + the one surviving apartment.
        assert_eq!(compact_if_due(&engine, 5).await.unwrap(), Some(2));
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(compact_if_due(&engine, 1).await.unwrap(), None);
    }
}
