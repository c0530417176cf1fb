//! Periodic pruning of superseded revisions.
//!
//! The compactor keeps a retention window of
//! `compaction_retention_rev_count` revisions behind the newest one and
//! proposes per-key compaction commands in groups of 50. Disabled by
//! default; repeat runs at the same revision are no-ops.

use crate::core::error::KvResult;
use crate::kv::controller::KvController;
use std::sync::Arc;

/// One compactor pass.
///
/// Returns the compacted revision, or `None` while fewer revisions exist
/// than the retention window keeps.
pub fn compact_once(controller: &KvController) -> KvResult<Option<i64>> {
    let retention = controller.config().compaction.compaction_retention_rev_count;
    let next_revision = controller.current_revision() + 1;
    let compact_revision = next_revision - retention;
    if compact_revision <= 0 {
        tracing::debug!(
            next_revision,
            retention,
            "compaction skipped, inside retention window"
        );
        return Ok(None);
    }

    controller.kv_compact(compact_revision).map(Some)
}

/// Background auto-compaction loop.
///
/// Returns immediately when `auto_compaction` is off.
pub async fn run_compaction_task(
    controller: Arc<KvController>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let config = controller.config().compaction.clone();
    if !config.auto_compaction {
        tracing::info!("auto compaction disabled");
        return;
    }

    let period = std::time::Duration::from_millis(config.interval_ms);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(period_ms = config.interval_ms, "compaction task started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match compact_once(&controller) {
                    Ok(Some(revision)) => {
                        tracing::info!(revision, "compaction pass finished");
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "compaction pass failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("compaction task stopping");
                    break;
                }
            }
        }
    }
}
