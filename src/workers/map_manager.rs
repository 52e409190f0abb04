use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::{config::MapManagerConfig, map::FeaturesMap};

use super::Worker;

/// Background map hygiene: prunes landmarks that never accumulated views
/// and went stale, and merges near-duplicates. The covisibility index is
/// maintained by the map itself on every structural change.
pub fn spawn_map_manager(map: Arc<FeaturesMap>, config: MapManagerConfig) -> Worker {
    Worker::spawn("map-manager", move |stop| {
        let mut seen_epoch = 0;
        while !stop.load(Ordering::Acquire) {
            let epoch = map.wait_structural_change(seen_epoch, Duration::from_millis(50));
            if epoch <= seen_epoch {
                continue;
            }
            seen_epoch = epoch;

            let pruned = map.prune_stale(config.min_views, config.stale_age);
            let merged = map.merge_close(config.merge_distance);
            if !pruned.is_empty() || merged > 0 {
                log::debug!(
                    "map manager: pruned {} stale landmarks, merged {merged}",
                    pruned.len()
                );
                // Our own edits bumped the epoch; skip the wake-up they
                // would cause.
                seen_epoch = map.structural_epoch();
            }
        }
    })
}
