//! Masterchain tip tracking.
//!
//! A background task polls the backend for the current tip, resolves the
//! full master block for every advancement and publishes it, waking
//! `wait_master_block` suspensions through the cache's watch channel.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::backend;
use crate::cache::{BlockCache, CacheError};
use crate::metrics;
use crate::proto;

impl BlockCache {
    /// Spawns the tip poller. It stops when `shutdown` fires.
    pub fn start_background_tasks(&self, shutdown: &broadcast::Sender<()>) {
        let cache = self.clone();
        let mut shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.inner.config.tip_poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => cache.poll_tip().await,
                    _ = shutdown.recv() => break,
                }
            }
            debug!("tip tracker stopped");
        });
    }

    async fn poll_tip(&self) {
        match self.refresh_tip().await {
            Ok(Some(seqno)) => debug!(seqno, "published new masterchain tip"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to refresh masterchain tip"),
        }
        metrics::set_tip_seqno(self.tip_seqno());
        for (table, len) in self.table_sizes() {
            metrics::set_cache_entries(table, len);
        }
    }

    /// Fetches the current tip and publishes it when it advanced. Returns
    /// the new seqno on advancement.
    async fn refresh_tip(&self) -> Result<Option<u32>, CacheError> {
        let req = proto::GetMasterchainInfoExt { mode: 0 };
        let info: proto::MasterchainInfoExt =
            backend::query(&*self.inner.backend, &req).await?;
        self.inner.store_zero_state(info.init);

        let id = info.last.as_block_id()?;
        if id.seqno <= self.tip_seqno() && self.inner.last.load().is_some() {
            return Ok(None);
        }

        let (block, _) = self.master_block(&id).await?;
        Ok(self.publish_last(block).then_some(id.seqno))
    }
}
