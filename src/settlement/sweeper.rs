use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::error::AppResult;
use crate::ledger::store::LedgerStore;
use crate::settlement::engine::SettlementEngine;

/// Periodic expiry sweep. Staleness is only ever materialized through the
/// engine's explicit expiry transitions, so every reader observes the same
/// lot/bid state; this task just makes "eventually" happen.
pub struct ExpirySweeper {
    store: Arc<dyn LedgerStore>,
    engine: Arc<SettlementEngine>,
    sweep_interval: Duration,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        engine: Arc<SettlementEngine>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            sweep_interval,
        }
    }

    /// Start the sweep loop in the background
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.sweep_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    error!("Expiry sweep failed: {:?}", e);
                }
            }
        })
    }

    pub async fn sweep_once(&self) -> AppResult<(u64, u64)> {
        let now = Utc::now();

        let mut lots_expired = 0u64;
        for lot_id in self.store.list_expirable_lots(now).await? {
            if self.engine.expire_lot(lot_id).await? {
                lots_expired += 1;
            }
        }

        // pending bids on expired lots the lot pass did not reach
        let mut bids_expired = 0u64;
        for bid_id in self.store.list_expirable_bids(now).await? {
            if self.engine.expire_bid(bid_id).await? {
                bids_expired += 1;
            }
        }

        if lots_expired > 0 || bids_expired > 0 {
            info!(
                "🗑️  Expiry sweep: {} lots, {} bids",
                lots_expired, bids_expired
            );
        }
        Ok((lots_expired, bids_expired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettlementPolicy;
    use crate::ledger::models::{BidStatus, LotStatus};
    use crate::ledger::InMemoryLedger;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[tokio::test]
    async fn sweep_expires_stale_lots_and_their_bids() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let engine = Arc::new(SettlementEngine::new(
            store.clone(),
            SettlementPolicy::default(),
        ));
        let sweeper = ExpirySweeper::new(
            store.clone(),
            engine.clone(),
            Duration::from_secs(60),
        );

        let seller = Uuid::new_v4();
        let stale = engine
            .create_lot(
                seller,
                "wheat".to_string(),
                dec!(100),
                "FAQ".to_string(),
                dec!(2000),
            )
            .await
            .unwrap();
        engine
            .open_lot(
                stale.id,
                seller,
                Some(Utc::now() + ChronoDuration::milliseconds(1)),
            )
            .await
            .unwrap();
        let bid = engine
            .submit_bid(stale.id, Uuid::new_v4(), dec!(2100), dec!(100))
            .await
            .unwrap();

        let fresh = engine
            .create_lot(
                seller,
                "maize".to_string(),
                dec!(50),
                "Grade A".to_string(),
                dec!(1800),
            )
            .await
            .unwrap();
        engine.open_lot(fresh.id, seller, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let (lots, _) = sweeper.sweep_once().await.unwrap();
        assert_eq!(lots, 1);

        let stale = store.get_lot(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, LotStatus::Expired);
        let bid = store.get_bid(bid.id).await.unwrap().unwrap();
        assert_eq!(bid.status, BidStatus::Expired);

        let fresh = store.get_lot(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, LotStatus::Open);

        // nothing left to sweep
        let (lots, bids) = sweeper.sweep_once().await.unwrap();
        assert_eq!((lots, bids), (0, 0));
    }
}
