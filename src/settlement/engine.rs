use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::SettlementPolicy;
use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::{
    Bid, BidStatus, Lot, LotStatus, Payment, Transaction,
};
use crate::ledger::store::LedgerStore;
use crate::payment::calculator;

/// Everything settled by a bid acceptance: the winning bid, the transaction
/// it created, and the provisional payment on it. `already_settled` tells a
/// caller whether this call did the settling or merely replayed one, so
/// side effects like payment dispatch fire once.
#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub bid: Bid,
    pub transaction: Transaction,
    pub payment: Payment,
    pub already_settled: bool,
}

/// Sole writer of Lot and Bid state. The at-most-one-accepted-bid invariant
/// lives here: acceptance is admitted through a single compare-and-swap on
/// the lot status, and everything after the gate is an idempotent step
/// sequence keyed by lot id, safe to replay after a crash.
pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    policy: SettlementPolicy,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn LedgerStore>, policy: SettlementPolicy) -> Self {
        Self { store, policy }
    }

    // ========== LOT LIFECYCLE ==========

    pub async fn create_lot(
        &self,
        seller_id: Uuid,
        commodity: String,
        quantity: Decimal,
        quality_grade: String,
        expected_unit_price: Decimal,
    ) -> AppResult<Lot> {
        if quantity <= Decimal::ZERO {
            return Err(AppError::InvalidInput(
                "Listed quantity must be positive".to_string(),
            ));
        }
        if expected_unit_price <= Decimal::ZERO {
            return Err(AppError::InvalidInput(
                "Expected unit price must be positive".to_string(),
            ));
        }

        let lot = self
            .store
            .insert_lot(Lot::new(
                seller_id,
                commodity,
                quantity,
                quality_grade,
                expected_unit_price,
            ))
            .await?;
        info!("Lot {} created by seller {}", lot.id, seller_id);
        Ok(lot)
    }

    /// Listing fields are editable while the lot is still a draft
    pub async fn update_lot(
        &self,
        lot_id: Uuid,
        acting_seller_id: Uuid,
        commodity: String,
        quantity: Decimal,
        quality_grade: String,
        expected_unit_price: Decimal,
    ) -> AppResult<Lot> {
        if quantity <= Decimal::ZERO || expected_unit_price <= Decimal::ZERO {
            return Err(AppError::InvalidInput(
                "Quantity and price must be positive".to_string(),
            ));
        }

        let mut lot = self.load_lot(lot_id).await?;
        if lot.seller_id != acting_seller_id {
            return Err(SettlementError::NotLotSeller.into());
        }
        if lot.status != LotStatus::Draft {
            return Err(SettlementError::LotNotEditable { current: lot.status }.into());
        }

        lot.commodity = commodity;
        lot.quantity = quantity;
        lot.quality_grade = quality_grade;
        lot.expected_unit_price = expected_unit_price;

        match self.store.update_draft_lot(lot).await? {
            Some(updated) => Ok(updated),
            // left draft between the read and the write
            None => {
                let current = self.load_lot(lot_id).await?;
                Err(SettlementError::LotNotEditable {
                    current: current.status,
                }
                .into())
            }
        }
    }

    /// Publish a draft lot for bidding, stamping its expiry instant
    pub async fn open_lot(
        &self,
        lot_id: Uuid,
        acting_seller_id: Uuid,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> AppResult<Lot> {
        let lot = self.load_lot(lot_id).await?;
        if lot.seller_id != acting_seller_id {
            return Err(SettlementError::NotLotSeller.into());
        }

        let expiry = expires_at
            .unwrap_or_else(|| Utc::now() + Duration::hours(self.policy.lot_listing_hours));

        // one conditional write: a lot that left draft keeps its expiry
        match self.store.open_draft_lot(lot_id, expiry).await? {
            Some(opened) => {
                info!("Lot {} open for bidding until {}", opened.id, expiry);
                Ok(opened)
            }
            None => {
                let current = self.load_lot(lot_id).await?;
                if current.status == LotStatus::Open {
                    return Ok(current);
                }
                Err(SettlementError::LotNotOpen {
                    current: current.status,
                }
                .into())
            }
        }
    }

    /// Cancellation is itself a compare-and-swap: a lot settled by a
    /// concurrent acceptance is rejected, never silently ignored.
    pub async fn cancel_lot(&self, lot_id: Uuid, acting_seller_id: Uuid) -> AppResult<Lot> {
        let lot = self.load_lot(lot_id).await?;
        if lot.seller_id != acting_seller_id {
            return Err(SettlementError::NotLotSeller.into());
        }

        match self
            .store
            .cas_lot_status(
                lot_id,
                &[LotStatus::Draft, LotStatus::Open],
                LotStatus::Cancelled,
            )
            .await?
        {
            Some(cancelled) => {
                // no bid may be left pending against a dead lot
                self.store
                    .decide_pending_bids(lot_id, None, BidStatus::Rejected, Utc::now())
                    .await?;
                info!("Lot {} cancelled", lot_id);
                Ok(cancelled)
            }
            None => {
                let current = self.load_lot(lot_id).await?;
                match current.status {
                    LotStatus::Cancelled => Ok(current),
                    LotStatus::PendingSettlement | LotStatus::Settled => {
                        Err(SettlementError::LotAlreadySettled.into())
                    }
                    status => Err(SettlementError::LotNotCancellable { current: status }.into()),
                }
            }
        }
    }

    // ========== BID LIFECYCLE ==========

    pub async fn submit_bid(
        &self,
        lot_id: Uuid,
        bidder_id: Uuid,
        unit_price: Decimal,
        quantity: Decimal,
    ) -> AppResult<Bid> {
        if unit_price <= Decimal::ZERO || quantity <= Decimal::ZERO {
            return Err(AppError::InvalidInput(
                "Bid price and quantity must be positive".to_string(),
            ));
        }

        let lot = self.load_lot(lot_id).await?;

        if lot.is_expired(Utc::now()) {
            // lazy expiry: flip the lot before reporting, so readers agree
            self.store
                .cas_lot_status(lot_id, &[LotStatus::Open], LotStatus::Expired)
                .await?;
            return Err(SettlementError::LotExpired.into());
        }
        if !lot.can_receive_bids() {
            return Err(SettlementError::LotNotOpen { current: lot.status }.into());
        }
        if quantity > lot.quantity {
            return Err(SettlementError::QuantityExceedsLot {
                offered: quantity.to_string(),
                listed: lot.quantity.to_string(),
            }
            .into());
        }

        let bid = match self
            .store
            .insert_bid(Bid::new(lot_id, bidder_id, unit_price, quantity))
            .await?
        {
            Some(bid) => bid,
            // the lot left open between our read and the insert
            None => {
                let current = self.load_lot(lot_id).await?;
                return Err(SettlementError::LotNotOpen {
                    current: current.status,
                }
                .into());
            }
        };
        info!(
            "Bid {} submitted on lot {}: {} x {}",
            bid.id, lot_id, bid.quantity, bid.unit_price
        );
        Ok(bid)
    }

    /// Accept one bid and settle the lot. The CAS from `open` to
    /// `pending_settlement` is the only admission into the cascade; exactly
    /// one of any number of concurrent acceptances passes it, and the losers
    /// see `LotAlreadySettled` with no partial writes. Replaying the call for
    /// the pair that won returns the settled result instead of an error.
    pub async fn accept_bid(
        &self,
        lot_id: Uuid,
        bid_id: Uuid,
        acting_seller_id: Uuid,
    ) -> AppResult<SettlementOutcome> {
        let lot = self.load_lot(lot_id).await?;
        if lot.seller_id != acting_seller_id {
            return Err(SettlementError::NotLotSeller.into());
        }

        let bid = self.load_bid(bid_id).await?;
        if bid.lot_id != lot_id {
            return Err(AppError::InvalidInput(format!(
                "Bid {} does not belong to lot {}",
                bid_id, lot_id
            )));
        }

        match bid.status {
            BidStatus::Pending => {}
            BidStatus::Accepted => return self.replay_or_conflict(lot_id, bid_id).await,
            status => {
                // a concurrent acceptance may have cascade-rejected this bid
                // between our two reads; that is a settlement conflict, not a
                // decided-bid error
                let lot_now = self.load_lot(lot_id).await?;
                if matches!(
                    lot_now.status,
                    LotStatus::PendingSettlement | LotStatus::Settled
                ) {
                    return self.replay_or_conflict(lot_id, bid_id).await;
                }
                return Err(SettlementError::BidNotPending { current: status }.into());
            }
        }

        match lot.status {
            LotStatus::Open => {}
            LotStatus::PendingSettlement | LotStatus::Settled => {
                return self.replay_or_conflict(lot_id, bid_id).await;
            }
            status => return Err(SettlementError::LotNotOpen { current: status }.into()),
        }

        // the admission gate
        let lot = match self
            .store
            .cas_lot_status(lot_id, &[LotStatus::Open], LotStatus::PendingSettlement)
            .await?
        {
            Some(lot) => lot,
            None => return self.replay_or_conflict(lot_id, bid_id).await,
        };

        self.run_settlement_cascade(lot, bid).await
    }

    /// Idempotent step sequence behind the gate. Every step tolerates having
    /// already run, so a crash mid-cascade resumes here without double
    /// effects.
    async fn run_settlement_cascade(&self, lot: Lot, bid: Bid) -> AppResult<SettlementOutcome> {
        let decided_at = Utc::now();

        let accepted = match self
            .store
            .cas_bid_status(bid.id, BidStatus::Pending, BidStatus::Accepted, decided_at)
            .await?
        {
            Some(accepted) => accepted,
            None => {
                let current = self.load_bid(bid.id).await?;
                // resumed cascade: the bid was accepted on the first pass
                if current.status == BidStatus::Accepted {
                    current
                } else {
                    // withdrawn or expired between the gate and this swap;
                    // give the lot back before reporting
                    self.store
                        .cas_lot_status(
                            lot.id,
                            &[LotStatus::PendingSettlement],
                            LotStatus::Open,
                        )
                        .await?;
                    return Err(SettlementError::BidNotPending {
                        current: current.status,
                    }
                    .into());
                }
            }
        };

        let rejected = self
            .store
            .decide_pending_bids(lot.id, Some(bid.id), BidStatus::Rejected, decided_at)
            .await?;

        let transaction = self
            .store
            .insert_transaction_for_lot(Transaction::from_accepted_bid(&lot, &accepted))
            .await?;

        let payment = match self
            .store
            .live_payment_for_transaction(transaction.id)
            .await?
        {
            Some(existing) => existing,
            None => {
                let gross = transaction.provisional_quantity * transaction.agreed_unit_price;
                let breakdown = calculator::compute(
                    gross,
                    self.policy.commission_rate_pct,
                    self.policy.tax_rate_pct,
                );
                self.store
                    .insert_payment(Payment::initiated(
                        transaction.id,
                        breakdown,
                        self.policy.commission_rate_pct,
                        self.policy.tax_rate_pct,
                        None,
                    ))
                    .await?
            }
        };

        self.store
            .cas_lot_status(lot.id, &[LotStatus::PendingSettlement], LotStatus::Settled)
            .await?;

        info!(
            "Lot {} settled: bid {} accepted at {} x {}, {} competing bids rejected, transaction {}",
            lot.id, accepted.id, accepted.quantity, accepted.unit_price, rejected, transaction.id
        );

        Ok(SettlementOutcome {
            bid: accepted,
            transaction,
            payment,
            already_settled: false,
        })
    }

    /// A lot already past `open` either settled for this very bid (replay:
    /// return the settled result) or for a competitor (conflict).
    async fn replay_or_conflict(&self, lot_id: Uuid, bid_id: Uuid) -> AppResult<SettlementOutcome> {
        match self.store.get_transaction_by_lot(lot_id).await? {
            Some(transaction) if transaction.bid_id == bid_id => {
                let bid = self.load_bid(bid_id).await?;
                let payment = self
                    .store
                    .live_payment_for_transaction(transaction.id)
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal(format!(
                            "Settled transaction {} has no live payment",
                            transaction.id
                        ))
                    })?;
                Ok(SettlementOutcome {
                    bid,
                    transaction,
                    payment,
                    already_settled: true,
                })
            }
            _ => Err(SettlementError::LotAlreadySettled.into()),
        }
    }

    /// Explicit seller rejection. Idempotent against the acceptance cascade:
    /// a bid the cascade already rejected comes back as-is.
    pub async fn reject_bid(
        &self,
        lot_id: Uuid,
        bid_id: Uuid,
        acting_seller_id: Uuid,
    ) -> AppResult<Bid> {
        let lot = self.load_lot(lot_id).await?;
        if lot.seller_id != acting_seller_id {
            return Err(SettlementError::NotLotSeller.into());
        }

        let bid = self.load_bid(bid_id).await?;
        if bid.lot_id != lot_id {
            return Err(AppError::InvalidInput(format!(
                "Bid {} does not belong to lot {}",
                bid_id, lot_id
            )));
        }

        match self
            .store
            .cas_bid_status(bid_id, BidStatus::Pending, BidStatus::Rejected, Utc::now())
            .await?
        {
            Some(rejected) => {
                info!("Bid {} rejected on lot {}", bid_id, lot_id);
                Ok(rejected)
            }
            None => {
                let current = self.load_bid(bid_id).await?;
                match current.status {
                    BidStatus::Rejected => Ok(current),
                    status => Err(SettlementError::BidNotPending { current: status }.into()),
                }
            }
        }
    }

    /// Bidder-driven withdrawal of a still-pending bid
    pub async fn withdraw_bid(&self, bid_id: Uuid, acting_bidder_id: Uuid) -> AppResult<Bid> {
        let bid = self.load_bid(bid_id).await?;
        if bid.bidder_id != acting_bidder_id {
            return Err(SettlementError::NotBidOwner.into());
        }

        match self
            .store
            .cas_bid_status(bid_id, BidStatus::Pending, BidStatus::Withdrawn, Utc::now())
            .await?
        {
            Some(withdrawn) => Ok(withdrawn),
            None => {
                let current = self.load_bid(bid_id).await?;
                match current.status {
                    BidStatus::Withdrawn => Ok(current),
                    status => Err(SettlementError::BidNotPending { current: status }.into()),
                }
            }
        }
    }

    // ========== TIME-TRIGGERED EXPIRY ==========

    /// Scheduler-invoked. Flips a non-terminal lot to expired; a no-op on
    /// anything already decided.
    pub async fn expire_lot(&self, lot_id: Uuid) -> AppResult<bool> {
        let expired = self
            .store
            .cas_lot_status(
                lot_id,
                &[LotStatus::Draft, LotStatus::Open],
                LotStatus::Expired,
            )
            .await?;
        if expired.is_some() {
            self.store
                .decide_pending_bids(lot_id, None, BidStatus::Expired, Utc::now())
                .await?;
            info!("Lot {} expired", lot_id);
        }
        Ok(expired.is_some())
    }

    pub async fn expire_bid(&self, bid_id: Uuid) -> AppResult<bool> {
        let expired = self
            .store
            .cas_bid_status(bid_id, BidStatus::Pending, BidStatus::Expired, Utc::now())
            .await?;
        Ok(expired.is_some())
    }

    // ========== HELPERS ==========

    async fn load_lot(&self, lot_id: Uuid) -> AppResult<Lot> {
        self.store
            .get_lot(lot_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Lot {} not found", lot_id)))
    }

    async fn load_bid(&self, bid_id: Uuid) -> AppResult<Bid> {
        self.store
            .get_bid(bid_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Bid {} not found", bid_id)))
    }
}
