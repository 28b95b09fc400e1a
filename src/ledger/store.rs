use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger::models::{
    Bid, BidStatus, Lot, LotStatus, Payment, PaymentStatus, PickupRecord, Transaction,
    TransactionStatus,
};

/// Durable storage seam for the settlement core - THE source of truth for all
/// state. Every status transition goes through a compare-and-swap so that the
/// engine's cascades stay replayable: a step that already happened reports a
/// missed swap instead of clobbering newer state.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ========== LOT OPERATIONS ==========

    async fn insert_lot(&self, lot: Lot) -> AppResult<Lot>;

    async fn get_lot(&self, lot_id: Uuid) -> AppResult<Option<Lot>>;

    /// Replace the listing fields of a draft lot. The engine enforces the
    /// draft-only rule; the store refuses the write if the lot left draft.
    async fn update_draft_lot(&self, lot: Lot) -> AppResult<Option<Lot>>;

    /// Swap lot status from any of `from` to `to`. Returns the updated lot,
    /// or None if the current status did not match.
    async fn cas_lot_status(
        &self,
        lot_id: Uuid,
        from: &[LotStatus],
        to: LotStatus,
    ) -> AppResult<Option<Lot>>;

    /// Publish a draft lot: swap `draft -> open` and stamp the expiry instant
    /// in the same write. A lot past draft is left untouched, expiry included.
    async fn open_draft_lot(
        &self,
        lot_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> AppResult<Option<Lot>>;

    async fn list_lots_by_seller(&self, seller_id: Uuid) -> AppResult<Vec<Lot>>;

    /// Open lots whose expiry instant has passed, for the sweep
    async fn list_expirable_lots(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>>;

    // ========== BID OPERATIONS ==========

    /// Insert conditional on the lot still being `open`, checked in the same
    /// write. Returns None when the lot left `open` after the caller's read,
    /// so no bid can land on a settled or otherwise dead lot.
    async fn insert_bid(&self, bid: Bid) -> AppResult<Option<Bid>>;

    async fn get_bid(&self, bid_id: Uuid) -> AppResult<Option<Bid>>;

    async fn cas_bid_status(
        &self,
        bid_id: Uuid,
        from: BidStatus,
        to: BidStatus,
        decided_at: DateTime<Utc>,
    ) -> AppResult<Option<Bid>>;

    /// Batch-decide every pending bid on a lot, optionally sparing one
    /// (the accepted bid). Idempotent; returns the number decided.
    async fn decide_pending_bids(
        &self,
        lot_id: Uuid,
        except: Option<Uuid>,
        to: BidStatus,
        decided_at: DateTime<Utc>,
    ) -> AppResult<u64>;

    async fn list_bids_for_lot(&self, lot_id: Uuid) -> AppResult<Vec<Bid>>;

    async fn list_bids_by_bidder(&self, bidder_id: Uuid) -> AppResult<Vec<Bid>>;

    /// Pending bids whose lot's expiry instant has passed, for the sweep
    async fn list_expirable_bids(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>>;

    // ========== TRANSACTION OPERATIONS ==========

    /// Insert keyed by lot id: if a transaction already exists for the lot,
    /// the existing row is returned and nothing is written.
    async fn insert_transaction_for_lot(&self, txn: Transaction) -> AppResult<Transaction>;

    async fn get_transaction(&self, transaction_id: Uuid) -> AppResult<Option<Transaction>>;

    async fn get_transaction_by_lot(&self, lot_id: Uuid) -> AppResult<Option<Transaction>>;

    async fn cas_transaction_status(
        &self,
        transaction_id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Transaction>>;

    /// The one permitted transaction mutation: set the settled quantity if it
    /// is still unset. Returns the transaction either way.
    async fn set_settled_quantity(
        &self,
        transaction_id: Uuid,
        settled_quantity: Decimal,
    ) -> AppResult<Option<Transaction>>;

    // ========== PICKUP OPERATIONS ==========

    /// Insert keyed by transaction id: an existing record for the same
    /// transaction is returned untouched.
    async fn insert_pickup(&self, record: PickupRecord) -> AppResult<PickupRecord>;

    async fn get_pickup_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> AppResult<Option<PickupRecord>>;

    // ========== PAYMENT OPERATIONS ==========

    async fn insert_payment(&self, payment: Payment) -> AppResult<Payment>;

    async fn get_payment(&self, payment_id: Uuid) -> AppResult<Option<Payment>>;

    async fn list_payments_for_transaction(&self, transaction_id: Uuid)
        -> AppResult<Vec<Payment>>;

    /// The payment that currently binds: the one not superseded
    async fn live_payment_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> AppResult<Option<Payment>>;

    /// Insert `replacement` and link `prior_id` to it as one atomic write,
    /// keyed by the prior payment: if the prior was already superseded by a
    /// concurrent caller, nothing is written and that caller's replacement is
    /// returned. At most one payment ever supersedes a given prior.
    async fn supersede_payment(&self, prior_id: Uuid, replacement: Payment)
        -> AppResult<Payment>;

    async fn mark_payment_completed(
        &self,
        payment_id: Uuid,
        gateway_ref: String,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Payment>>;

    async fn mark_payment_verified(
        &self,
        payment_id: Uuid,
    ) -> AppResult<Option<Payment>>;

    async fn mark_payment_failed(
        &self,
        payment_id: Uuid,
        from: PaymentStatus,
        reason: String,
    ) -> AppResult<Option<Payment>>;
}
