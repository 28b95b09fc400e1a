use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::models::{
    Bid, BidStatus, Lot, LotStatus, Payment, PaymentStatus, PickupRecord, Transaction,
    TransactionStatus,
};
use crate::ledger::store::LedgerStore;

#[derive(Default)]
struct LedgerState {
    lots: HashMap<Uuid, Lot>,
    bids: HashMap<Uuid, Bid>,
    transactions: HashMap<Uuid, Transaction>,
    /// One transaction per lot, enforced here
    transaction_by_lot: HashMap<Uuid, Uuid>,
    /// One pickup record per transaction, enforced here
    pickup_by_transaction: HashMap<Uuid, PickupRecord>,
    payments: HashMap<Uuid, Payment>,
}

/// In-memory ledger store. A single lock over the whole state makes every
/// store call atomic with respect to every other; cross-call atomicity is the
/// engine's job via CAS gates and replayable steps.
pub struct InMemoryLedger {
    state: tokio::sync::RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: tokio::sync::RwLock::new(LedgerState::default()),
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn insert_lot(&self, lot: Lot) -> AppResult<Lot> {
        let mut state = self.state.write().await;
        state.lots.insert(lot.id, lot.clone());
        Ok(lot)
    }

    async fn get_lot(&self, lot_id: Uuid) -> AppResult<Option<Lot>> {
        let state = self.state.read().await;
        Ok(state.lots.get(&lot_id).cloned())
    }

    async fn update_draft_lot(&self, lot: Lot) -> AppResult<Option<Lot>> {
        let mut state = self.state.write().await;
        match state.lots.get_mut(&lot.id) {
            Some(existing) if existing.status == LotStatus::Draft => {
                existing.commodity = lot.commodity;
                existing.quantity = lot.quantity;
                existing.quality_grade = lot.quality_grade;
                existing.expected_unit_price = lot.expected_unit_price;
                existing.updated_at = Utc::now();
                Ok(Some(existing.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cas_lot_status(
        &self,
        lot_id: Uuid,
        from: &[LotStatus],
        to: LotStatus,
    ) -> AppResult<Option<Lot>> {
        let mut state = self.state.write().await;
        match state.lots.get_mut(&lot_id) {
            Some(lot) if from.contains(&lot.status) => {
                lot.status = to;
                lot.updated_at = Utc::now();
                Ok(Some(lot.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn open_draft_lot(
        &self,
        lot_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> AppResult<Option<Lot>> {
        let mut state = self.state.write().await;
        match state.lots.get_mut(&lot_id) {
            Some(lot) if lot.status == LotStatus::Draft => {
                lot.status = LotStatus::Open;
                lot.expires_at = Some(expires_at);
                lot.updated_at = Utc::now();
                Ok(Some(lot.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_lots_by_seller(&self, seller_id: Uuid) -> AppResult<Vec<Lot>> {
        let state = self.state.read().await;
        Ok(state
            .lots
            .values()
            .filter(|l| l.seller_id == seller_id)
            .cloned()
            .collect())
    }

    async fn list_expirable_lots(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let state = self.state.read().await;
        Ok(state
            .lots
            .values()
            .filter(|l| l.status == LotStatus::Open && l.is_expired(now))
            .map(|l| l.id)
            .collect())
    }

    async fn insert_bid(&self, bid: Bid) -> AppResult<Option<Bid>> {
        let mut state = self.state.write().await;
        // re-checked under the write lock: the lot may have settled, expired
        // or been cancelled since the caller read it as open
        let lot_open = state
            .lots
            .get(&bid.lot_id)
            .map(|l| l.status == LotStatus::Open)
            .unwrap_or(false);
        if !lot_open {
            return Ok(None);
        }
        state.bids.insert(bid.id, bid.clone());
        Ok(Some(bid))
    }

    async fn get_bid(&self, bid_id: Uuid) -> AppResult<Option<Bid>> {
        let state = self.state.read().await;
        Ok(state.bids.get(&bid_id).cloned())
    }

    async fn cas_bid_status(
        &self,
        bid_id: Uuid,
        from: BidStatus,
        to: BidStatus,
        decided_at: DateTime<Utc>,
    ) -> AppResult<Option<Bid>> {
        let mut state = self.state.write().await;
        match state.bids.get_mut(&bid_id) {
            Some(bid) if bid.status == from => {
                bid.status = to;
                bid.decided_at = Some(decided_at);
                Ok(Some(bid.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn decide_pending_bids(
        &self,
        lot_id: Uuid,
        except: Option<Uuid>,
        to: BidStatus,
        decided_at: DateTime<Utc>,
    ) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let mut decided = 0u64;
        for bid in state.bids.values_mut() {
            if bid.lot_id == lot_id && bid.status == BidStatus::Pending && Some(bid.id) != except {
                bid.status = to;
                bid.decided_at = Some(decided_at);
                decided += 1;
            }
        }
        Ok(decided)
    }

    async fn list_bids_for_lot(&self, lot_id: Uuid) -> AppResult<Vec<Bid>> {
        let state = self.state.read().await;
        let mut bids: Vec<Bid> = state
            .bids
            .values()
            .filter(|b| b.lot_id == lot_id)
            .cloned()
            .collect();
        bids.sort_by_key(|b| b.submitted_at);
        Ok(bids)
    }

    async fn list_bids_by_bidder(&self, bidder_id: Uuid) -> AppResult<Vec<Bid>> {
        let state = self.state.read().await;
        let mut bids: Vec<Bid> = state
            .bids
            .values()
            .filter(|b| b.bidder_id == bidder_id)
            .cloned()
            .collect();
        bids.sort_by_key(|b| b.submitted_at);
        Ok(bids)
    }

    async fn list_expirable_bids(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let state = self.state.read().await;
        Ok(state
            .bids
            .values()
            .filter(|b| {
                b.status == BidStatus::Pending
                    && state
                        .lots
                        .get(&b.lot_id)
                        .map(|l| l.is_expired(now))
                        .unwrap_or(false)
            })
            .map(|b| b.id)
            .collect())
    }

    async fn insert_transaction_for_lot(&self, txn: Transaction) -> AppResult<Transaction> {
        let mut state = self.state.write().await;
        if let Some(existing_id) = state.transaction_by_lot.get(&txn.lot_id) {
            let existing = state.transactions.get(existing_id).cloned().ok_or_else(|| {
                AppError::Internal(format!(
                    "Transaction index for lot {} points at a missing row",
                    txn.lot_id
                ))
            })?;
            return Ok(existing);
        }
        state.transaction_by_lot.insert(txn.lot_id, txn.id);
        state.transactions.insert(txn.id, txn.clone());
        Ok(txn)
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> AppResult<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state.transactions.get(&transaction_id).cloned())
    }

    async fn get_transaction_by_lot(&self, lot_id: Uuid) -> AppResult<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .transaction_by_lot
            .get(&lot_id)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn cas_transaction_status(
        &self,
        transaction_id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Transaction>> {
        let mut state = self.state.write().await;
        match state.transactions.get_mut(&transaction_id) {
            Some(txn) if txn.status == from => {
                txn.status = to;
                match to {
                    TransactionStatus::Reconciled => txn.reconciled_at = Some(at),
                    TransactionStatus::Closed => txn.closed_at = Some(at),
                    TransactionStatus::Provisional => {}
                }
                Ok(Some(txn.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_settled_quantity(
        &self,
        transaction_id: Uuid,
        settled_quantity: Decimal,
    ) -> AppResult<Option<Transaction>> {
        let mut state = self.state.write().await;
        match state.transactions.get_mut(&transaction_id) {
            Some(txn) => {
                if txn.settled_quantity.is_none() {
                    txn.settled_quantity = Some(settled_quantity);
                }
                Ok(Some(txn.clone()))
            }
            None => Ok(None),
        }
    }

    async fn insert_pickup(&self, record: PickupRecord) -> AppResult<PickupRecord> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.pickup_by_transaction.get(&record.transaction_id) {
            return Ok(existing.clone());
        }
        state
            .pickup_by_transaction
            .insert(record.transaction_id, record.clone());
        Ok(record)
    }

    async fn get_pickup_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> AppResult<Option<PickupRecord>> {
        let state = self.state.read().await;
        Ok(state.pickup_by_transaction.get(&transaction_id).cloned())
    }

    async fn insert_payment(&self, payment: Payment) -> AppResult<Payment> {
        let mut state = self.state.write().await;
        state.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, payment_id: Uuid) -> AppResult<Option<Payment>> {
        let state = self.state.read().await;
        Ok(state.payments.get(&payment_id).cloned())
    }

    async fn list_payments_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> AppResult<Vec<Payment>> {
        let state = self.state.read().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.transaction_id == transaction_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.initiated_at);
        Ok(payments)
    }

    async fn live_payment_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> AppResult<Option<Payment>> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .filter(|p| p.transaction_id == transaction_id && p.is_live())
            .max_by_key(|p| p.initiated_at)
            .cloned())
    }

    async fn supersede_payment(
        &self,
        prior_id: Uuid,
        replacement: Payment,
    ) -> AppResult<Payment> {
        let mut state = self.state.write().await;
        let already_linked = match state.payments.get(&prior_id) {
            Some(prior) => prior.superseded_by,
            None => {
                return Err(AppError::Internal(format!(
                    "Cannot supersede missing payment {}",
                    prior_id
                )))
            }
        };
        // a concurrent reconciler won the link; hand back its replacement
        if let Some(existing_id) = already_linked {
            return state.payments.get(&existing_id).cloned().ok_or_else(|| {
                AppError::Internal(format!(
                    "Payment {} superseded by a missing payment {}",
                    prior_id, existing_id
                ))
            });
        }
        if let Some(prior) = state.payments.get_mut(&prior_id) {
            prior.superseded_by = Some(replacement.id);
        }
        state.payments.insert(replacement.id, replacement.clone());
        Ok(replacement)
    }

    async fn mark_payment_completed(
        &self,
        payment_id: Uuid,
        gateway_ref: String,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Payment>> {
        let mut state = self.state.write().await;
        match state.payments.get_mut(&payment_id) {
            Some(p) if p.status == PaymentStatus::Initiated && p.is_live() => {
                p.status = PaymentStatus::Completed;
                p.gateway_ref = Some(gateway_ref);
                p.completed_at = Some(at);
                Ok(Some(p.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_payment_verified(&self, payment_id: Uuid) -> AppResult<Option<Payment>> {
        let mut state = self.state.write().await;
        match state.payments.get_mut(&payment_id) {
            Some(p) if p.status == PaymentStatus::Completed && p.is_live() => {
                p.status = PaymentStatus::Verified;
                Ok(Some(p.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_payment_failed(
        &self,
        payment_id: Uuid,
        from: PaymentStatus,
        reason: String,
    ) -> AppResult<Option<Payment>> {
        let mut state = self.state.write().await;
        match state.payments.get_mut(&payment_id) {
            Some(p) if p.status == from && p.is_live() => {
                p.status = PaymentStatus::Failed;
                p.failure_reason = Some(reason);
                Ok(Some(p.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_lot() -> Lot {
        Lot::new(
            Uuid::new_v4(),
            "wheat".to_string(),
            dec!(100),
            "FAQ".to_string(),
            dec!(2000),
        )
    }

    #[tokio::test]
    async fn cas_lot_status_only_swaps_from_expected_state() {
        let store = InMemoryLedger::new();
        let lot = store.insert_lot(sample_lot()).await.unwrap();

        let opened = store
            .cas_lot_status(lot.id, &[LotStatus::Draft], LotStatus::Open)
            .await
            .unwrap();
        assert_eq!(opened.unwrap().status, LotStatus::Open);

        // second swap from draft must miss
        let missed = store
            .cas_lot_status(lot.id, &[LotStatus::Draft], LotStatus::Open)
            .await
            .unwrap();
        assert!(missed.is_none());
    }

    #[tokio::test]
    async fn one_transaction_per_lot() {
        let store = InMemoryLedger::new();
        let mut lot = sample_lot();
        lot.status = LotStatus::Open;
        let lot = store.insert_lot(lot).await.unwrap();
        let bid_a = store
            .insert_bid(Bid::new(lot.id, Uuid::new_v4(), dec!(2100), dec!(100)))
            .await
            .unwrap()
            .unwrap();
        let bid_b = store
            .insert_bid(Bid::new(lot.id, Uuid::new_v4(), dec!(2050), dec!(100)))
            .await
            .unwrap()
            .unwrap();

        let first = store
            .insert_transaction_for_lot(Transaction::from_accepted_bid(&lot, &bid_a))
            .await
            .unwrap();
        let second = store
            .insert_transaction_for_lot(Transaction::from_accepted_bid(&lot, &bid_b))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.bid_id, bid_a.id);
    }

    #[tokio::test]
    async fn bid_insert_refused_once_lot_leaves_open() {
        let store = InMemoryLedger::new();
        let mut lot = sample_lot();
        lot.status = LotStatus::Open;
        let lot = store.insert_lot(lot).await.unwrap();

        let accepted = store
            .insert_bid(Bid::new(lot.id, Uuid::new_v4(), dec!(2100), dec!(100)))
            .await
            .unwrap();
        assert!(accepted.is_some());

        store
            .cas_lot_status(lot.id, &[LotStatus::Open], LotStatus::Settled)
            .await
            .unwrap();

        // a write that raced past a stale status read is refused here
        let refused = store
            .insert_bid(Bid::new(lot.id, Uuid::new_v4(), dec!(2200), dec!(100)))
            .await
            .unwrap();
        assert!(refused.is_none());
        assert_eq!(store.list_bids_for_lot(lot.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn open_draft_lot_stamps_expiry_only_on_the_swap() {
        let store = InMemoryLedger::new();
        let lot = store.insert_lot(sample_lot()).await.unwrap();
        let expiry = Utc::now() + chrono::Duration::hours(72);

        let opened = store.open_draft_lot(lot.id, expiry).await.unwrap().unwrap();
        assert_eq!(opened.status, LotStatus::Open);
        assert_eq!(opened.expires_at, Some(expiry));

        // a lot past draft keeps its stamped expiry untouched
        let missed = store
            .open_draft_lot(lot.id, expiry + chrono::Duration::hours(24))
            .await
            .unwrap();
        assert!(missed.is_none());
        let lot = store.get_lot(lot.id).await.unwrap().unwrap();
        assert_eq!(lot.expires_at, Some(expiry));
    }

    #[tokio::test]
    async fn supersede_payment_links_at_most_once() {
        let store = InMemoryLedger::new();
        let txn_id = Uuid::new_v4();
        let breakdown = crate::payment::calculator::compute(dec!(210000), dec!(2), dec!(5));
        let prior = store
            .insert_payment(crate::ledger::models::Payment::initiated(
                txn_id,
                breakdown,
                dec!(2),
                dec!(5),
                None,
            ))
            .await
            .unwrap();

        let shortfall = crate::payment::calculator::compute(dec!(193200), dec!(2), dec!(5));
        let first = store
            .supersede_payment(
                prior.id,
                crate::ledger::models::Payment::initiated(
                    txn_id,
                    shortfall,
                    dec!(2),
                    dec!(5),
                    Some(prior.id),
                ),
            )
            .await
            .unwrap();

        // a second replacement for the same prior collapses onto the first
        let second = store
            .supersede_payment(
                prior.id,
                crate::ledger::models::Payment::initiated(
                    txn_id,
                    shortfall,
                    dec!(2),
                    dec!(5),
                    Some(prior.id),
                ),
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        let prior = store.get_payment(prior.id).await.unwrap().unwrap();
        assert_eq!(prior.superseded_by, Some(first.id));
        assert_eq!(
            store.list_payments_for_transaction(txn_id).await.unwrap().len(),
            2
        );
        let live = store
            .live_payment_for_transaction(txn_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.id, first.id);
    }

    #[tokio::test]
    async fn one_pickup_per_transaction() {
        let store = InMemoryLedger::new();
        let txn_id = Uuid::new_v4();
        let first = store
            .insert_pickup(PickupRecord::new(
                txn_id,
                dec!(92),
                None,
                vec!["photo-1".to_string()],
                "sig-1".to_string(),
            ))
            .await
            .unwrap();
        let second = store
            .insert_pickup(PickupRecord::new(
                txn_id,
                dec!(90),
                None,
                vec!["photo-2".to_string()],
                "sig-2".to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.actual_quantity, dec!(92));
    }

    #[tokio::test]
    async fn settled_quantity_is_set_once() {
        let store = InMemoryLedger::new();
        let mut lot = sample_lot();
        lot.status = LotStatus::Open;
        let lot = store.insert_lot(lot).await.unwrap();
        let bid = store
            .insert_bid(Bid::new(lot.id, Uuid::new_v4(), dec!(2100), dec!(100)))
            .await
            .unwrap()
            .unwrap();
        let txn = store
            .insert_transaction_for_lot(Transaction::from_accepted_bid(&lot, &bid))
            .await
            .unwrap();

        let updated = store
            .set_settled_quantity(txn.id, dec!(92))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.settled_quantity, Some(dec!(92)));

        let again = store
            .set_settled_quantity(txn.id, dec!(40))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.settled_quantity, Some(dec!(92)));
    }
}
