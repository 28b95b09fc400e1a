use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, VerificationError};
use crate::ledger::models::{Payment, PaymentStatus, TransactionStatus};
use crate::ledger::store::LedgerStore;

/// Tracks payment confirmation independently of settlement: "money moved"
/// (completed) and "recipient confirms receipt" (verified) are separate facts.
/// A dispute here never reopens the underlying commercial agreement.
pub struct PaymentVerification {
    store: Arc<dyn LedgerStore>,
}

impl PaymentVerification {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Payment-rail callback: money moved. `initiated -> completed`.
    pub async fn mark_completed(&self, payment_id: Uuid, gateway_ref: String) -> AppResult<Payment> {
        match self
            .store
            .mark_payment_completed(payment_id, gateway_ref, Utc::now())
            .await?
        {
            Some(payment) => {
                info!("Payment {} completed", payment.id);
                Ok(payment)
            }
            None => Err(self.transition_anomaly(payment_id, PaymentStatus::Completed).await?),
        }
    }

    /// Recipient confirmation: `completed -> verified`, terminal.
    pub async fn mark_verified(&self, payment_id: Uuid) -> AppResult<Payment> {
        match self.store.mark_payment_verified(payment_id).await? {
            Some(payment) => {
                info!("Payment {} verified", payment.id);
                self.close_transaction(&payment).await?;
                Ok(payment)
            }
            None => Err(self.transition_anomaly(payment_id, PaymentStatus::Verified).await?),
        }
    }

    /// Rail-reported failure, reachable from `initiated` or `completed` only.
    pub async fn mark_failed(&self, payment_id: Uuid, reason: String) -> AppResult<Payment> {
        for from in [PaymentStatus::Initiated, PaymentStatus::Completed] {
            if let Some(payment) = self
                .store
                .mark_payment_failed(payment_id, from, reason.clone())
                .await?
            {
                warn!("Payment {} failed: {}", payment.id, reason);
                self.close_transaction(&payment).await?;
                return Ok(payment);
            }
        }
        Err(self.transition_anomaly(payment_id, PaymentStatus::Failed).await?)
    }

    /// A terminal payment closes its reconciled transaction. The swap misses
    /// when the transaction is still provisional; it closes after
    /// reconciliation instead.
    async fn close_transaction(&self, payment: &Payment) -> AppResult<()> {
        if !payment.status.is_terminal() {
            return Ok(());
        }
        let closed = self
            .store
            .cas_transaction_status(
                payment.transaction_id,
                TransactionStatus::Reconciled,
                TransactionStatus::Closed,
                Utc::now(),
            )
            .await?;
        if let Some(txn) = closed {
            info!("Transaction {} closed", txn.id);
        }
        Ok(())
    }

    /// A missed swap is either a missing payment or an illegal transition on
    /// terminal data; the latter is a data-integrity anomaly, not mere
    /// contention, so it is logged before being returned.
    async fn transition_anomaly(
        &self,
        payment_id: Uuid,
        requested: PaymentStatus,
    ) -> AppResult<AppError> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Payment {} not found", payment_id)))?;

        if !payment.is_live() {
            warn!(
                "Verification anomaly: {:?} requested on superseded payment {}",
                requested, payment_id
            );
            return Ok(VerificationError::PaymentSuperseded.into());
        }

        warn!(
            "Verification anomaly: {:?} requested on payment {} in state {:?}",
            requested, payment_id, payment.status
        );
        Ok(VerificationError::InvalidVerificationState {
            current: payment.status,
            requested,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{Bid, Lot, LotStatus, Transaction};
    use crate::ledger::InMemoryLedger;
    use crate::payment::calculator;
    use rust_decimal_macros::dec;

    async fn seeded(store: &Arc<dyn LedgerStore>) -> (Transaction, Payment) {
        let mut lot = Lot::new(
            Uuid::new_v4(),
            "wheat".to_string(),
            dec!(100),
            "FAQ".to_string(),
            dec!(2000),
        );
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
        let breakdown = calculator::compute(dec!(210000), dec!(2), dec!(5));
        let payment = store
            .insert_payment(Payment::initiated(txn.id, breakdown, dec!(2), dec!(5), None))
            .await
            .unwrap();
        (txn, payment)
    }

    #[tokio::test]
    async fn verify_requires_completed_first() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let verification = PaymentVerification::new(store.clone());
        let (_, payment) = seeded(&store).await;

        let err = verification.mark_verified(payment.id).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Verification(VerificationError::InvalidVerificationState {
                current: PaymentStatus::Initiated,
                requested: PaymentStatus::Verified,
            })
        ));
    }

    #[tokio::test]
    async fn completed_then_verified_is_terminal() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let verification = PaymentVerification::new(store.clone());
        let (_, payment) = seeded(&store).await;

        let completed = verification
            .mark_completed(payment.id, "utr-123".to_string())
            .await
            .unwrap();
        assert_eq!(completed.status, PaymentStatus::Completed);
        assert_eq!(completed.gateway_ref.as_deref(), Some("utr-123"));

        let verified = verification.mark_verified(payment.id).await.unwrap();
        assert_eq!(verified.status, PaymentStatus::Verified);

        // a verified payment can never be marked failed
        let err = verification
            .mark_failed(payment.id, "chargeback".to_string())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Verification(VerificationError::InvalidVerificationState { .. })
        ));
    }

    #[tokio::test]
    async fn failed_reachable_from_initiated_and_completed() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let verification = PaymentVerification::new(store.clone());

        let (_, from_initiated) = seeded(&store).await;
        let failed = verification
            .mark_failed(from_initiated.id, "rail timeout".to_string())
            .await
            .unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("rail timeout"));

        let (_, from_completed) = seeded(&store).await;
        verification
            .mark_completed(from_completed.id, "utr-9".to_string())
            .await
            .unwrap();
        let failed = verification
            .mark_failed(from_completed.id, "reversed".to_string())
            .await
            .unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn terminal_payment_closes_reconciled_transaction() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let verification = PaymentVerification::new(store.clone());
        let (txn, payment) = seeded(&store).await;

        store
            .cas_transaction_status(
                txn.id,
                TransactionStatus::Provisional,
                TransactionStatus::Reconciled,
                Utc::now(),
            )
            .await
            .unwrap();

        verification
            .mark_completed(payment.id, "utr-1".to_string())
            .await
            .unwrap();
        verification.mark_verified(payment.id).await.unwrap();

        let txn = store.get_transaction(txn.id).await.unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Closed);
        assert!(txn.closed_at.is_some());
    }

    #[tokio::test]
    async fn provisional_transaction_stays_open_on_terminal_payment() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let verification = PaymentVerification::new(store.clone());
        let (txn, payment) = seeded(&store).await;

        verification
            .mark_failed(payment.id, "rail down".to_string())
            .await
            .unwrap();

        let txn = store.get_transaction(txn.id).await.unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Provisional);
    }
}
