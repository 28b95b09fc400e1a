use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SettlementPolicy;
use crate::error::{AppError, AppResult, ReconciliationError};
use crate::ledger::models::{Payment, PickupRecord, Transaction, TransactionStatus};
use crate::ledger::store::LedgerStore;
use crate::payment::calculator;

/// Result of a pickup reconciliation. `already_reconciled` marks a replayed
/// call that returned the first run's outcome.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub transaction: Transaction,
    pub pickup: PickupRecord,
    pub payment: Payment,
    pub already_reconciled: bool,
}

/// Consumes pickup-time evidence and revises the settled quantity without
/// reopening bidding. Owns PickupRecord creation and the single permitted
/// Transaction mutation.
pub struct ReconciliationService {
    store: Arc<dyn LedgerStore>,
    policy: SettlementPolicy,
}

impl ReconciliationService {
    pub fn new(store: Arc<dyn LedgerStore>, policy: SettlementPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn reconcile_pickup(
        &self,
        transaction_id: Uuid,
        actual_quantity: Decimal,
        quality_notes: Option<String>,
        photo_refs: Vec<String>,
        signature_ref: String,
    ) -> AppResult<ReconcileOutcome> {
        if photo_refs.is_empty() {
            return Err(
                ReconciliationError::MissingEvidence("no photo references".to_string()).into(),
            );
        }
        if signature_ref.trim().is_empty() {
            return Err(
                ReconciliationError::MissingEvidence("no signature reference".to_string()).into(),
            );
        }
        if actual_quantity < Decimal::ZERO {
            return Err(AppError::InvalidInput(
                "Actual quantity cannot be negative".to_string(),
            ));
        }

        let transaction = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Transaction {} not found", transaction_id))
            })?;

        match transaction.status {
            TransactionStatus::Provisional => {}
            TransactionStatus::Reconciled => {
                // replay: if the first run finished, hand back its outcome;
                // if it crashed mid-sequence, resume the idempotent steps
                if let Some(outcome) = self.existing_outcome(&transaction).await? {
                    return Ok(outcome);
                }
                self.check_tolerance(&transaction, actual_quantity)?;
                return self
                    .finish_reconciliation(
                        transaction,
                        actual_quantity,
                        quality_notes,
                        photo_refs,
                        signature_ref,
                        true,
                    )
                    .await;
            }
            status => {
                return Err(
                    ReconciliationError::TransactionNotProvisional { current: status }.into(),
                );
            }
        }

        self.check_tolerance(&transaction, actual_quantity)?;

        // admission gate: two concurrent pickups for one transaction resolve
        // to a single writer, the loser reads the winner's outcome
        let transaction = match self
            .store
            .cas_transaction_status(
                transaction_id,
                TransactionStatus::Provisional,
                TransactionStatus::Reconciled,
                Utc::now(),
            )
            .await?
        {
            Some(txn) => txn,
            None => {
                let txn = self
                    .store
                    .get_transaction(transaction_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(format!("Transaction {} not found", transaction_id))
                    })?;
                if txn.status != TransactionStatus::Reconciled {
                    return Err(ReconciliationError::TransactionNotProvisional {
                        current: txn.status,
                    }
                    .into());
                }
                if let Some(outcome) = self.existing_outcome(&txn).await? {
                    return Ok(outcome);
                }
                self.check_tolerance(&txn, actual_quantity)?;
                return self
                    .finish_reconciliation(
                        txn,
                        actual_quantity,
                        quality_notes,
                        photo_refs,
                        signature_ref,
                        true,
                    )
                    .await;
            }
        };

        self.finish_reconciliation(
            transaction,
            actual_quantity,
            quality_notes,
            photo_refs,
            signature_ref,
            false,
        )
        .await
    }

    /// Steps behind the gate; each tolerates having already run
    async fn finish_reconciliation(
        &self,
        transaction: Transaction,
        actual_quantity: Decimal,
        quality_notes: Option<String>,
        photo_refs: Vec<String>,
        signature_ref: String,
        replayed: bool,
    ) -> AppResult<ReconcileOutcome> {
        let pickup = self
            .store
            .insert_pickup(PickupRecord::new(
                transaction.id,
                actual_quantity,
                quality_notes,
                photo_refs,
                signature_ref,
            ))
            .await?;

        let transaction = self
            .store
            .set_settled_quantity(transaction.id, pickup.actual_quantity)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Transaction {} not found", transaction.id))
            })?;

        let payment = self.recompute_payment(&transaction).await?;

        info!(
            "Transaction {} reconciled: settled quantity {} (provisional {})",
            transaction.id,
            transaction.payable_quantity(),
            transaction.provisional_quantity
        );

        Ok(ReconcileOutcome {
            transaction,
            pickup,
            payment,
            already_reconciled: replayed,
        })
    }

    /// New payment superseding the provisional one, but only when the payable
    /// basis actually changed; an equal pickup leaves the provisional payment
    /// as the live record.
    async fn recompute_payment(&self, transaction: &Transaction) -> AppResult<Payment> {
        let prior = self
            .store
            .live_payment_for_transaction(transaction.id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "Transaction {} has no live payment",
                    transaction.id
                ))
            })?;

        let settled = transaction.payable_quantity();
        if settled == transaction.provisional_quantity {
            return Ok(prior);
        }

        // replay guard: the superseding payment may already exist
        if prior.supersedes.is_some() {
            return Ok(prior);
        }

        let breakdown = calculator::compute(
            settled * transaction.agreed_unit_price,
            self.policy.commission_rate_pct,
            self.policy.tax_rate_pct,
        );
        // atomic insert-and-link keyed by the prior: if a concurrent
        // recompute got there first we receive its replacement back
        let replacement = self
            .store
            .supersede_payment(
                prior.id,
                Payment::initiated(
                    transaction.id,
                    breakdown,
                    self.policy.commission_rate_pct,
                    self.policy.tax_rate_pct,
                    Some(prior.id),
                ),
            )
            .await?;

        info!(
            "Payment {} superseded by {} for transaction {}: gross {} -> {}",
            prior.id, replacement.id, transaction.id, prior.gross_amount, replacement.gross_amount
        );
        Ok(replacement)
    }

    async fn existing_outcome(
        &self,
        transaction: &Transaction,
    ) -> AppResult<Option<ReconcileOutcome>> {
        let Some(pickup) = self
            .store
            .get_pickup_by_transaction(transaction.id)
            .await?
        else {
            return Ok(None);
        };
        let payment = self
            .store
            .live_payment_for_transaction(transaction.id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "Transaction {} has no live payment",
                    transaction.id
                ))
            })?;
        Ok(Some(ReconcileOutcome {
            transaction: transaction.clone(),
            pickup,
            payment,
            already_reconciled: true,
        }))
    }

    /// A wildly divergent quantity is never silently settled; it stays
    /// provisional for manual seller/buyer resolution.
    fn check_tolerance(&self, transaction: &Transaction, actual: Decimal) -> AppResult<()> {
        let provisional = transaction.provisional_quantity;
        let deviation_pct =
            ((actual - provisional) / provisional * Decimal::ONE_HUNDRED).abs();

        if deviation_pct > self.policy.quantity_tolerance_pct {
            warn!(
                "Pickup for transaction {} out of tolerance: actual {}, provisional {}, deviation {}%",
                transaction.id, actual, provisional, deviation_pct
            );
            return Err(ReconciliationError::QuantityOutOfTolerance {
                actual: actual.to_string(),
                provisional: provisional.to_string(),
                deviation_pct: deviation_pct.round_dp(2).to_string(),
                tolerance_pct: self.policy.quantity_tolerance_pct.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::PaymentStatus;
    use crate::ledger::InMemoryLedger;
    use crate::settlement::SettlementEngine;
    use rust_decimal_macros::dec;

    async fn settled_transaction(
        store: &Arc<dyn LedgerStore>,
    ) -> (SettlementEngine, Transaction) {
        let engine = SettlementEngine::new(store.clone(), SettlementPolicy::default());
        let seller = Uuid::new_v4();
        let lot = engine
            .create_lot(
                seller,
                "wheat".to_string(),
                dec!(100),
                "FAQ".to_string(),
                dec!(2000),
            )
            .await
            .unwrap();
        engine.open_lot(lot.id, seller, None).await.unwrap();
        let bid = engine
            .submit_bid(lot.id, Uuid::new_v4(), dec!(2100), dec!(100))
            .await
            .unwrap();
        let outcome = engine.accept_bid(lot.id, bid.id, seller).await.unwrap();
        (engine, outcome.transaction)
    }

    fn service(store: &Arc<dyn LedgerStore>) -> ReconciliationService {
        ReconciliationService::new(store.clone(), SettlementPolicy::default())
    }

    fn photos() -> Vec<String> {
        vec!["photo-1".to_string(), "photo-2".to_string()]
    }

    #[tokio::test]
    async fn shortfall_within_tolerance_supersedes_payment() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let (_, txn) = settled_transaction(&store).await;
        let recon = service(&store);

        let outcome = recon
            .reconcile_pickup(txn.id, dec!(92), None, photos(), "sig-1".to_string())
            .await
            .unwrap();

        assert!(!outcome.already_reconciled);
        assert_eq!(outcome.transaction.status, TransactionStatus::Reconciled);
        assert_eq!(outcome.transaction.settled_quantity, Some(dec!(92)));
        // 92 x 2100
        assert_eq!(outcome.payment.gross_amount, dec!(193200.00));
        assert_eq!(outcome.payment.status, PaymentStatus::Initiated);

        // prior payment survives as a superseded audit record
        let history = store.list_payments_for_transaction(txn.id).await.unwrap();
        assert_eq!(history.len(), 2);
        let prior = history.iter().find(|p| p.gross_amount == dec!(210000.00)).unwrap();
        assert_eq!(prior.superseded_by, Some(outcome.payment.id));
        assert_eq!(outcome.payment.supersedes, Some(prior.id));
    }

    #[tokio::test]
    async fn out_of_tolerance_is_refused_and_leaves_no_trace() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let (_, txn) = settled_transaction(&store).await;
        let recon = service(&store);

        // 60% shortfall against a 10% band
        let err = recon
            .reconcile_pickup(txn.id, dec!(40), None, photos(), "sig-1".to_string())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Reconciliation(ReconciliationError::QuantityOutOfTolerance { .. })
        ));

        let txn = store.get_transaction(txn.id).await.unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Provisional);
        assert!(txn.settled_quantity.is_none());
        assert!(store
            .get_pickup_by_transaction(txn.id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store
                .list_payments_for_transaction(txn.id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn missing_evidence_is_refused() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let (_, txn) = settled_transaction(&store).await;
        let recon = service(&store);

        let err = recon
            .reconcile_pickup(txn.id, dec!(95), None, vec![], "sig-1".to_string())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Reconciliation(ReconciliationError::MissingEvidence(_))
        ));

        let err = recon
            .reconcile_pickup(txn.id, dec!(95), None, photos(), "  ".to_string())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Reconciliation(ReconciliationError::MissingEvidence(_))
        ));
    }

    #[tokio::test]
    async fn second_reconcile_is_idempotent() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let (_, txn) = settled_transaction(&store).await;
        let recon = service(&store);

        let first = recon
            .reconcile_pickup(txn.id, dec!(92), None, photos(), "sig-1".to_string())
            .await
            .unwrap();
        let second = recon
            .reconcile_pickup(
                txn.id,
                dec!(90),
                Some("late retry".to_string()),
                vec!["photo-9".to_string()],
                "sig-9".to_string(),
            )
            .await
            .unwrap();

        assert!(second.already_reconciled);
        assert_eq!(second.transaction.settled_quantity, Some(dec!(92)));
        assert_eq!(second.pickup.id, first.pickup.id);
        assert_eq!(second.payment.id, first.payment.id);
        // still exactly one pickup and two payments
        assert_eq!(
            store
                .list_payments_for_transaction(txn.id)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn equal_quantity_keeps_provisional_payment_live() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let (_, txn) = settled_transaction(&store).await;
        let recon = service(&store);

        let outcome = recon
            .reconcile_pickup(txn.id, dec!(100), None, photos(), "sig-1".to_string())
            .await
            .unwrap();

        assert_eq!(outcome.transaction.settled_quantity, Some(dec!(100)));
        assert_eq!(outcome.payment.gross_amount, dec!(210000.00));
        assert_eq!(
            store
                .list_payments_for_transaction(txn.id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn concurrent_reconciles_write_once() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let (_, txn) = settled_transaction(&store).await;
        let recon = Arc::new(service(&store));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let recon = recon.clone();
                let txn_id = txn.id;
                tokio::spawn(async move {
                    recon
                        .reconcile_pickup(
                            txn_id,
                            dec!(92),
                            None,
                            vec![format!("photo-{}", i)],
                            format!("sig-{}", i),
                        )
                        .await
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let outcomes: Vec<_> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        let fresh = outcomes.iter().filter(|o| !o.already_reconciled).count();
        assert_eq!(fresh, 1);
        let pickup_id = outcomes[0].pickup.id;
        assert!(outcomes.iter().all(|o| o.pickup.id == pickup_id));
        assert!(outcomes
            .iter()
            .all(|o| o.transaction.settled_quantity == Some(dec!(92))));

        // one provisional payment, one replacement, exactly one live
        let history = store.list_payments_for_transaction(txn.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|p| p.is_live()).count(), 1);
        let payment_id = outcomes[0].payment.id;
        assert!(outcomes.iter().all(|o| o.payment.id == payment_id));
    }

    #[tokio::test]
    async fn racing_recomputes_produce_one_replacement() {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let (_, txn) = settled_transaction(&store).await;
        let recon = Arc::new(service(&store));

        // two resumed runs both read the same live prior before either
        // writes: the transaction is already reconciled with a revised
        // quantity, and both recompute against it simultaneously
        store
            .cas_transaction_status(
                txn.id,
                TransactionStatus::Provisional,
                TransactionStatus::Reconciled,
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();
        let txn = store
            .set_settled_quantity(txn.id, dec!(92))
            .await
            .unwrap()
            .unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let recon = recon.clone();
                let txn = txn.clone();
                tokio::spawn(async move { recon.recompute_payment(&txn).await })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let payments: Vec<_> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        // both callers converge on the same replacement
        assert_eq!(payments[0].id, payments[1].id);
        assert_eq!(payments[0].gross_amount, dec!(193200.00));

        let history = store.list_payments_for_transaction(txn.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|p| p.is_live()).count(), 1);
    }
}
