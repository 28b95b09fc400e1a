use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger::models::{
    Bid, BidStatus, Lot, LotStatus, Payment, PaymentStatus, PickupRecord, Transaction,
    TransactionStatus,
};
use crate::ledger::store::LedgerStore;

const LOT_COLUMNS: &str = "id, seller_id, commodity, quantity, quality_grade, \
     expected_unit_price, status, created_at, expires_at, updated_at";
const BID_COLUMNS: &str = "id, lot_id, bidder_id, unit_price, quantity, status, \
     submitted_at, decided_at";
const TXN_COLUMNS: &str = "id, lot_id, bid_id, seller_id, buyer_id, agreed_unit_price, \
     provisional_quantity, settled_quantity, status, created_at, reconciled_at, closed_at";
const PAYMENT_COLUMNS: &str = "id, transaction_id, gross_amount, commission_rate_pct, \
     commission_amount, tax_rate_pct, tax_amount, net_amount, status, supersedes, \
     superseded_by, gateway_ref, failure_reason, initiated_at, completed_at";
const PICKUP_COLUMNS: &str = "id, transaction_id, actual_quantity, quality_notes, \
     photo_refs, signature_ref, captured_at";

/// Postgres-backed ledger store. Status swaps are conditional UPDATEs so the
/// database is the arbiter of every compare-and-swap.
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> AppResult<Self> {
        info!("📊 Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(50)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("✓ Database initialized");
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedger {
    async fn insert_lot(&self, lot: Lot) -> AppResult<Lot> {
        let inserted = sqlx::query_as::<_, Lot>(&format!(
            r#"
            INSERT INTO lots ({LOT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {LOT_COLUMNS}
            "#
        ))
        .bind(lot.id)
        .bind(lot.seller_id)
        .bind(&lot.commodity)
        .bind(lot.quantity)
        .bind(&lot.quality_grade)
        .bind(lot.expected_unit_price)
        .bind(lot.status)
        .bind(lot.created_at)
        .bind(lot.expires_at)
        .bind(lot.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn get_lot(&self, lot_id: Uuid) -> AppResult<Option<Lot>> {
        let lot = sqlx::query_as::<_, Lot>(&format!(
            "SELECT {LOT_COLUMNS} FROM lots WHERE id = $1"
        ))
        .bind(lot_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(lot)
    }

    async fn update_draft_lot(&self, lot: Lot) -> AppResult<Option<Lot>> {
        let updated = sqlx::query_as::<_, Lot>(&format!(
            r#"
            UPDATE lots
            SET commodity = $2, quantity = $3, quality_grade = $4,
                expected_unit_price = $5, updated_at = NOW()
            WHERE id = $1 AND status = 'draft'
            RETURNING {LOT_COLUMNS}
            "#
        ))
        .bind(lot.id)
        .bind(&lot.commodity)
        .bind(lot.quantity)
        .bind(&lot.quality_grade)
        .bind(lot.expected_unit_price)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated)
    }

    async fn cas_lot_status(
        &self,
        lot_id: Uuid,
        from: &[LotStatus],
        to: LotStatus,
    ) -> AppResult<Option<Lot>> {
        let updated = sqlx::query_as::<_, Lot>(&format!(
            r#"
            UPDATE lots
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            RETURNING {LOT_COLUMNS}
            "#
        ))
        .bind(lot_id)
        .bind(to)
        .bind(from)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated)
    }

    async fn open_draft_lot(
        &self,
        lot_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> AppResult<Option<Lot>> {
        let opened = sqlx::query_as::<_, Lot>(&format!(
            r#"
            UPDATE lots
            SET status = 'open', expires_at = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'draft'
            RETURNING {LOT_COLUMNS}
            "#
        ))
        .bind(lot_id)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(opened)
    }

    async fn list_lots_by_seller(&self, seller_id: Uuid) -> AppResult<Vec<Lot>> {
        let lots = sqlx::query_as::<_, Lot>(&format!(
            "SELECT {LOT_COLUMNS} FROM lots WHERE seller_id = $1 ORDER BY created_at DESC"
        ))
        .bind(seller_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(lots)
    }

    async fn list_expirable_lots(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM lots WHERE status = 'open' AND expires_at IS NOT NULL AND expires_at < $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn insert_bid(&self, bid: Bid) -> AppResult<Option<Bid>> {
        // lot status is checked in the same statement, so a bid can never
        // land on a lot a concurrent acceptance has already taken past open
        let inserted = sqlx::query_as::<_, Bid>(&format!(
            r#"
            INSERT INTO bids ({BID_COLUMNS})
            SELECT $1, $2, $3, $4, $5, $6, $7, $8
            WHERE EXISTS (SELECT 1 FROM lots WHERE id = $2 AND status = 'open')
            RETURNING {BID_COLUMNS}
            "#
        ))
        .bind(bid.id)
        .bind(bid.lot_id)
        .bind(bid.bidder_id)
        .bind(bid.unit_price)
        .bind(bid.quantity)
        .bind(bid.status)
        .bind(bid.submitted_at)
        .bind(bid.decided_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn get_bid(&self, bid_id: Uuid) -> AppResult<Option<Bid>> {
        let bid = sqlx::query_as::<_, Bid>(&format!(
            "SELECT {BID_COLUMNS} FROM bids WHERE id = $1"
        ))
        .bind(bid_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(bid)
    }

    async fn cas_bid_status(
        &self,
        bid_id: Uuid,
        from: BidStatus,
        to: BidStatus,
        decided_at: DateTime<Utc>,
    ) -> AppResult<Option<Bid>> {
        let updated = sqlx::query_as::<_, Bid>(&format!(
            r#"
            UPDATE bids
            SET status = $2, decided_at = $3
            WHERE id = $1 AND status = $4
            RETURNING {BID_COLUMNS}
            "#
        ))
        .bind(bid_id)
        .bind(to)
        .bind(decided_at)
        .bind(from)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated)
    }

    async fn decide_pending_bids(
        &self,
        lot_id: Uuid,
        except: Option<Uuid>,
        to: BidStatus,
        decided_at: DateTime<Utc>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE bids
            SET status = $2, decided_at = $3
            WHERE lot_id = $1 AND status = 'pending' AND ($4::uuid IS NULL OR id <> $4)
            "#,
        )
        .bind(lot_id)
        .bind(to)
        .bind(decided_at)
        .bind(except)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_bids_for_lot(&self, lot_id: Uuid) -> AppResult<Vec<Bid>> {
        let bids = sqlx::query_as::<_, Bid>(&format!(
            "SELECT {BID_COLUMNS} FROM bids WHERE lot_id = $1 ORDER BY submitted_at"
        ))
        .bind(lot_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(bids)
    }

    async fn list_bids_by_bidder(&self, bidder_id: Uuid) -> AppResult<Vec<Bid>> {
        let bids = sqlx::query_as::<_, Bid>(&format!(
            "SELECT {BID_COLUMNS} FROM bids WHERE bidder_id = $1 ORDER BY submitted_at"
        ))
        .bind(bidder_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(bids)
    }

    async fn list_expirable_bids(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT b.id FROM bids b
            JOIN lots l ON l.id = b.lot_id
            WHERE b.status = 'pending' AND l.expires_at IS NOT NULL AND l.expires_at < $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn insert_transaction_for_lot(&self, txn: Transaction) -> AppResult<Transaction> {
        // lot_id carries a unique index; a replayed cascade hits the conflict
        // and reads back the transaction the first run created
        sqlx::query(&format!(
            r#"
            INSERT INTO transactions ({TXN_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (lot_id) DO NOTHING
            "#
        ))
        .bind(txn.id)
        .bind(txn.lot_id)
        .bind(txn.bid_id)
        .bind(txn.seller_id)
        .bind(txn.buyer_id)
        .bind(txn.agreed_unit_price)
        .bind(txn.provisional_quantity)
        .bind(txn.settled_quantity)
        .bind(txn.status)
        .bind(txn.created_at)
        .bind(txn.reconciled_at)
        .bind(txn.closed_at)
        .execute(&self.pool)
        .await?;

        let stored = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TXN_COLUMNS} FROM transactions WHERE lot_id = $1"
        ))
        .bind(txn.lot_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> AppResult<Option<Transaction>> {
        let txn = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TXN_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(txn)
    }

    async fn get_transaction_by_lot(&self, lot_id: Uuid) -> AppResult<Option<Transaction>> {
        let txn = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TXN_COLUMNS} FROM transactions WHERE lot_id = $1"
        ))
        .bind(lot_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(txn)
    }

    async fn cas_transaction_status(
        &self,
        transaction_id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Transaction>> {
        let timestamp_column = match to {
            TransactionStatus::Reconciled => "reconciled_at",
            TransactionStatus::Closed => "closed_at",
            TransactionStatus::Provisional => "created_at",
        };

        let updated = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            UPDATE transactions
            SET status = $2, {timestamp_column} = $3
            WHERE id = $1 AND status = $4
            RETURNING {TXN_COLUMNS}
            "#
        ))
        .bind(transaction_id)
        .bind(to)
        .bind(at)
        .bind(from)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated)
    }

    async fn set_settled_quantity(
        &self,
        transaction_id: Uuid,
        settled_quantity: Decimal,
    ) -> AppResult<Option<Transaction>> {
        sqlx::query(
            "UPDATE transactions SET settled_quantity = $2 WHERE id = $1 AND settled_quantity IS NULL",
        )
        .bind(transaction_id)
        .bind(settled_quantity)
        .execute(&self.pool)
        .await?;

        self.get_transaction(transaction_id).await
    }

    async fn insert_pickup(&self, record: PickupRecord) -> AppResult<PickupRecord> {
        sqlx::query(&format!(
            r#"
            INSERT INTO pickup_records ({PICKUP_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (transaction_id) DO NOTHING
            "#
        ))
        .bind(record.id)
        .bind(record.transaction_id)
        .bind(record.actual_quantity)
        .bind(&record.quality_notes)
        .bind(&record.photo_refs)
        .bind(&record.signature_ref)
        .bind(record.captured_at)
        .execute(&self.pool)
        .await?;

        let stored = sqlx::query_as::<_, PickupRecord>(&format!(
            "SELECT {PICKUP_COLUMNS} FROM pickup_records WHERE transaction_id = $1"
        ))
        .bind(record.transaction_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }

    async fn get_pickup_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> AppResult<Option<PickupRecord>> {
        let record = sqlx::query_as::<_, PickupRecord>(&format!(
            "SELECT {PICKUP_COLUMNS} FROM pickup_records WHERE transaction_id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn insert_payment(&self, payment: Payment) -> AppResult<Payment> {
        let inserted = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments ({PAYMENT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment.id)
        .bind(payment.transaction_id)
        .bind(payment.gross_amount)
        .bind(payment.commission_rate_pct)
        .bind(payment.commission_amount)
        .bind(payment.tax_rate_pct)
        .bind(payment.tax_amount)
        .bind(payment.net_amount)
        .bind(payment.status)
        .bind(payment.supersedes)
        .bind(payment.superseded_by)
        .bind(&payment.gateway_ref)
        .bind(&payment.failure_reason)
        .bind(payment.initiated_at)
        .bind(payment.completed_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn get_payment(&self, payment_id: Uuid) -> AppResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn list_payments_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE transaction_id = $1 ORDER BY initiated_at"
        ))
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }

    async fn live_payment_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> AppResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE transaction_id = $1 AND superseded_by IS NULL \
             ORDER BY initiated_at DESC LIMIT 1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn supersede_payment(
        &self,
        prior_id: Uuid,
        replacement: Payment,
    ) -> AppResult<Payment> {
        // link and insert in one statement: the conditional UPDATE on the
        // prior is the admission, so only one replacement can ever attach
        let inserted = sqlx::query_as::<_, Payment>(&format!(
            r#"
            WITH linked AS (
                UPDATE payments SET superseded_by = $1
                WHERE id = $16 AND superseded_by IS NULL
                RETURNING id
            )
            INSERT INTO payments ({PAYMENT_COLUMNS})
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
            WHERE EXISTS (SELECT 1 FROM linked)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(replacement.id)
        .bind(replacement.transaction_id)
        .bind(replacement.gross_amount)
        .bind(replacement.commission_rate_pct)
        .bind(replacement.commission_amount)
        .bind(replacement.tax_rate_pct)
        .bind(replacement.tax_amount)
        .bind(replacement.net_amount)
        .bind(replacement.status)
        .bind(replacement.supersedes)
        .bind(replacement.superseded_by)
        .bind(&replacement.gateway_ref)
        .bind(&replacement.failure_reason)
        .bind(replacement.initiated_at)
        .bind(replacement.completed_at)
        .bind(prior_id)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(payment) => Ok(payment),
            // a concurrent reconciler won the link; return its replacement
            None => {
                let winner = sqlx::query_as::<_, Payment>(&format!(
                    r#"
                    SELECT {PAYMENT_COLUMNS} FROM payments
                    WHERE id = (SELECT superseded_by FROM payments WHERE id = $1)
                    "#
                ))
                .bind(prior_id)
                .fetch_one(&self.pool)
                .await?;
                Ok(winner)
            }
        }
    }

    async fn mark_payment_completed(
        &self,
        payment_id: Uuid,
        gateway_ref: String,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Payment>> {
        let updated = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET status = 'completed', gateway_ref = $2, completed_at = $3
            WHERE id = $1 AND status = 'initiated' AND superseded_by IS NULL
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment_id)
        .bind(gateway_ref)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated)
    }

    async fn mark_payment_verified(&self, payment_id: Uuid) -> AppResult<Option<Payment>> {
        let updated = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET status = 'verified'
            WHERE id = $1 AND status = 'completed' AND superseded_by IS NULL
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated)
    }

    async fn mark_payment_failed(
        &self,
        payment_id: Uuid,
        from: PaymentStatus,
        reason: String,
    ) -> AppResult<Option<Payment>> {
        let updated = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET status = 'failed', failure_reason = $3
            WHERE id = $1 AND status = $2 AND superseded_by IS NULL
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment_id)
        .bind(from)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated)
    }
}
