use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::ledger::models::*;
use crate::reconciliation::ReconcileOutcome;
use crate::settlement::SettlementOutcome;

// ========== REQUEST MODELS ==========

#[derive(Debug, Deserialize, Validate)]
pub struct CreateLotRequest {
    pub seller_id: Uuid,
    #[validate(length(min = 1, max = 128))]
    pub commodity: String,
    pub quantity: Decimal,
    #[validate(length(min = 1, max = 64))]
    pub quality_grade: String,
    pub expected_unit_price: Decimal,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateLotRequest {
    pub acting_seller_id: Uuid,
    #[validate(length(min = 1, max = 128))]
    pub commodity: String,
    pub quantity: Decimal,
    #[validate(length(min = 1, max = 64))]
    pub quality_grade: String,
    pub expected_unit_price: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct OpenLotRequest {
    pub acting_seller_id: Uuid,
    /// Defaults to the policy listing window when absent
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CancelLotRequest {
    pub acting_seller_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct SubmitBidRequest {
    pub bidder_id: Uuid,
    pub unit_price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct BidDecisionRequest {
    pub acting_seller_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawBidRequest {
    pub acting_bidder_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReconcilePickupRequest {
    pub actual_quantity: Decimal,
    pub quality_notes: Option<String>,
    /// Opaque evidence-store handles, already uploaded by the caller
    #[validate(length(min = 1))]
    pub photo_refs: Vec<String>,
    #[validate(length(min = 1))]
    pub signature_ref: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CompletePaymentRequest {
    #[validate(length(min = 1, max = 128))]
    pub gateway_ref: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct FailPaymentRequest {
    #[validate(length(min = 1, max = 512))]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct SellerQuery {
    pub seller_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct BidderQuery {
    pub bidder_id: Uuid,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct LotResponse {
    pub lot_id: Uuid,
    pub seller_id: Uuid,
    pub commodity: String,
    pub quantity: String,
    pub quality_grade: String,
    pub expected_unit_price: String,
    pub status: LotStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<Lot> for LotResponse {
    fn from(lot: Lot) -> Self {
        Self {
            lot_id: lot.id,
            seller_id: lot.seller_id,
            commodity: lot.commodity,
            quantity: lot.quantity.to_string(),
            quality_grade: lot.quality_grade,
            expected_unit_price: lot.expected_unit_price.to_string(),
            status: lot.status,
            created_at: lot.created_at,
            expires_at: lot.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BidResponse {
    pub bid_id: Uuid,
    pub lot_id: Uuid,
    pub bidder_id: Uuid,
    pub unit_price: String,
    pub quantity: String,
    pub status: BidStatus,
    pub submitted_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl From<Bid> for BidResponse {
    fn from(bid: Bid) -> Self {
        Self {
            bid_id: bid.id,
            lot_id: bid.lot_id,
            bidder_id: bid.bidder_id,
            unit_price: bid.unit_price.to_string(),
            quantity: bid.quantity.to_string(),
            status: bid.status,
            submitted_at: bid.submitted_at,
            decided_at: bid.decided_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub transaction_id: Uuid,
    pub lot_id: Uuid,
    pub bid_id: Uuid,
    pub seller_id: Uuid,
    pub buyer_id: Uuid,
    pub agreed_unit_price: String,
    pub provisional_quantity: String,
    pub settled_quantity: Option<String>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl From<Transaction> for TransactionResponse {
    fn from(txn: Transaction) -> Self {
        Self {
            transaction_id: txn.id,
            lot_id: txn.lot_id,
            bid_id: txn.bid_id,
            seller_id: txn.seller_id,
            buyer_id: txn.buyer_id,
            agreed_unit_price: txn.agreed_unit_price.to_string(),
            provisional_quantity: txn.provisional_quantity.to_string(),
            settled_quantity: txn.settled_quantity.map(|q| q.to_string()),
            status: txn.status,
            created_at: txn.created_at,
            reconciled_at: txn.reconciled_at,
            closed_at: txn.closed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PickupResponse {
    pub pickup_id: Uuid,
    pub transaction_id: Uuid,
    pub actual_quantity: String,
    pub quality_notes: Option<String>,
    pub photo_refs: Vec<String>,
    pub signature_ref: String,
    pub captured_at: DateTime<Utc>,
}

impl From<PickupRecord> for PickupResponse {
    fn from(record: PickupRecord) -> Self {
        Self {
            pickup_id: record.id,
            transaction_id: record.transaction_id,
            actual_quantity: record.actual_quantity.to_string(),
            quality_notes: record.quality_notes,
            photo_refs: record.photo_refs,
            signature_ref: record.signature_ref,
            captured_at: record.captured_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub payment_id: Uuid,
    pub transaction_id: Uuid,
    pub gross_amount: String,
    pub commission_rate_pct: String,
    pub commission_amount: String,
    pub tax_rate_pct: String,
    pub tax_amount: String,
    pub net_amount: String,
    pub status: PaymentStatus,
    pub supersedes: Option<Uuid>,
    pub superseded_by: Option<Uuid>,
    pub gateway_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        Self {
            payment_id: payment.id,
            transaction_id: payment.transaction_id,
            gross_amount: payment.gross_amount.to_string(),
            commission_rate_pct: payment.commission_rate_pct.to_string(),
            commission_amount: payment.commission_amount.to_string(),
            tax_rate_pct: payment.tax_rate_pct.to_string(),
            tax_amount: payment.tax_amount.to_string(),
            net_amount: payment.net_amount.to_string(),
            status: payment.status,
            supersedes: payment.supersedes,
            superseded_by: payment.superseded_by,
            gateway_ref: payment.gateway_ref,
            failure_reason: payment.failure_reason,
            initiated_at: payment.initiated_at,
            completed_at: payment.completed_at,
        }
    }
}

/// Everything a bid acceptance settled
#[derive(Debug, Serialize)]
pub struct SettlementResponse {
    pub bid: BidResponse,
    pub transaction: TransactionResponse,
    pub payment: PaymentResponse,
    pub already_settled: bool,
}

impl From<SettlementOutcome> for SettlementResponse {
    fn from(outcome: SettlementOutcome) -> Self {
        Self {
            bid: outcome.bid.into(),
            transaction: outcome.transaction.into(),
            payment: outcome.payment.into(),
            already_settled: outcome.already_settled,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub transaction: TransactionResponse,
    pub pickup: PickupResponse,
    pub payment: PaymentResponse,
    pub already_reconciled: bool,
}

impl From<ReconcileOutcome> for ReconcileResponse {
    fn from(outcome: ReconcileOutcome) -> Self {
        Self {
            transaction: outcome.transaction.into(),
            pickup: outcome.pickup.into(),
            payment: outcome.payment.into(),
            already_reconciled: outcome.already_reconciled,
        }
    }
}
