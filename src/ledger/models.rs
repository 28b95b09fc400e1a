use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

use crate::payment::calculator::PaymentBreakdown;

/// Lot lifecycle. Transitions are monotonic except Cancelled, which is
/// reachable from Draft/Open only. A settled lot never re-opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "lot_status", rename_all = "snake_case")]
pub enum LotStatus {
    Draft,
    Open,
    PendingSettlement,
    Settled,
    Expired,
    Cancelled,
}

impl LotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LotStatus::Draft => "draft",
            LotStatus::Open => "open",
            LotStatus::PendingSettlement => "pending_settlement",
            LotStatus::Settled => "settled",
            LotStatus::Expired => "expired",
            LotStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LotStatus::Settled | LotStatus::Expired | LotStatus::Cancelled
        )
    }
}

impl fmt::Display for LotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// bound as a slice in the status compare-and-swap queries
impl sqlx::postgres::PgHasArrayType for LotStatus {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("_lot_status")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "bid_status", rename_all = "snake_case")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
    Withdrawn,
    Expired,
}

impl BidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::Pending => "pending",
            BidStatus::Accepted => "accepted",
            BidStatus::Rejected => "rejected",
            BidStatus::Withdrawn => "withdrawn",
            BidStatus::Expired => "expired",
        }
    }

    /// Decided bids are immutable
    pub fn is_decided(&self) -> bool {
        !matches!(self, BidStatus::Pending)
    }
}

impl fmt::Display for BidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "transaction_status", rename_all = "snake_case")]
pub enum TransactionStatus {
    Provisional,
    Reconciled,
    Closed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Provisional => "provisional",
            TransactionStatus::Reconciled => "reconciled",
            TransactionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
pub enum PaymentStatus {
    Initiated,
    Completed,
    Verified,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "initiated",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Verified => "verified",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Verified | PaymentStatus::Failed)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A listed quantity of a commodity offered by a seller (farmer or FPO)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Lot {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub commodity: String,
    /// Listed quantity in quintals, always > 0
    pub quantity: Decimal,
    pub quality_grade: String,
    pub expected_unit_price: Decimal,
    pub status: LotStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Lot {
    pub fn new(
        seller_id: Uuid,
        commodity: String,
        quantity: Decimal,
        quality_grade: String,
        expected_unit_price: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            seller_id,
            commodity,
            quantity,
            quality_grade,
            expected_unit_price,
            status: LotStatus::Draft,
            created_at: now,
            expires_at: None,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if now > expiry)
    }

    pub fn can_receive_bids(&self) -> bool {
        self.status == LotStatus::Open
    }
}

/// A buyer's offer against an open lot
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Bid {
    pub id: Uuid,
    pub lot_id: Uuid,
    pub bidder_id: Uuid,
    pub unit_price: Decimal,
    pub quantity: Decimal,
    pub status: BidStatus,
    pub submitted_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl Bid {
    pub fn new(lot_id: Uuid, bidder_id: Uuid, unit_price: Decimal, quantity: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            lot_id,
            bidder_id,
            unit_price,
            quantity,
            status: BidStatus::Pending,
            submitted_at: Utc::now(),
            decided_at: None,
        }
    }
}

/// The binding commercial agreement created the instant a bid is accepted.
/// Exactly one per lot; the agreed unit price never changes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub lot_id: Uuid,
    pub bid_id: Uuid,
    pub seller_id: Uuid,
    pub buyer_id: Uuid,
    pub agreed_unit_price: Decimal,
    pub provisional_quantity: Decimal,
    /// Set exactly once by reconciliation, final thereafter
    pub settled_quantity: Option<Decimal>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn from_accepted_bid(lot: &Lot, bid: &Bid) -> Self {
        Self {
            id: Uuid::new_v4(),
            lot_id: lot.id,
            bid_id: bid.id,
            seller_id: lot.seller_id,
            buyer_id: bid.bidder_id,
            agreed_unit_price: bid.unit_price,
            provisional_quantity: bid.quantity,
            settled_quantity: None,
            status: TransactionStatus::Provisional,
            created_at: Utc::now(),
            reconciled_at: None,
            closed_at: None,
        }
    }

    /// Basis the payment is computed on: settled quantity once reconciled,
    /// provisional quantity before that
    pub fn payable_quantity(&self) -> Decimal {
        self.settled_quantity.unwrap_or(self.provisional_quantity)
    }
}

/// Physical evidence gathered at collection time. At most one per
/// transaction, immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PickupRecord {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub actual_quantity: Decimal,
    pub quality_notes: Option<String>,
    /// Opaque handles into the evidence store, never raw media
    pub photo_refs: Vec<String>,
    pub signature_ref: String,
    pub captured_at: DateTime<Utc>,
}

impl PickupRecord {
    pub fn new(
        transaction_id: Uuid,
        actual_quantity: Decimal,
        quality_notes: Option<String>,
        photo_refs: Vec<String>,
        signature_ref: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            actual_quantity,
            quality_notes,
            photo_refs,
            signature_ref,
            captured_at: Utc::now(),
        }
    }
}

/// Monetary settlement derived from a transaction. Append-only: a change of
/// payable basis produces a new record linked by `supersedes`, never an edit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub gross_amount: Decimal,
    pub commission_rate_pct: Decimal,
    pub commission_amount: Decimal,
    pub tax_rate_pct: Decimal,
    pub tax_amount: Decimal,
    pub net_amount: Decimal,
    pub status: PaymentStatus,
    pub supersedes: Option<Uuid>,
    pub superseded_by: Option<Uuid>,
    pub gateway_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn initiated(
        transaction_id: Uuid,
        breakdown: PaymentBreakdown,
        commission_rate_pct: Decimal,
        tax_rate_pct: Decimal,
        supersedes: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            gross_amount: breakdown.gross,
            commission_rate_pct,
            commission_amount: breakdown.commission,
            tax_rate_pct,
            tax_amount: breakdown.tax,
            net_amount: breakdown.net,
            status: PaymentStatus::Initiated,
            supersedes,
            superseded_by: None,
            gateway_ref: None,
            failure_reason: None,
            initiated_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Superseded payments are frozen audit records
    pub fn is_live(&self) -> bool {
        self.superseded_by.is_none()
    }
}
