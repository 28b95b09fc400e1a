use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

use crate::ledger::models::{BidStatus, LotStatus, PaymentStatus, TransactionStatus};

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Reconciliation error: {0}")]
    Reconciliation(#[from] ReconciliationError),

    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Lot/bid lifecycle errors owned by the settlement engine
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Lot is not open for bidding: {current:?}")]
    LotNotOpen { current: LotStatus },

    #[error("Lot has expired")]
    LotExpired,

    #[error("Lot already settled")]
    LotAlreadySettled,

    #[error("Lot cannot be cancelled in state {current:?}")]
    LotNotCancellable { current: LotStatus },

    #[error("Bid quantity {offered} exceeds lot quantity {listed}")]
    QuantityExceedsLot { offered: String, listed: String },

    #[error("Bid is not pending: {current:?}")]
    BidNotPending { current: BidStatus },

    #[error("Acting party is not the lot seller")]
    NotLotSeller,

    #[error("Acting party is not the bid owner")]
    NotBidOwner,

    #[error("Lot can only be edited while draft: {current:?}")]
    LotNotEditable { current: LotStatus },
}

/// Pickup reconciliation errors
#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("Transaction is not provisional: {current:?}")]
    TransactionNotProvisional { current: TransactionStatus },

    #[error("Pickup evidence missing: {0}")]
    MissingEvidence(String),

    #[error("Actual quantity {actual} deviates {deviation_pct}% from provisional {provisional}, tolerance {tolerance_pct}%")]
    QuantityOutOfTolerance {
        actual: String,
        provisional: String,
        deviation_pct: String,
        tolerance_pct: String,
    },
}

/// Payment verification errors. Illegal transitions on terminal payment data
/// are integrity violations, logged as anomalies by the verification service.
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Payment in state {current:?} cannot transition to {requested:?}")]
    InvalidVerificationState {
        current: PaymentStatus,
        requested: PaymentStatus,
    },

    #[error("Payment has been superseded")]
    PaymentSuperseded,
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::Settlement(SettlementError::LotNotOpen { current }) => (
                StatusCode::CONFLICT,
                "LOT_NOT_OPEN",
                self.to_string(),
                Some(serde_json::json!({"lot_status": current})),
            ),
            AppError::Settlement(SettlementError::LotExpired) => (
                StatusCode::CONFLICT,
                "LOT_EXPIRED",
                "Lot has expired".to_string(),
                None,
            ),
            AppError::Settlement(SettlementError::LotAlreadySettled) => (
                StatusCode::CONFLICT,
                "LOT_ALREADY_SETTLED",
                "Lot has already been settled".to_string(),
                None,
            ),
            AppError::Settlement(SettlementError::LotNotCancellable { current }) => (
                StatusCode::CONFLICT,
                "LOT_NOT_CANCELLABLE",
                self.to_string(),
                Some(serde_json::json!({"lot_status": current})),
            ),
            AppError::Settlement(SettlementError::LotNotEditable { current }) => (
                StatusCode::CONFLICT,
                "LOT_NOT_EDITABLE",
                self.to_string(),
                Some(serde_json::json!({"lot_status": current})),
            ),
            AppError::Settlement(SettlementError::QuantityExceedsLot { offered, listed }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "QUANTITY_EXCEEDS_LOT",
                self.to_string(),
                Some(serde_json::json!({"offered": offered, "listed": listed})),
            ),
            AppError::Settlement(SettlementError::BidNotPending { current }) => (
                StatusCode::CONFLICT,
                "BID_NOT_PENDING",
                self.to_string(),
                Some(serde_json::json!({"bid_status": current})),
            ),
            AppError::Settlement(SettlementError::NotLotSeller) => (
                StatusCode::FORBIDDEN,
                "NOT_LOT_SELLER",
                "Acting party is not the lot seller".to_string(),
                None,
            ),
            AppError::Settlement(SettlementError::NotBidOwner) => (
                StatusCode::FORBIDDEN,
                "NOT_BID_OWNER",
                "Acting party is not the bid owner".to_string(),
                None,
            ),
            AppError::Reconciliation(ReconciliationError::TransactionNotProvisional {
                current,
            }) => (
                StatusCode::CONFLICT,
                "TRANSACTION_NOT_PROVISIONAL",
                self.to_string(),
                Some(serde_json::json!({"transaction_status": current})),
            ),
            AppError::Reconciliation(ReconciliationError::MissingEvidence(_)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "MISSING_EVIDENCE",
                self.to_string(),
                None,
            ),
            AppError::Reconciliation(ReconciliationError::QuantityOutOfTolerance {
                actual,
                provisional,
                deviation_pct,
                tolerance_pct,
            }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "QUANTITY_OUT_OF_TOLERANCE",
                self.to_string(),
                Some(serde_json::json!({
                    "actual": actual,
                    "provisional": provisional,
                    "deviation_pct": deviation_pct,
                    "tolerance_pct": tolerance_pct,
                })),
            ),
            AppError::Verification(VerificationError::InvalidVerificationState {
                current,
                requested,
            }) => (
                StatusCode::CONFLICT,
                "INVALID_VERIFICATION_STATE",
                self.to_string(),
                Some(serde_json::json!({"current": current, "requested": requested})),
            ),
            AppError::Verification(VerificationError::PaymentSuperseded) => (
                StatusCode::CONFLICT,
                "PAYMENT_SUPERSEDED",
                "Payment has been superseded".to_string(),
                None,
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                None,
            ),
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                msg.clone(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Internal(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
