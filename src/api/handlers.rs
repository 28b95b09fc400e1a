use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use super::models::*;
use crate::{
    error::{AppError, AppResult},
    ledger::store::LedgerStore,
    payment::{PaymentRailClient, PaymentVerification},
    reconciliation::ReconciliationService,
    settlement::SettlementEngine,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub engine: Arc<SettlementEngine>,
    pub reconciliation: Arc<ReconciliationService>,
    pub verification: Arc<PaymentVerification>,
    pub rail: Option<Arc<PaymentRailClient>>,
}

fn validated<T: Validate>(request: T) -> AppResult<T> {
    request
        .validate()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;
    Ok(request)
}

// ========== LOT COMMANDS ==========

/// Create a draft lot
/// POST /lots
pub async fn create_lot(
    State(state): State<AppState>,
    Json(request): Json<CreateLotRequest>,
) -> AppResult<Json<LotResponse>> {
    let request = validated(request)?;
    let lot = state
        .engine
        .create_lot(
            request.seller_id,
            request.commodity,
            request.quantity,
            request.quality_grade,
            request.expected_unit_price,
        )
        .await?;

    info!("Lot created: {} by seller {}", lot.id, lot.seller_id);
    Ok(Json(lot.into()))
}

/// Edit a draft lot
/// PUT /lots/:id
pub async fn update_lot(
    State(state): State<AppState>,
    Path(lot_id): Path<Uuid>,
    Json(request): Json<UpdateLotRequest>,
) -> AppResult<Json<LotResponse>> {
    let request = validated(request)?;
    let lot = state
        .engine
        .update_lot(
            lot_id,
            request.acting_seller_id,
            request.commodity,
            request.quantity,
            request.quality_grade,
            request.expected_unit_price,
        )
        .await?;
    Ok(Json(lot.into()))
}

/// Open a draft lot for bidding
/// POST /lots/:id/open
pub async fn open_lot(
    State(state): State<AppState>,
    Path(lot_id): Path<Uuid>,
    Json(request): Json<OpenLotRequest>,
) -> AppResult<Json<LotResponse>> {
    let lot = state
        .engine
        .open_lot(lot_id, request.acting_seller_id, request.expires_at)
        .await?;

    info!("Lot {} open until {:?}", lot.id, lot.expires_at);
    Ok(Json(lot.into()))
}

/// Cancel a lot before any bid is accepted
/// POST /lots/:id/cancel
pub async fn cancel_lot(
    State(state): State<AppState>,
    Path(lot_id): Path<Uuid>,
    Json(request): Json<CancelLotRequest>,
) -> AppResult<Json<LotResponse>> {
    let lot = state
        .engine
        .cancel_lot(lot_id, request.acting_seller_id)
        .await?;

    info!("Lot {} cancelled", lot.id);
    Ok(Json(lot.into()))
}

// ========== BID COMMANDS ==========

/// Place a bid on an open lot
/// POST /lots/:id/bids
pub async fn submit_bid(
    State(state): State<AppState>,
    Path(lot_id): Path<Uuid>,
    Json(request): Json<SubmitBidRequest>,
) -> AppResult<Json<BidResponse>> {
    let bid = state
        .engine
        .submit_bid(lot_id, request.bidder_id, request.unit_price, request.quantity)
        .await?;

    info!("Bid {} submitted on lot {}", bid.id, lot_id);
    Ok(Json(bid.into()))
}

/// Accept a bid and settle the lot
/// POST /lots/:lot_id/bids/:bid_id/accept
pub async fn accept_bid(
    State(state): State<AppState>,
    Path((lot_id, bid_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<BidDecisionRequest>,
) -> AppResult<Json<SettlementResponse>> {
    let outcome = state
        .engine
        .accept_bid(lot_id, bid_id, request.acting_seller_id)
        .await?;

    if outcome.already_settled {
        info!("Lot {} already settled, returning recorded outcome", lot_id);
    } else {
        info!(
            "Lot {} settled: bid {}, transaction {}, payment {}",
            lot_id, outcome.bid.id, outcome.transaction.id, outcome.payment.id
        );
        // only the settling call initiates the payout
        dispatch_to_rail(&state, &outcome.payment);
    }

    Ok(Json(outcome.into()))
}

/// Reject a pending bid
/// POST /lots/:lot_id/bids/:bid_id/reject
pub async fn reject_bid(
    State(state): State<AppState>,
    Path((lot_id, bid_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<BidDecisionRequest>,
) -> AppResult<Json<BidResponse>> {
    let bid = state
        .engine
        .reject_bid(lot_id, bid_id, request.acting_seller_id)
        .await?;
    Ok(Json(bid.into()))
}

/// Withdraw an undecided bid
/// POST /bids/:id/withdraw
pub async fn withdraw_bid(
    State(state): State<AppState>,
    Path(bid_id): Path<Uuid>,
    Json(request): Json<WithdrawBidRequest>,
) -> AppResult<Json<BidResponse>> {
    let bid = state
        .engine
        .withdraw_bid(bid_id, request.acting_bidder_id)
        .await?;
    Ok(Json(bid.into()))
}

// ========== RECONCILIATION ==========

/// Record pickup evidence and reconcile the transaction
/// POST /transactions/:id/reconcile
pub async fn reconcile_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Json(request): Json<ReconcilePickupRequest>,
) -> AppResult<Json<ReconcileResponse>> {
    let request = validated(request)?;
    let outcome = state
        .reconciliation
        .reconcile_pickup(
            transaction_id,
            request.actual_quantity,
            request.quality_notes,
            request.photo_refs,
            request.signature_ref,
        )
        .await?;

    if outcome.already_reconciled {
        info!("Transaction {} already reconciled, returning recorded outcome", transaction_id);
    } else {
        info!(
            "Transaction {} reconciled: settled quantity {}, payment {}",
            transaction_id,
            outcome.pickup.actual_quantity,
            outcome.payment.id
        );
        // a superseding payment is a fresh payable and goes to the rail
        if outcome.payment.supersedes.is_some() {
            dispatch_to_rail(&state, &outcome.payment);
        }
    }

    Ok(Json(outcome.into()))
}

// ========== PAYMENT CALLBACKS ==========

/// Payment-rail callback: funds left the platform account
/// POST /payments/:id/complete
pub async fn complete_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<CompletePaymentRequest>,
) -> AppResult<Json<PaymentResponse>> {
    let request = validated(request)?;
    let payment = state
        .verification
        .mark_completed(payment_id, request.gateway_ref)
        .await?;
    Ok(Json(payment.into()))
}

/// Seller confirmed receipt
/// POST /payments/:id/verify
pub async fn verify_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Json<PaymentResponse>> {
    let payment = state.verification.mark_verified(payment_id).await?;
    Ok(Json(payment.into()))
}

/// Payment-rail callback: payout failed
/// POST /payments/:id/fail
pub async fn fail_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<FailPaymentRequest>,
) -> AppResult<Json<PaymentResponse>> {
    let request = validated(request)?;
    let payment = state
        .verification
        .mark_failed(payment_id, request.reason)
        .await?;
    Ok(Json(payment.into()))
}

// ========== QUERIES ==========

/// GET /lots/:id
pub async fn get_lot(
    State(state): State<AppState>,
    Path(lot_id): Path<Uuid>,
) -> AppResult<Json<LotResponse>> {
    let lot = state
        .store
        .get_lot(lot_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Lot {} not found", lot_id)))?;
    Ok(Json(lot.into()))
}

/// GET /lots?seller_id=...
pub async fn list_seller_lots(
    State(state): State<AppState>,
    Query(query): Query<SellerQuery>,
) -> AppResult<Json<Vec<LotResponse>>> {
    let lots = state.store.list_lots_by_seller(query.seller_id).await?;
    Ok(Json(lots.into_iter().map(Into::into).collect()))
}

/// GET /lots/:id/bids
pub async fn list_lot_bids(
    State(state): State<AppState>,
    Path(lot_id): Path<Uuid>,
) -> AppResult<Json<Vec<BidResponse>>> {
    let bids = state.store.list_bids_for_lot(lot_id).await?;
    Ok(Json(bids.into_iter().map(Into::into).collect()))
}

/// GET /bids?bidder_id=...
pub async fn list_bidder_bids(
    State(state): State<AppState>,
    Query(query): Query<BidderQuery>,
) -> AppResult<Json<Vec<BidResponse>>> {
    let bids = state.store.list_bids_by_bidder(query.bidder_id).await?;
    Ok(Json(bids.into_iter().map(Into::into).collect()))
}

/// GET /transactions/:id
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
) -> AppResult<Json<TransactionResponse>> {
    let txn = state
        .store
        .get_transaction(transaction_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Transaction {} not found", transaction_id)))?;
    Ok(Json(txn.into()))
}

/// GET /lots/:id/transaction
pub async fn get_lot_transaction(
    State(state): State<AppState>,
    Path(lot_id): Path<Uuid>,
) -> AppResult<Json<TransactionResponse>> {
    let txn = state
        .store
        .get_transaction_by_lot(lot_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Lot {} has no transaction", lot_id)))?;
    Ok(Json(txn.into()))
}

/// GET /transactions/:id/pickup
pub async fn get_transaction_pickup(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
) -> AppResult<Json<PickupResponse>> {
    let pickup = state
        .store
        .get_pickup_by_transaction(transaction_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("Transaction {} has no pickup record", transaction_id))
        })?;
    Ok(Json(pickup.into()))
}

/// Full payment history, superseded records included
/// GET /transactions/:id/payments
pub async fn list_transaction_payments(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
) -> AppResult<Json<Vec<PaymentResponse>>> {
    let payments = state
        .store
        .list_payments_for_transaction(transaction_id)
        .await?;
    Ok(Json(payments.into_iter().map(Into::into).collect()))
}

/// GET /payments/:id
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Json<PaymentResponse>> {
    let payment = state
        .store
        .get_payment(payment_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Payment {} not found", payment_id)))?;
    Ok(Json(payment.into()))
}

/// GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "mandi-settlement-core",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Fire-and-forget payout initiation. The rail acknowledges or rejects;
/// state only changes through the /payments callbacks.
fn dispatch_to_rail(state: &AppState, payment: &crate::ledger::models::Payment) {
    let Some(rail) = state.rail.clone() else {
        return;
    };
    let payment = payment.clone();
    tokio::spawn(async move {
        if let Err(e) = rail.initiate(&payment).await {
            warn!("Payout initiation for payment {} failed: {:?}", payment.id, e);
        }
    });
}
