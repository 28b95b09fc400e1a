use axum::{
    routing::{get, post, put},
    Extension, Router,
};
use http::{HeaderName, HeaderValue};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    api::handlers::{
        accept_bid, cancel_lot, complete_payment, create_lot, fail_payment, get_lot,
        get_lot_transaction, get_payment, get_transaction, get_transaction_pickup, health_check,
        list_bidder_bids, list_lot_bids, list_seller_lots, list_transaction_payments, open_lot,
        reconcile_transaction, reject_bid, submit_bid, update_lot, verify_payment, withdraw_bid,
        AppState,
    },
    middleware::{rate_limit_middleware, RateLimitLayer},
};

pub async fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let rate_limit = Arc::new(RateLimitLayer::new(100, 60));

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Lot lifecycle
                .route("/lots", post(create_lot).get(list_seller_lots))
                .route("/lots/:lot_id", put(update_lot).get(get_lot))
                .route("/lots/:lot_id/open", post(open_lot))
                .route("/lots/:lot_id/cancel", post(cancel_lot))
                // Bidding and settlement
                .route("/lots/:lot_id/bids", post(submit_bid).get(list_lot_bids))
                .route("/lots/:lot_id/bids/:bid_id/accept", post(accept_bid))
                .route("/lots/:lot_id/bids/:bid_id/reject", post(reject_bid))
                .route("/bids", get(list_bidder_bids))
                .route("/bids/:bid_id/withdraw", post(withdraw_bid))
                // Transactions and reconciliation
                .route("/lots/:lot_id/transaction", get(get_lot_transaction))
                .route("/transactions/:transaction_id", get(get_transaction))
                .route(
                    "/transactions/:transaction_id/reconcile",
                    post(reconcile_transaction),
                )
                .route(
                    "/transactions/:transaction_id/pickup",
                    get(get_transaction_pickup),
                )
                .route(
                    "/transactions/:transaction_id/payments",
                    get(list_transaction_payments),
                )
                // Payment lifecycle callbacks
                .route("/payments/:payment_id", get(get_payment))
                .route("/payments/:payment_id/complete", post(complete_payment))
                .route("/payments/:payment_id/verify", post(verify_payment))
                .route("/payments/:payment_id/fail", post(fail_payment))
                .layer(axum::middleware::from_fn(rate_limit_middleware))
                .layer(Extension(rate_limit)),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(SetResponseHeaderLayer::if_not_present(
                    HeaderName::from_static("x-frame-options"),
                    HeaderValue::from_static("DENY"),
                ))
                .layer(SetResponseHeaderLayer::if_not_present(
                    HeaderName::from_static("x-content-type-options"),
                    HeaderValue::from_static("nosniff"),
                ))
                .layer(CorsLayer::very_permissive()),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
