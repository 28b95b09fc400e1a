use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    api::handlers::AppState,
    config::Config,
    error::AppResult,
    ledger::{store::LedgerStore, InMemoryLedger, PostgresLedger},
    payment::{PaymentRailClient, PaymentVerification},
    reconciliation::ReconciliationService,
    settlement::{ExpirySweeper, SettlementEngine},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let store: Arc<dyn LedgerStore> = match &config.database_url {
        Some(url) => Arc::new(PostgresLedger::connect(url).await?),
        None => {
            warn!("⚠️  DATABASE_URL not set - using in-memory ledger, state is not durable");
            Arc::new(InMemoryLedger::new())
        }
    };

    let engine = Arc::new(SettlementEngine::new(store.clone(), config.policy));
    let reconciliation = Arc::new(ReconciliationService::new(store.clone(), config.policy));
    let verification = Arc::new(PaymentVerification::new(store.clone()));
    info!(
        "✅ Settlement engine ready (commission {}%, tax {}%, tolerance {}%)",
        config.policy.commission_rate_pct,
        config.policy.tax_rate_pct,
        config.policy.quantity_tolerance_pct
    );

    let rail = match &config.payment_rail_url {
        Some(url) => {
            info!("✅ Payment rail client configured: {}", url);
            Some(Arc::new(PaymentRailClient::new(url.clone())))
        }
        None => {
            warn!("⚠️  PAYMENT_RAIL_URL not set - payout initiation disabled");
            None
        }
    };

    let sweeper = ExpirySweeper::new(
        store.clone(),
        engine.clone(),
        Duration::from_secs(config.sweep_interval_secs),
    );
    let _sweep_handle = sweeper.start();
    info!(
        "✅ Expiry sweeper started (every {}s)",
        config.sweep_interval_secs
    );

    Ok(AppState {
        store,
        engine,
        reconciliation,
        verification,
        rail,
    })
}
