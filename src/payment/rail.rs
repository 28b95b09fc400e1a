use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

use crate::error::AppResult;
use crate::ledger::models::Payment;

/// Initiation request sent to the payment rail. Completion and failure come
/// back through the verification callbacks; the core never polls or retries.
#[derive(Debug, Serialize)]
struct RailInitiationRequest {
    payment_id: uuid::Uuid,
    transaction_id: uuid::Uuid,
    net_amount: String,
    currency: &'static str,
}

pub struct PaymentRailClient {
    client: Client,
    base_url: String,
}

impl PaymentRailClient {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }

    /// Fire the initiation request for a freshly created payment. Called off
    /// the settlement path; a rail outage is logged, never propagated into
    /// the settled state.
    pub async fn initiate(&self, payment: &Payment) -> AppResult<()> {
        let request = RailInitiationRequest {
            payment_id: payment.id,
            transaction_id: payment.transaction_id,
            net_amount: payment.net_amount.to_string(),
            currency: "INR",
        };

        let response = self
            .client
            .post(format!("{}/payouts", self.base_url))
            .json(&request)
            .send()
            .await?;

        if response.status().is_success() {
            info!("Payment {} initiation accepted by rail", payment.id);
        } else {
            error!(
                "Rail rejected initiation for payment {}: {}",
                payment.id,
                response.status()
            );
        }
        Ok(())
    }
}
