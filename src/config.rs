use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub bind_address: String,
    pub payment_rail_url: Option<String>,
    pub policy: SettlementPolicy,
    pub sweep_interval_secs: u64,
}

/// Policy values referenced by settlement and reconciliation. The
/// authoritative source is external; these are the env-supplied inputs.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct SettlementPolicy {
    /// Mandi commission charged on gross, percent
    pub commission_rate_pct: Decimal,
    /// Tax charged on gross, percent (not compounded with commission)
    pub tax_rate_pct: Decimal,
    /// Allowed deviation of pickup quantity from provisional quantity, percent
    pub quantity_tolerance_pct: Decimal,
    /// Listing window applied when a lot is opened without an explicit expiry
    pub lot_listing_hours: i64,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            commission_rate_pct: Decimal::new(2, 0),
            tax_rate_pct: Decimal::new(5, 0),
            quantity_tolerance_pct: Decimal::new(10, 0),
            lot_listing_hours: 72,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let defaults = SettlementPolicy::default();
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            payment_rail_url: std::env::var("PAYMENT_RAIL_URL").ok(),
            policy: SettlementPolicy {
                commission_rate_pct: decimal_env(
                    "COMMISSION_RATE_PCT",
                    defaults.commission_rate_pct,
                )?,
                tax_rate_pct: decimal_env("TAX_RATE_PCT", defaults.tax_rate_pct)?,
                quantity_tolerance_pct: decimal_env(
                    "QUANTITY_TOLERANCE_PCT",
                    defaults.quantity_tolerance_pct,
                )?,
                lot_listing_hours: std::env::var("LOT_LISTING_HOURS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.lot_listing_hours),
            },
            sweep_interval_secs: std::env::var("EXPIRY_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        })
    }
}

fn decimal_env(name: &str, default: Decimal) -> Result<Decimal, config::ConfigError> {
    match std::env::var(name) {
        Ok(raw) => Decimal::from_str(&raw).map_err(|e| {
            config::ConfigError::Message(format!("{} is not a valid decimal: {}", name, e))
        }),
        Err(_) => Ok(default),
    }
}
