//! API server configuration

use flock_billing::{BillingConfig, BillingResult};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub allowed_origins: Vec<String>,
    pub billing: BillingConfig,
}

impl Config {
    pub fn from_env() -> BillingResult<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| flock_billing::BillingError::Config("DATABASE_URL"))?;
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            bind_address,
            allowed_origins,
            billing: BillingConfig::from_env()?,
        })
    }
}
