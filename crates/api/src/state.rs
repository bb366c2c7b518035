//! Application state

use std::sync::Arc;

use flock_billing::{BillingService, InvoiceDocument, InvoiceRenderer};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
    /// Stateless invoice renderer collaborator.
    pub renderer: Arc<dyn InvoiceRenderer>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = Arc::new(BillingService::new(pool.clone(), config.billing.clone()));
        tracing::info!("Billing service initialized");

        Self {
            pool,
            config,
            billing,
            renderer: Arc::new(JsonInvoiceRenderer),
        }
    }
}

/// Default renderer: a pretty-printed JSON document. The production PDF
/// renderer plugs in through the same trait.
pub struct JsonInvoiceRenderer;

impl InvoiceRenderer for JsonInvoiceRenderer {
    fn render(&self, document: &InvoiceDocument) -> flock_billing::BillingResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(document)?)
    }
}
