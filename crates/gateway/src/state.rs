//! Shared application state
//!
//! Built once at process start and injected into handlers and middleware.
//! There are no module-level singletons; teardown happens when the last
//! clone drops at shutdown.

use std::sync::Arc;

use sqlx::PgPool;

use avaolo_billing::BillingService;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Arc<Config>, billing: Arc<BillingService>) -> Self {
        Self {
            pool,
            config,
            billing,
        }
    }
}
