//! Billing provider port.

use async_trait::async_trait;
use faultline_common::AppResult;
use tracing::debug;

#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Cancel every active subscription of a billing customer.
    ///
    /// Cancelling a customer without subscriptions succeeds.
    async fn cancel_subscriptions(&self, customer_id: &str) -> AppResult<()>;
}

/// Billing gateway for installations without paid plans.
#[derive(Debug, Clone, Default)]
pub struct NoOpBillingGateway;

#[async_trait]
impl BillingGateway for NoOpBillingGateway {
    async fn cancel_subscriptions(&self, customer_id: &str) -> AppResult<()> {
        debug!(customer_id, "Billing disabled, nothing to cancel");
        Ok(())
    }
}
