//! Shared application state.

use std::sync::Arc;

use portaria_membership::{EngineContext, PanelFlows, PaymentReconciler};

#[derive(Clone)]
pub struct AppState {
    pub ctx: EngineContext,
    pub flows: Arc<PanelFlows>,
    pub reconciler: Arc<PaymentReconciler>,
    /// Webhook signature secret; verification is skipped when `None`.
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(ctx: EngineContext, flows: PanelFlows, webhook_secret: Option<String>) -> Self {
        Self {
            reconciler: Arc::new(PaymentReconciler::new(ctx.clone())),
            flows: Arc::new(flows),
            ctx,
            webhook_secret,
        }
    }
}
