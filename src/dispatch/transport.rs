use std::sync::Arc;

use async_trait::async_trait;

use crate::channels::DispatchPayload;
use crate::models::DispatchRecord;

/// Result of one transport attempt. Failures are values, not errors: the
/// worker folds them into the record's own retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Failed(String),
}

impl DeliveryOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Wire-level sender for one channel (SMTP relay, SMS gateway, event bus, ...)
#[async_trait]
pub trait Transport<P: DispatchPayload>: Send + Sync + 'static {
    async fn send(&self, record: &DispatchRecord<P>) -> DeliveryOutcome;

    fn name(&self) -> &'static str;
}

#[async_trait]
impl<P: DispatchPayload, T: Transport<P>> Transport<P> for Arc<T> {
    async fn send(&self, record: &DispatchRecord<P>) -> DeliveryOutcome {
        (**self).send(record).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
