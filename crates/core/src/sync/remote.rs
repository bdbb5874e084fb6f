//! Remote submission contract for queued operations.

use async_trait::async_trait;
use serde_json::Value;

use super::model::{OperationKind, SubmitAck};
use crate::errors::RemoteError;

/// Server-side collaborator that applies queued operations.
///
/// `idempotency_token` is stable per queue entry. Implementations must treat
/// a resubmission of a token they have already applied as
/// [`SubmitAck::AlreadyApplied`], never as a second application.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn submit(
        &self,
        operation: OperationKind,
        payload: &Value,
        idempotency_token: &str,
    ) -> Result<SubmitAck, RemoteError>;
}
