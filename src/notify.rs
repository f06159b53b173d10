//! Alert notification port for flagged writes
//!
//! The sanitizer's rejections trigger a best-effort external notification.
//! The port is injectable so tests can swap it out and so a notification
//! failure can never influence the write's outcome: callers log and drop
//! the error.

use crate::error::Result;
use async_trait::async_trait;
use tracing::warn;

/// Notification sink for rejected (flagged) write attempts
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    /// Report a flagged write. Best-effort; callers ignore failures.
    async fn notify_flagged(
        &self,
        tenant_id: &str,
        actor_id: &str,
        operation: &str,
        reason: &str,
    ) -> Result<()>;
}

/// Default notifier: emits a structured warning to the log stream
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify_flagged(
        &self,
        tenant_id: &str,
        actor_id: &str,
        operation: &str,
        reason: &str,
    ) -> Result<()> {
        warn!(
            tenant_id,
            actor_id, operation, reason, "write rejected by content sanitizer"
        );
        Ok(())
    }
}

/// Silent notifier for tests and embedded use
pub struct NullNotifier;

#[async_trait]
impl AlertNotifier for NullNotifier {
    async fn notify_flagged(&self, _: &str, _: &str, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
}
