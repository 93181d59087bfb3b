//! Business logic services layer

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::telemetry::STORE_TIMEOUTS;

pub mod attendance_service;
pub mod leave_service;
pub mod ledger_service;

pub use attendance_service::{AttendanceService, AttendanceSettings, Geofence};
pub use leave_service::{plan_transition, LeaveService, LeaveSettings};
pub use ledger_service::LeaveLedger;

/// 在截止时间内等待存储操作
///
/// 超时后 future 被丢弃，事务随之回滚，操作视为未生效。
pub(crate) async fn within_deadline<T, F>(deadline: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(elapsed) => {
            metrics::counter!(STORE_TIMEOUTS, "operation" => operation).increment(1);
            tracing::warn!(operation, ?deadline, "Store operation exceeded deadline");
            Err(AppError::from(elapsed))
        }
    }
}
