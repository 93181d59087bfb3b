//! Calendar sync
//! 消费 "leave approved" 事件并推送到外部日历；至少一次投递，按 request_id 去重，
//! 推送前复查申请仍为 APPROVED；失败只记录日志，不影响已提交的审批

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::Result as AppResult;
use crate::events::{DomainEvent, EventBus, LeaveApprovedEvent};
use crate::models::leave::LeaveStatus;
use crate::repository::LeaveStore;
use crate::services::within_deadline;
use crate::telemetry::SYNC_DELIVERIES;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// 对端拒绝，重试无意义
    #[error("Calendar rejected event: {0}")]
    Rejected(String),

    #[error("Calendar unavailable: {0}")]
    Unavailable(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Unavailable(_))
    }
}

/// 外部日历推送
#[async_trait]
pub trait CalendarSync: Send + Sync {
    async fn push_leave(&self, event: &LeaveApprovedEvent) -> Result<(), SyncError>;
}

/// 只写日志的默认实现
pub struct LoggingCalendarSync;

#[async_trait]
impl CalendarSync for LoggingCalendarSync {
    async fn push_leave(&self, event: &LeaveApprovedEvent) -> Result<(), SyncError> {
        info!(
            request_id = event.request_id,
            user_id = event.user_id,
            email = %event.email,
            start_date = %event.start_date,
            end_date = %event.end_date,
            "Calendar sync: leave approved"
        );
        Ok(())
    }
}

/// 单个事件的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Delivered { attempts: u32 },
    /// 该 request_id 已投递过
    Duplicate,
    Disabled,
    /// 申请已不存在或不再是 APPROVED
    Stale,
    Failed { attempts: u32 },
}

pub struct SyncWorker {
    config: SyncConfig,
    store: Arc<dyn LeaveStore>,
    sink: Arc<dyn CalendarSync>,
    deadline: Duration,
    /// 已投递的 request_id，容量受 dedupe_capacity 限制
    delivered: Cache<i64, ()>,
}

impl SyncWorker {
    pub fn new(config: SyncConfig, store: Arc<dyn LeaveStore>, sink: Arc<dyn CalendarSync>) -> Self {
        let delivered = Cache::builder()
            .max_capacity(config.dedupe_capacity)
            .build();

        Self {
            config,
            store,
            sink,
            deadline: Duration::from_secs(10),
            delivered,
        }
    }

    /// 复查申请状态时的存储截止时间
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// 订阅事件总线并在后台消费
    pub fn spawn(self: Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let receiver = bus.subscribe();
        tokio::spawn(async move { self.run(receiver).await })
    }

    pub async fn run(&self, mut receiver: broadcast::Receiver<DomainEvent>) {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    debug!(payload = %event.to_json(), "Domain event received");
                    match event {
                        DomainEvent::LeaveApproved(approved) => {
                            self.handle(&approved).await;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Calendar sync lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, calendar sync stopping");
                    break;
                }
            }
        }
    }

    pub async fn handle(&self, event: &LeaveApprovedEvent) -> SyncOutcome {
        if !self.config.enabled {
            debug!(request_id = event.request_id, "Calendar sync disabled");
            return SyncOutcome::Disabled;
        }

        if self.delivered.contains_key(&event.request_id) {
            debug!(request_id = event.request_id, "Duplicate leave approved event ignored");
            return SyncOutcome::Duplicate;
        }

        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let result = match self.still_approved(event.request_id).await {
                Ok(true) => self.sink.push_leave(event).await,
                Ok(false) => {
                    info!(
                        request_id = event.request_id,
                        "Leave request no longer approved, calendar sync skipped"
                    );
                    metrics::counter!(SYNC_DELIVERIES, "outcome" => "stale").increment(1);
                    return SyncOutcome::Stale;
                }
                Err(e) => Err(SyncError::Unavailable(format!("leave store: {}", e))),
            };

            match result {
                Ok(()) => {
                    self.delivered.insert(event.request_id, ()).await;
                    metrics::counter!(SYNC_DELIVERIES, "outcome" => "delivered").increment(1);
                    return SyncOutcome::Delivered { attempts: attempt };
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        request_id = event.request_id,
                        attempt,
                        error = %e,
                        "Calendar sync failed, retrying"
                    );
                    let backoff = self.config.retry_backoff_ms * attempt as u64;
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    error!(
                        request_id = event.request_id,
                        attempt,
                        error = %e,
                        "Calendar sync gave up"
                    );
                    metrics::counter!(SYNC_DELIVERIES, "outcome" => "failed").increment(1);
                    return SyncOutcome::Failed { attempts: attempt };
                }
            }
        }

        SyncOutcome::Failed {
            attempts: max_attempts,
        }
    }

    async fn still_approved(&self, request_id: i64) -> AppResult<bool> {
        let current = within_deadline(
            self.deadline,
            "sync.recheck",
            self.store.get_request(request_id),
        )
        .await?;
        Ok(matches!(current, Some(request) if request.status == LeaveStatus::Approved))
    }

    pub async fn delivered_count(&self) -> u64 {
        self.delivered.run_pending_tasks().await;
        self.delivered.entry_count()
    }
}
