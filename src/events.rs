//! Domain events
//! 进程内事件总线：审批提交后广播 "leave approved"，由同步任务异步消费

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{AppError, Result};
use crate::models::leave::LeaveRequest;

/// 休假批准事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveApprovedEvent {
    pub request_id: i64,
    pub user_id: i64,
    pub display_name: Option<String>,
    pub email: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl From<&LeaveRequest> for LeaveApprovedEvent {
    fn from(request: &LeaveRequest) -> Self {
        Self {
            request_id: request.request_id,
            user_id: request.user_id,
            display_name: request.user_name.clone(),
            email: request.user_email.clone(),
            start_date: request.start_date,
            end_date: request.end_date,
        }
    }
}

/// 领域事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    LeaveApproved(LeaveApprovedEvent),
}

impl DomainEvent {
    /// 获取事件类型名称
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::LeaveApproved(_) => "leave_approved",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DomainEvent::LeaveApproved(event) => serde_json::json!({
                "type": self.event_type(),
                "data": event,
            }),
        }
    }
}

/// 事件总线
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发布事件，返回收到事件的订阅者数量
    pub fn publish(&self, event: DomainEvent) -> Result<usize> {
        self.sender
            .send(event)
            .map_err(|e| AppError::internal_error(&format!("Failed to publish event: {}", e)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
