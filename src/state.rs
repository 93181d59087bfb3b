//! 应用状态
//! 组装存储、服务、事件总线与日历同步任务，供宿主（HTTP 层、任务进程）共享

use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, SyncConfig};
use crate::error::Result;
use crate::events::EventBus;
use crate::repository::{AttendanceStore, LeaveStore, PgAttendanceRepository, PgLeaveRepository};
use crate::services::{
    AttendanceService, AttendanceSettings, LeaveLedger, LeaveService, LeaveSettings,
};
use crate::sync::{CalendarSync, SyncWorker};

pub struct AppState {
    pub leave: Arc<LeaveService>,
    pub ledger: Arc<LeaveLedger>,
    pub attendance: Arc<AttendanceService>,
    pub events: EventBus,
    pub sync_worker: Arc<SyncWorker>,
}

impl AppState {
    /// 基于任意存储实现组装
    pub fn build(
        leave_store: Arc<dyn LeaveStore>,
        attendance_store: Arc<dyn AttendanceStore>,
        leave_settings: LeaveSettings,
        attendance_settings: AttendanceSettings,
        sync: SyncConfig,
        calendar: Arc<dyn CalendarSync>,
    ) -> Self {
        let events = EventBus::new(sync.channel_capacity);

        let sync_worker = Arc::new(
            SyncWorker::new(sync, leave_store.clone(), calendar)
                .with_deadline(leave_settings.deadline),
        );
        let ledger = Arc::new(LeaveLedger::new(
            leave_store.clone(),
            leave_settings.negative_balance,
            leave_settings.deadline,
        ));
        let leave = Arc::new(LeaveService::new(
            leave_store,
            events.clone(),
            leave_settings,
        ));
        let attendance = Arc::new(AttendanceService::new(attendance_store, attendance_settings));

        Self {
            leave,
            ledger,
            attendance,
            events,
            sync_worker,
        }
    }

    /// 基于 PostgreSQL 组装
    pub fn with_pool(pool: PgPool, config: &AppConfig, calendar: Arc<dyn CalendarSync>) -> Result<Self> {
        Ok(Self::build(
            Arc::new(PgLeaveRepository::new(pool.clone())),
            Arc::new(PgAttendanceRepository::new(pool)),
            LeaveSettings::from_config(config)?,
            AttendanceSettings::from_config(config),
            config.sync.clone(),
            calendar,
        ))
    }

    /// 启动日历同步消费任务
    pub fn start_sync(&self) -> JoinHandle<()> {
        self.sync_worker.clone().spawn(&self.events)
    }
}
