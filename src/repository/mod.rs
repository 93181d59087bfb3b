//! Store layer
//! 休假与考勤的持久化契约，以及 PostgreSQL / 内存两种实现

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::models::attendance::{AttendanceLog, AttendanceQuery, NewClockIn, SessionClose};
use crate::models::leave::{
    Decision, LeaveAuditEntry, LeaveBalance, LeavePolicy, LeavePolicySummary, LeaveRequest,
    LeaveRequestQuery, LeaveStatus, LeaveSummaryQuery, LedgerEntry, NegativeBalancePolicy,
    NewLeaveRequest, OverlapScope, ReconciliationReport, TransitionOutcome, TransitionPlan,
};

pub mod attendance_repo;
pub mod leave_repo;
pub mod memory;

pub use attendance_repo::PgAttendanceRepository;
pub use leave_repo::PgLeaveRepository;
pub use memory::MemoryStore;

/// 在已锁定的申请上计算迁移计划
pub type TransitionPlanner<'a> = dyn Fn(&LeaveRequest) -> Result<TransitionPlan> + Send + Sync + 'a;

/// 在已锁定的打开会话上计算关闭字段
pub type SessionPlanner<'a> = dyn Fn(&AttendanceLog) -> Result<SessionClose> + Send + Sync + 'a;

/// 休假存储
///
/// 所有写操作都是原子的：要么完整生效，要么不生效（包括调用方在等待中途放弃）。
#[async_trait]
pub trait LeaveStore: Send + Sync {
    async fn policy(&self, policy_id: i64) -> Result<Option<LeavePolicy>>;

    async fn active_policies(&self) -> Result<Vec<LeavePolicy>>;

    /// 余额投影，NULL 余额按 0 返回
    async fn balances(&self, user_id: i64, year: i32) -> Result<Vec<LeaveBalance>>;

    /// 不存在时以 `days` 建立余额行；返回是否新建
    async fn allocate_balance(
        &self,
        user_id: i64,
        policy_id: i64,
        year: i32,
        days: Decimal,
    ) -> Result<bool>;

    /// 在行锁下应用单笔分录，返回新余额
    async fn adjust_balance(
        &self,
        user_id: i64,
        policy_id: i64,
        entry: LedgerEntry,
        negative_balance: NegativeBalancePolicy,
    ) -> Result<Decimal>;

    /// 检查重叠并插入 PENDING 申请（同一用户的创建互斥）
    async fn insert_request(
        &self,
        request: &NewLeaveRequest,
        scope: OverlapScope,
    ) -> Result<LeaveRequest>;

    async fn get_request(&self, request_id: i64) -> Result<Option<LeaveRequest>>;

    async fn list_requests(&self, query: &LeaveRequestQuery) -> Result<(Vec<LeaveRequest>, i64)>;

    async fn find_overlapping(
        &self,
        user_id: i64,
        start_date: NaiveDate,
        end_date: NaiveDate,
        statuses: &[LeaveStatus],
    ) -> Result<Vec<LeaveRequest>>;

    /// 锁定申请，按 planner 的计划在同一事务中写台账、状态和审计
    async fn apply_transition(
        &self,
        request_id: i64,
        planner: &TransitionPlanner<'_>,
        decision: &Decision,
        negative_balance: NegativeBalancePolicy,
    ) -> Result<TransitionOutcome>;

    async fn audit_trail(&self, request_id: i64) -> Result<Vec<LeaveAuditEntry>>;

    /// 按策略分组统计申请状态与已批准天数，按策略名排序
    async fn leave_summary(&self, query: &LeaveSummaryQuery) -> Result<Vec<LeavePolicySummary>>;

    /// NULL 余额归零并统计异常行
    async fn reconcile_balances(&self) -> Result<ReconciliationReport>;
}

/// 考勤存储
///
/// 每个用户至多一条打开的会话；并发上班打卡只能有一个成功。
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn open_session(&self, user_id: i64) -> Result<Option<AttendanceLog>>;

    async fn insert_clock_in(&self, clock_in: &NewClockIn) -> Result<AttendanceLog>;

    /// 锁定打开的会话并一次性写入下班时间、时长与位置
    async fn close_session(
        &self,
        user_id: i64,
        planner: &SessionPlanner<'_>,
    ) -> Result<AttendanceLog>;

    async fn list_logs(&self, query: &AttendanceQuery) -> Result<(Vec<AttendanceLog>, i64)>;
}
