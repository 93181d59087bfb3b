//! Leave domain models
//! 休假申请、休假策略、余额台账

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{AppError, Result};
use crate::models::pagination::SortField;

/// 休假申请状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "leave_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaveStatus {
    /// 待审批
    Pending,
    /// 已批准
    Approved,
    /// 已拒绝
    Rejected,
    /// 已取消
    Cancelled,
}

impl LeaveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaveStatus::Pending => "PENDING",
            LeaveStatus::Approved => "APPROVED",
            LeaveStatus::Rejected => "REJECTED",
            LeaveStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for LeaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaveStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(LeaveStatus::Pending),
            "APPROVED" => Ok(LeaveStatus::Approved),
            "REJECTED" => Ok(LeaveStatus::Rejected),
            "CANCELLED" => Ok(LeaveStatus::Cancelled),
            other => Err(AppError::Validation {
                code: "VALIDATION_ERROR",
                message: format!("Unknown leave status: {}", other),
            }),
        }
    }
}

/// 审批动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaveAction {
    Approve,
    Reject,
    Cancel,
}

impl LeaveAction {
    /// 动作到目标状态的固定映射
    pub fn target_status(self) -> LeaveStatus {
        match self {
            LeaveAction::Approve => LeaveStatus::Approved,
            LeaveAction::Reject => LeaveStatus::Rejected,
            LeaveAction::Cancel => LeaveStatus::Cancelled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LeaveAction::Approve => "APPROVE",
            LeaveAction::Reject => "REJECT",
            LeaveAction::Cancel => "CANCEL",
        }
    }
}

impl FromStr for LeaveAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "APPROVE" => Ok(LeaveAction::Approve),
            "REJECT" => Ok(LeaveAction::Reject),
            "CANCEL" => Ok(LeaveAction::Cancel),
            _ => Err(AppError::InvalidAction(s.to_string())),
        }
    }
}

/// 休假策略（年假、病假等）
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeavePolicy {
    pub policy_id: i64,
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub annual_limit: Decimal,
    pub is_active: bool,
}

/// 余额投影
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaveBalance {
    pub balance_id: i64,
    pub policy_id: i64,
    pub policy_name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub balance_days: Decimal,
    pub year: i32,
}

/// 余额查询结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveBalanceSummary {
    pub user_id: i64,
    pub balances: Vec<LeaveBalance>,
}

/// 休假申请
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaveRequest {
    pub request_id: i64,
    pub user_id: i64,
    pub user_email: String,
    pub user_name: Option<String>,
    pub policy_id: i64,
    pub policy_name: String,
    pub status: LeaveStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub half_day: bool,
    pub reason: Option<String>,
    /// 批准时实际扣减的天数（取消时按此原额返还）
    #[serde(with = "rust_decimal::serde::float_option")]
    pub days_deducted: Option<Decimal>,
    pub decided_by: Option<i64>,
    pub decided_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LeaveRequest {
    /// 台账年度取开始日期所在的日历年
    pub fn policy_year(&self) -> i32 {
        self.start_date.year()
    }

    /// 闭区间相交
    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start_date <= end && self.end_date >= start
    }
}

/// 创建休假申请请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateLeaveRequest {
    #[validate(range(min = 1))]
    pub policy_id: i64,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub half_day: bool,
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}

/// 审批请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DecideLeaveRequest {
    pub action: String,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

/// 写入存储的新申请
#[derive(Debug, Clone)]
pub struct NewLeaveRequest {
    pub user_id: i64,
    pub policy_id: i64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub half_day: bool,
    pub reason: Option<String>,
}

/// 审批人信息
#[derive(Debug, Clone)]
pub struct Decision {
    pub actor_id: i64,
    pub notes: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// 审计记录
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaveAuditEntry {
    pub request_id: i64,
    pub action: LeaveStatus,
    pub actor_id: i64,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 台账分录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEntry {
    /// 扣减（批准）
    Debit { days: Decimal, year: i32 },
    /// 返还（取消已批准的申请）
    Credit { days: Decimal, year: i32 },
}

impl LedgerEntry {
    pub fn year(&self) -> i32 {
        match self {
            LedgerEntry::Debit { year, .. } | LedgerEntry::Credit { year, .. } => *year,
        }
    }

    pub fn days(&self) -> Decimal {
        match self {
            LedgerEntry::Debit { days, .. } | LedgerEntry::Credit { days, .. } => *days,
        }
    }

    /// 计算分录生效后的余额
    ///
    /// `Reject` 策略下扣减不得使余额为负。
    pub fn apply(&self, current: Decimal, policy: NegativeBalancePolicy) -> Result<Decimal> {
        match *self {
            LedgerEntry::Credit { days, .. } => Ok(current + days),
            LedgerEntry::Debit { days, .. } => {
                let next = current - days;
                if next < Decimal::ZERO {
                    match policy {
                        NegativeBalancePolicy::Reject => {
                            return Err(AppError::InsufficientBalance {
                                available: current,
                                requested: days,
                            })
                        }
                        NegativeBalancePolicy::Allow => {
                            tracing::warn!(
                                available = %current,
                                requested = %days,
                                "Debit drives leave balance negative"
                            );
                        }
                    }
                }
                Ok(next)
            }
        }
    }
}

/// 负余额处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeBalancePolicy {
    /// 拒绝会导致负余额的扣减
    #[default]
    Reject,
    /// 允许扣减为负，由对账任务事后报告
    Allow,
}

/// 重叠检测范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapScope {
    /// 待审批与已批准的申请都参与检测
    #[default]
    Active,
    /// 仅已批准的申请参与检测
    Approved,
}

impl OverlapScope {
    pub fn statuses(self) -> &'static [LeaveStatus] {
        match self {
            OverlapScope::Active => &[LeaveStatus::Pending, LeaveStatus::Approved],
            OverlapScope::Approved => &[LeaveStatus::Approved],
        }
    }
}

/// 状态迁移计划（由工作流在锁定的申请行上计算）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    pub target: LeaveStatus,
    pub ledger: Option<LedgerEntry>,
    /// 仅 PENDING→APPROVED 时发出同步事件
    pub emit_sync: bool,
    /// 已处于目标状态：不写台账、不发事件
    pub no_op: bool,
}

/// 状态迁移结果
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub request: LeaveRequest,
    pub previous: LeaveStatus,
    pub plan: TransitionPlan,
    pub balance_after: Option<Decimal>,
}

/// 休假申请查询条件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeaveRequestFilters {
    pub user_id: Option<i64>,
    pub status: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub page: Option<i64>,
    pub size: Option<i64>,
    /// `field,dir`
    pub sort: Option<String>,
}

/// 规范化后的查询
#[derive(Debug, Clone)]
pub struct LeaveRequestQuery {
    pub user_id: Option<i64>,
    pub status: Option<LeaveStatus>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub page: crate::models::pagination::PageRequest,
    pub sort: crate::models::pagination::SortSpec<LeaveSortField>,
}

/// 休假申请排序字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveSortField {
    CreatedAt,
    UpdatedAt,
    StartDate,
    EndDate,
    Status,
}

impl SortField for LeaveSortField {
    const ALLOWED: &'static [(&'static str, Self)] = &[
        ("created_at", LeaveSortField::CreatedAt),
        ("updated_at", LeaveSortField::UpdatedAt),
        ("start_date", LeaveSortField::StartDate),
        ("end_date", LeaveSortField::EndDate),
        ("status", LeaveSortField::Status),
    ];

    fn fallback() -> Self {
        LeaveSortField::CreatedAt
    }

    fn column(self) -> &'static str {
        match self {
            LeaveSortField::CreatedAt => "created_at",
            LeaveSortField::UpdatedAt => "updated_at",
            LeaveSortField::StartDate => "start_date",
            LeaveSortField::EndDate => "end_date",
            LeaveSortField::Status => "status",
        }
    }
}

/// 对账报告
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub total_rows: i64,
    /// 本次归零的 NULL 余额行数
    pub null_fixed: i64,
    /// 归零后仍为 NULL 的行数（正常应为 0）
    pub null_remaining: i64,
    pub negative_count: i64,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.null_remaining == 0 && self.negative_count == 0
    }
}

/// 休假汇总报表查询条件（日期为 YYYY-MM-DD）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeaveSummaryFilters {
    /// 申请开始日期不早于此日
    pub from: Option<String>,
    /// 申请结束日期不晚于此日
    pub to: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LeaveSummaryQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// 单个休假策略的汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeavePolicySummary {
    pub policy_id: i64,
    pub policy_name: String,
    pub total_requests: i64,
    pub pending: i64,
    pub approved: i64,
    pub rejected: i64,
    pub cancelled: i64,
    /// 已批准申请实际扣减的天数（半天计 0.5）
    #[serde(with = "rust_decimal::serde::float")]
    pub approved_days: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaveSummaryTotals {
    pub total_requests: i64,
    pub pending: i64,
    pub approved: i64,
    pub rejected: i64,
    pub cancelled: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub approved_days: Decimal,
}

impl LeaveSummaryTotals {
    pub fn from_policies(policies: &[LeavePolicySummary]) -> Self {
        policies.iter().fold(Self::default(), |acc, policy| Self {
            total_requests: acc.total_requests + policy.total_requests,
            pending: acc.pending + policy.pending,
            approved: acc.approved + policy.approved,
            rejected: acc.rejected + policy.rejected,
            cancelled: acc.cancelled + policy.cancelled,
            approved_days: acc.approved_days + policy.approved_days,
        })
    }
}

/// 休假汇总报表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveSummaryReport {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub policies: Vec<LeavePolicySummary>,
    pub totals: LeaveSummaryTotals,
}
