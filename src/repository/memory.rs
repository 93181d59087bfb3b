//! In-memory store
//! 全部状态由一把互斥锁保护，每个操作在锁内一次性完成，因此天然线性化；
//! 任何失败都发生在写入之前，不会留下部分结果

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::attendance::*;
use crate::models::leave::*;
use crate::models::pagination::SortDirection;
use crate::repository::{AttendanceStore, LeaveStore, SessionPlanner, TransitionPlanner};

#[derive(Debug, Clone)]
struct MemoryUser {
    email: String,
    display_name: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct BalanceRow {
    balance_id: i64,
    days: Option<Decimal>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<i64, MemoryUser>,
    policies: BTreeMap<i64, LeavePolicy>,
    balances: BTreeMap<(i64, i64, i32), BalanceRow>,
    requests: BTreeMap<i64, LeaveRequest>,
    audit: Vec<LeaveAuditEntry>,
    logs: BTreeMap<i64, AttendanceLog>,
    last_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn user(&self, user_id: i64) -> Result<&MemoryUser> {
        self.users
            .get(&user_id)
            .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))
    }

    fn policy(&self, policy_id: i64) -> Result<&LeavePolicy> {
        self.policies
            .get(&policy_id)
            .ok_or_else(|| AppError::NotFound(format!("leave policy {}", policy_id)))
    }

    /// 计算分录生效后的余额但不写入；缺行时以策略年度额度为起点
    fn preview_entry(
        &self,
        user_id: i64,
        policy_id: i64,
        entry: LedgerEntry,
        negative_balance: NegativeBalancePolicy,
    ) -> Result<Decimal> {
        self.user(user_id)?;
        let policy = self.policy(policy_id)?;

        let current = match self.balances.get(&(user_id, policy_id, entry.year())) {
            Some(row) => row.days.unwrap_or(Decimal::ZERO),
            None => policy.annual_limit,
        };

        entry.apply(current, negative_balance)
    }

    fn write_balance(&mut self, user_id: i64, policy_id: i64, year: i32, days: Decimal) {
        let key = (user_id, policy_id, year);
        match self.balances.get_mut(&key) {
            Some(row) => row.days = Some(days),
            None => {
                let balance_id = self.next_id();
                self.balances.insert(
                    key,
                    BalanceRow {
                        balance_id,
                        days: Some(days),
                    },
                );
            }
        }
    }
}

/// 内存存储，同时实现 [`LeaveStore`] 与 [`AttendanceStore`]
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每个操作在加锁前等待的时间（模拟慢存储）
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, AtomicOrdering::SeqCst);
    }

    async fn simulate_latency(&self) {
        let millis = self.latency_ms.load(AtomicOrdering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    pub async fn add_user(&self, email: &str, display_name: Option<&str>) -> i64 {
        let mut state = self.state.lock().await;
        let user_id = state.next_id();
        state.users.insert(
            user_id,
            MemoryUser {
                email: email.to_string(),
                display_name: display_name.map(str::to_string),
            },
        );
        user_id
    }

    pub async fn add_policy(&self, name: &str, annual_limit: Decimal, is_active: bool) -> i64 {
        let mut state = self.state.lock().await;
        let policy_id = state.next_id();
        state.policies.insert(
            policy_id,
            LeavePolicy {
                policy_id,
                name: name.to_string(),
                annual_limit,
                is_active,
            },
        );
        policy_id
    }

    /// 直接写入余额行（允许 NULL，用于导入历史数据）
    pub async fn set_balance(&self, user_id: i64, policy_id: i64, year: i32, days: Option<Decimal>) {
        let mut state = self.state.lock().await;
        let key = (user_id, policy_id, year);
        let existing = state.balances.get(&key).map(|row| row.balance_id);
        let balance_id = match existing {
            Some(balance_id) => balance_id,
            None => state.next_id(),
        };
        state.balances.insert(key, BalanceRow { balance_id, days });
    }

    /// 原始余额值（区分缺行与 NULL）
    pub async fn raw_balance(&self, user_id: i64, policy_id: i64, year: i32) -> Option<Option<Decimal>> {
        let state = self.state.lock().await;
        state
            .balances
            .get(&(user_id, policy_id, year))
            .map(|row| row.days)
    }
}

fn compare_requests(a: &LeaveRequest, b: &LeaveRequest, field: LeaveSortField) -> Ordering {
    match field {
        LeaveSortField::CreatedAt => a.created_at.cmp(&b.created_at),
        LeaveSortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        LeaveSortField::StartDate => a.start_date.cmp(&b.start_date),
        LeaveSortField::EndDate => a.end_date.cmp(&b.end_date),
        // 与 PostgreSQL 枚举一致：按声明顺序
        LeaveSortField::Status => (a.status as u8).cmp(&(b.status as u8)),
    }
}

fn compare_logs(a: &AttendanceLog, b: &AttendanceLog, field: AttendanceSortField) -> Ordering {
    match field {
        AttendanceSortField::ClockIn => a.clock_in.cmp(&b.clock_in),
        // NULL 视为最大值，与 PostgreSQL 默认的 NULLS LAST / NULLS FIRST 一致
        AttendanceSortField::ClockOut => match (a.clock_out, b.clock_out) {
            (Some(x), Some(y)) => x.cmp(&y),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
        },
        AttendanceSortField::CreatedAt => a.created_at.cmp(&b.created_at),
    }
}

fn directed(ordering: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

fn paginate<T>(items: Vec<T>, offset: i64, limit: i64) -> Vec<T> {
    items
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

#[async_trait]
impl LeaveStore for MemoryStore {
    async fn policy(&self, policy_id: i64) -> Result<Option<LeavePolicy>> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        Ok(state.policies.get(&policy_id).cloned())
    }

    async fn active_policies(&self) -> Result<Vec<LeavePolicy>> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        Ok(state
            .policies
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }

    async fn balances(&self, user_id: i64, year: i32) -> Result<Vec<LeaveBalance>> {
        self.simulate_latency().await;
        let state = self.state.lock().await;

        let mut balances: Vec<LeaveBalance> = state
            .balances
            .iter()
            .filter(|((user, _, y), _)| *user == user_id && *y == year)
            .filter_map(|((_, policy_id, y), row)| {
                state.policies.get(policy_id).map(|policy| LeaveBalance {
                    balance_id: row.balance_id,
                    policy_id: *policy_id,
                    policy_name: policy.name.clone(),
                    balance_days: row.days.unwrap_or(Decimal::ZERO),
                    year: *y,
                })
            })
            .collect();
        balances.sort_by(|a, b| a.policy_name.cmp(&b.policy_name));

        Ok(balances)
    }

    async fn allocate_balance(
        &self,
        user_id: i64,
        policy_id: i64,
        year: i32,
        days: Decimal,
    ) -> Result<bool> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        state.user(user_id)?;
        state.policy(policy_id)?;

        if state.balances.contains_key(&(user_id, policy_id, year)) {
            return Ok(false);
        }
        state.write_balance(user_id, policy_id, year, days);
        Ok(true)
    }

    async fn adjust_balance(
        &self,
        user_id: i64,
        policy_id: i64,
        entry: LedgerEntry,
        negative_balance: NegativeBalancePolicy,
    ) -> Result<Decimal> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;

        let next = state.preview_entry(user_id, policy_id, entry, negative_balance)?;
        state.write_balance(user_id, policy_id, entry.year(), next);

        Ok(next)
    }

    async fn insert_request(
        &self,
        request: &NewLeaveRequest,
        scope: OverlapScope,
    ) -> Result<LeaveRequest> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;

        let user = state.user(request.user_id)?.clone();
        let policy_name = state.policy(request.policy_id)?.name.clone();

        let statuses = scope.statuses();
        let overlap = state
            .requests
            .values()
            .filter(|r| r.user_id == request.user_id && statuses.contains(&r.status))
            .filter(|r| r.overlaps(request.start_date, request.end_date))
            .min_by_key(|r| r.start_date);
        if let Some(existing) = overlap {
            return Err(AppError::Overlap {
                start_date: existing.start_date,
                end_date: existing.end_date,
            });
        }

        let now = Utc::now();
        let request_id = state.next_id();
        let created = LeaveRequest {
            request_id,
            user_id: request.user_id,
            user_email: user.email,
            user_name: user.display_name,
            policy_id: request.policy_id,
            policy_name,
            status: LeaveStatus::Pending,
            start_date: request.start_date,
            end_date: request.end_date,
            half_day: request.half_day,
            reason: request.reason.clone(),
            days_deducted: None,
            decided_by: None,
            decided_at: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        state.requests.insert(request_id, created.clone());

        Ok(created)
    }

    async fn get_request(&self, request_id: i64) -> Result<Option<LeaveRequest>> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        Ok(state.requests.get(&request_id).cloned())
    }

    async fn list_requests(&self, query: &LeaveRequestQuery) -> Result<(Vec<LeaveRequest>, i64)> {
        self.simulate_latency().await;
        let state = self.state.lock().await;

        let mut matched: Vec<LeaveRequest> = state
            .requests
            .values()
            .filter(|r| query.user_id.map_or(true, |id| r.user_id == id))
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .filter(|r| query.start_date.map_or(true, |d| r.start_date >= d))
            .filter(|r| query.end_date.map_or(true, |d| r.end_date <= d))
            .cloned()
            .collect();

        matched.sort_by(|a, b| {
            directed(compare_requests(a, b, query.sort.field), query.sort.direction)
                .then_with(|| b.request_id.cmp(&a.request_id))
        });

        let total = matched.len() as i64;
        Ok((
            paginate(matched, query.page.offset(), query.page.limit()),
            total,
        ))
    }

    async fn find_overlapping(
        &self,
        user_id: i64,
        start_date: NaiveDate,
        end_date: NaiveDate,
        statuses: &[LeaveStatus],
    ) -> Result<Vec<LeaveRequest>> {
        self.simulate_latency().await;
        let state = self.state.lock().await;

        let mut overlapping: Vec<LeaveRequest> = state
            .requests
            .values()
            .filter(|r| r.user_id == user_id && statuses.contains(&r.status))
            .filter(|r| r.overlaps(start_date, end_date))
            .cloned()
            .collect();
        overlapping.sort_by_key(|r| r.start_date);

        Ok(overlapping)
    }

    async fn apply_transition(
        &self,
        request_id: i64,
        planner: &TransitionPlanner<'_>,
        decision: &Decision,
        negative_balance: NegativeBalancePolicy,
    ) -> Result<TransitionOutcome> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;

        let current = state
            .requests
            .get(&request_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("leave request {}", request_id)))?;

        let plan = planner(&current)?;
        let previous = current.status;

        if plan.no_op {
            return Ok(TransitionOutcome {
                request: current,
                previous,
                plan,
                balance_after: None,
            });
        }

        let balance_after = match plan.ledger {
            Some(entry) => Some(state.preview_entry(
                current.user_id,
                current.policy_id,
                entry,
                negative_balance,
            )?),
            None => None,
        };

        // 以下不再失败
        if let (Some(entry), Some(next)) = (plan.ledger, balance_after) {
            state.write_balance(current.user_id, current.policy_id, entry.year(), next);
        }

        let mut updated = current;
        updated.status = plan.target;
        updated.decided_by = Some(decision.actor_id);
        updated.decided_at = Some(decision.decided_at);
        if decision.notes.is_some() {
            updated.notes = decision.notes.clone();
        }
        if let Some(LedgerEntry::Debit { days, .. }) = plan.ledger {
            updated.days_deducted = Some(days);
        }
        updated.updated_at = Utc::now();

        state.requests.insert(request_id, updated.clone());
        state.audit.push(LeaveAuditEntry {
            request_id,
            action: plan.target,
            actor_id: decision.actor_id,
            notes: decision.notes.clone(),
            created_at: decision.decided_at,
        });

        Ok(TransitionOutcome {
            request: updated,
            previous,
            plan,
            balance_after,
        })
    }

    async fn audit_trail(&self, request_id: i64) -> Result<Vec<LeaveAuditEntry>> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|entry| entry.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn leave_summary(&self, query: &LeaveSummaryQuery) -> Result<Vec<LeavePolicySummary>> {
        self.simulate_latency().await;
        let state = self.state.lock().await;

        let mut grouped: BTreeMap<i64, LeavePolicySummary> = BTreeMap::new();
        for request in state
            .requests
            .values()
            .filter(|r| query.from.map_or(true, |d| r.start_date >= d))
            .filter(|r| query.to.map_or(true, |d| r.end_date <= d))
        {
            let summary = grouped
                .entry(request.policy_id)
                .or_insert_with(|| LeavePolicySummary {
                    policy_id: request.policy_id,
                    policy_name: request.policy_name.clone(),
                    total_requests: 0,
                    pending: 0,
                    approved: 0,
                    rejected: 0,
                    cancelled: 0,
                    approved_days: Decimal::ZERO,
                });

            summary.total_requests += 1;
            match request.status {
                LeaveStatus::Pending => summary.pending += 1,
                LeaveStatus::Approved => {
                    summary.approved += 1;
                    summary.approved_days += request.days_deducted.unwrap_or(Decimal::ZERO);
                }
                LeaveStatus::Rejected => summary.rejected += 1,
                LeaveStatus::Cancelled => summary.cancelled += 1,
            }
        }

        let mut policies: Vec<LeavePolicySummary> = grouped.into_values().collect();
        policies.sort_by(|a, b| {
            a.policy_name
                .cmp(&b.policy_name)
                .then_with(|| a.policy_id.cmp(&b.policy_id))
        });
        Ok(policies)
    }

    async fn reconcile_balances(&self) -> Result<ReconciliationReport> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;

        let mut null_fixed = 0;
        for row in state.balances.values_mut() {
            if row.days.is_none() {
                row.days = Some(Decimal::ZERO);
                null_fixed += 1;
            }
        }

        let rows = state.balances.values();
        let total_rows = rows.len() as i64;
        let null_remaining = rows.clone().filter(|row| row.days.is_none()).count() as i64;
        let negative_count = rows
            .filter(|row| row.days.map_or(false, |d| d < Decimal::ZERO))
            .count() as i64;

        Ok(ReconciliationReport {
            total_rows,
            null_fixed,
            null_remaining,
            negative_count,
        })
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn open_session(&self, user_id: i64) -> Result<Option<AttendanceLog>> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        Ok(state
            .logs
            .values()
            .find(|log| log.user_id == user_id && log.is_open())
            .cloned())
    }

    async fn insert_clock_in(&self, clock_in: &NewClockIn) -> Result<AttendanceLog> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        state.user(clock_in.user_id)?;

        if let Some(open) = state
            .logs
            .values()
            .find(|log| log.user_id == clock_in.user_id && log.is_open())
        {
            return Err(AppError::AlreadyClockedIn {
                log_id: open.log_id,
            });
        }

        let log_id = state.next_id();
        let log = AttendanceLog {
            log_id,
            user_id: clock_in.user_id,
            clock_in: clock_in.clock_in,
            clock_out: None,
            duration_minutes: None,
            geo_location: clock_in.geo_location.map(Json),
            source: Some(clock_in.source.clone()),
            created_at: Utc::now(),
        };
        state.logs.insert(log_id, log.clone());

        Ok(log)
    }

    async fn close_session(
        &self,
        user_id: i64,
        planner: &SessionPlanner<'_>,
    ) -> Result<AttendanceLog> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;

        let open = state
            .logs
            .values_mut()
            .find(|log| log.user_id == user_id && log.is_open())
            .ok_or(AppError::NoActiveSession)?;

        let close = planner(&*open)?;
        open.clock_out = Some(close.clock_out);
        open.duration_minutes = Some(close.duration_minutes);
        open.geo_location = close.geo_location.map(Json);

        Ok(open.clone())
    }

    async fn list_logs(&self, query: &AttendanceQuery) -> Result<(Vec<AttendanceLog>, i64)> {
        self.simulate_latency().await;
        let state = self.state.lock().await;

        let mut matched: Vec<AttendanceLog> = state
            .logs
            .values()
            .filter(|log| query.user_id.map_or(true, |id| log.user_id == id))
            .filter(|log| query.from.map_or(true, |from| log.clock_in >= from))
            .filter(|log| {
                query
                    .to
                    .map_or(true, |to| log.clock_out.map_or(true, |out| out <= to))
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| {
            directed(compare_logs(a, b, query.sort.field), query.sort.direction)
                .then_with(|| b.log_id.cmp(&a.log_id))
        });

        let total = matched.len() as i64;
        Ok((
            paginate(matched, query.page.offset(), query.page.limit()),
            total,
        ))
    }
}
