//! 休假申请工作流
//! PENDING → APPROVED / REJECTED / CANCELLED；APPROVED → CANCELLED 为唯一允许的撤销

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use crate::calendar::{count_leave_days, parse_date_only, HolidaySet};
use crate::config::{AppConfig, PaginationConfig};
use crate::error::{AppError, Result};
use crate::events::{DomainEvent, EventBus, LeaveApprovedEvent};
use crate::models::leave::*;
use crate::models::pagination::{Page, PageRequest, SortSpec};
use crate::repository::LeaveStore;
use crate::services::within_deadline;
use crate::telemetry::{LEAVE_DECISIONS, LEAVE_REQUESTS_CREATED};

/// 工作流配置
#[derive(Debug, Clone)]
pub struct LeaveSettings {
    pub holidays: Arc<HolidaySet>,
    pub overlap_scope: OverlapScope,
    pub negative_balance: NegativeBalancePolicy,
    pub pagination: PaginationConfig,
    pub deadline: Duration,
}

impl Default for LeaveSettings {
    fn default() -> Self {
        Self {
            holidays: Arc::new(HolidaySet::new()),
            overlap_scope: OverlapScope::default(),
            negative_balance: NegativeBalancePolicy::default(),
            pagination: PaginationConfig::default(),
            deadline: Duration::from_secs(10),
        }
    }
}

impl LeaveSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            holidays: Arc::new(config.leave.holidays()?),
            overlap_scope: config.leave.overlap_scope,
            negative_balance: config.leave.negative_balance,
            pagination: config.pagination.clone(),
            deadline: Duration::from_secs(config.store.timeout_secs),
        })
    }
}

/// 计算状态迁移计划（纯函数，在存储锁定申请后调用）
pub fn plan_transition(
    request: &LeaveRequest,
    action: LeaveAction,
    holidays: &HolidaySet,
) -> Result<TransitionPlan> {
    let target = action.target_status();
    let year = request.policy_year();

    if request.status == target {
        return Ok(TransitionPlan {
            target,
            ledger: None,
            emit_sync: false,
            no_op: true,
        });
    }

    let ledger = match (request.status, target) {
        (LeaveStatus::Pending, LeaveStatus::Approved) => {
            let days = count_leave_days(
                request.start_date,
                request.end_date,
                request.half_day,
                holidays,
            )?;
            Some(LedgerEntry::Debit { days, year })
        }
        (LeaveStatus::Pending, LeaveStatus::Rejected)
        | (LeaveStatus::Pending, LeaveStatus::Cancelled) => None,
        (LeaveStatus::Approved, LeaveStatus::Cancelled) => request
            .days_deducted
            .filter(|days| *days > Decimal::ZERO)
            .map(|days| LedgerEntry::Credit { days, year }),
        (from, _) => {
            return Err(AppError::InvalidTransition {
                from: from.to_string(),
                action: action.as_str().to_string(),
            })
        }
    };

    Ok(TransitionPlan {
        target,
        ledger,
        emit_sync: request.status == LeaveStatus::Pending && target == LeaveStatus::Approved,
        no_op: false,
    })
}

pub struct LeaveService {
    store: Arc<dyn LeaveStore>,
    events: EventBus,
    settings: LeaveSettings,
}

impl LeaveService {
    pub fn new(store: Arc<dyn LeaveStore>, events: EventBus, settings: LeaveSettings) -> Self {
        Self {
            store,
            events,
            settings,
        }
    }

    /// 提交休假申请
    #[instrument(skip(self, input), fields(policy_id = input.policy_id))]
    pub async fn create(&self, user_id: i64, input: CreateLeaveRequest) -> Result<LeaveRequest> {
        input.validate()?;

        let start_date = parse_date_only(&input.start_date)?;
        let end_date = parse_date_only(&input.end_date)?;

        if input.half_day && start_date != end_date {
            return Err(AppError::validation(
                "HALF_DAY_INVALID",
                "A half-day request must start and end on the same date",
            ));
        }

        // 同时校验区间顺序
        let days = count_leave_days(start_date, end_date, input.half_day, &self.settings.holidays)?;
        if days <= Decimal::ZERO {
            return Err(AppError::validation(
                "LEAVE_DURATION_INVALID",
                "The requested range contains no working days",
            ));
        }

        let policy_id = input.policy_id;
        let new_request = NewLeaveRequest {
            user_id,
            policy_id,
            start_date,
            end_date,
            half_day: input.half_day,
            reason: input.reason,
        };

        let created = within_deadline(self.settings.deadline, "leave.create", async {
            let policy = match self.store.policy(policy_id).await? {
                Some(policy) if policy.is_active => policy,
                _ => return Err(AppError::NotFound(format!("leave policy {}", policy_id))),
            };

            // 提交时预检余额；审批扣减时仍会在锁内复核
            if self.settings.negative_balance == NegativeBalancePolicy::Reject {
                let available = self
                    .available_balance(user_id, &policy, start_date.year())
                    .await?;
                if days > available {
                    return Err(AppError::InsufficientBalance {
                        available,
                        requested: days,
                    });
                }
            }

            self.store
                .insert_request(&new_request, self.settings.overlap_scope)
                .await
        })
        .await?;

        metrics::counter!(LEAVE_REQUESTS_CREATED).increment(1);
        info!(
            request_id = created.request_id,
            user_id,
            %start_date,
            %end_date,
            days = %days,
            "Leave request created"
        );

        Ok(created)
    }

    async fn available_balance(&self, user_id: i64, policy: &LeavePolicy, year: i32) -> Result<Decimal> {
        self.store
            .allocate_balance(user_id, policy.policy_id, year, policy.annual_limit)
            .await?;

        Ok(self
            .store
            .balances(user_id, year)
            .await?
            .into_iter()
            .find(|balance| balance.policy_id == policy.policy_id)
            .map(|balance| balance.balance_days)
            .unwrap_or(Decimal::ZERO))
    }

    /// 审批 / 拒绝 / 取消
    ///
    /// 台账分录与状态写入在同一事务中完成；同步事件只在提交之后发出。
    #[instrument(skip(self, input))]
    pub async fn decide(
        &self,
        request_id: i64,
        actor_id: i64,
        input: DecideLeaveRequest,
    ) -> Result<LeaveRequest> {
        input.validate()?;
        let action: LeaveAction = input.action.parse()?;

        // 仅检查已批准申请时，待审批的申请之间可能相交，批准前复核
        if action == LeaveAction::Approve && self.settings.overlap_scope == OverlapScope::Approved {
            let current = self.get(request_id).await?;
            if current.status == LeaveStatus::Pending {
                if let Some(conflict) = self.approved_overlaps(&current).await?.first() {
                    return Err(AppError::Overlap {
                        start_date: conflict.start_date,
                        end_date: conflict.end_date,
                    });
                }
            }
        }

        let decision = Decision {
            actor_id,
            notes: input.notes,
            decided_at: Utc::now(),
        };

        let holidays = self.settings.holidays.clone();
        let planner = move |request: &LeaveRequest| plan_transition(request, action, &holidays);

        let result = within_deadline(
            self.settings.deadline,
            "leave.decide",
            self.store.apply_transition(
                request_id,
                &planner,
                &decision,
                self.settings.negative_balance,
            ),
        )
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let label = if e.is_client_error() { "rejected" } else { "error" };
                metrics::counter!(LEAVE_DECISIONS, "action" => action.as_str(), "outcome" => label)
                    .increment(1);
                return Err(e);
            }
        };

        let label = if outcome.plan.no_op { "noop" } else { "applied" };
        metrics::counter!(LEAVE_DECISIONS, "action" => action.as_str(), "outcome" => label)
            .increment(1);

        if outcome.plan.no_op {
            info!(request_id, status = %outcome.request.status, "Leave request already in target status");
        } else {
            info!(
                request_id,
                from = %outcome.previous,
                to = %outcome.request.status,
                balance_after = ?outcome.balance_after,
                "Leave request decided"
            );
        }

        if outcome.plan.emit_sync {
            self.notify_approved(&outcome.request);
        }

        Ok(outcome.request)
    }

    /// 发布批准事件；失败只记录日志
    fn notify_approved(&self, request: &LeaveRequest) {
        if self.events.subscriber_count() == 0 {
            debug!(request_id = request.request_id, "No event subscribers, leave approved event dropped");
            return;
        }

        let event = DomainEvent::LeaveApproved(LeaveApprovedEvent::from(request));
        if let Err(e) = self.events.publish(event) {
            warn!(request_id = request.request_id, error = %e, "Leave approved event not delivered");
        }
    }

    pub async fn get(&self, request_id: i64) -> Result<LeaveRequest> {
        within_deadline(
            self.settings.deadline,
            "leave.get",
            self.store.get_request(request_id),
        )
        .await?
        .ok_or_else(|| AppError::NotFound(format!("leave request {}", request_id)))
    }

    pub async fn list(&self, filters: LeaveRequestFilters) -> Result<Page<LeaveRequest>> {
        let page = PageRequest::normalize(filters.page, filters.size, &self.settings.pagination)?;
        let status = filters
            .status
            .as_deref()
            .map(str::parse::<LeaveStatus>)
            .transpose()?;
        let start_date = filters.start_date.as_deref().map(parse_date_only).transpose()?;
        let end_date = filters.end_date.as_deref().map(parse_date_only).transpose()?;

        let query = LeaveRequestQuery {
            user_id: filters.user_id,
            status,
            start_date,
            end_date,
            page,
            sort: SortSpec::from_sort_param(filters.sort.as_deref()),
        };

        let (content, total) = within_deadline(
            self.settings.deadline,
            "leave.list",
            self.store.list_requests(&query),
        )
        .await?;

        Ok(Page::new(content, total, page))
    }

    /// 与给定区间相交的已批准申请（审批前复核用）
    pub async fn approved_overlaps(&self, request: &LeaveRequest) -> Result<Vec<LeaveRequest>> {
        let overlapping = within_deadline(
            self.settings.deadline,
            "leave.overlaps",
            self.store.find_overlapping(
                request.user_id,
                request.start_date,
                request.end_date,
                &[LeaveStatus::Approved],
            ),
        )
        .await?;

        Ok(overlapping
            .into_iter()
            .filter(|other| other.request_id != request.request_id)
            .collect())
    }

    /// 按策略汇总申请（管理报表）
    #[instrument(skip(self))]
    pub async fn summary(&self, filters: LeaveSummaryFilters) -> Result<LeaveSummaryReport> {
        let query = LeaveSummaryQuery {
            from: filters.from.as_deref().map(parse_date_only).transpose()?,
            to: filters.to.as_deref().map(parse_date_only).transpose()?,
        };
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(AppError::validation(
                    "INVALID_DATE_RANGE",
                    "The report start date must not be after its end date",
                ));
            }
        }

        let policies = within_deadline(
            self.settings.deadline,
            "leave.summary",
            self.store.leave_summary(&query),
        )
        .await?;
        let totals = LeaveSummaryTotals::from_policies(&policies);

        Ok(LeaveSummaryReport {
            from: query.from,
            to: query.to,
            policies,
            totals,
        })
    }

    pub async fn audit_trail(&self, request_id: i64) -> Result<Vec<LeaveAuditEntry>> {
        within_deadline(
            self.settings.deadline,
            "leave.audit",
            self.store.audit_trail(request_id),
        )
        .await
    }
}
