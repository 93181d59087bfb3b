//! 休假余额台账服务
//! 余额只通过分录（扣减/返还）变化；对账任务负责数据清理

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use crate::error::{AppError, Result};
use crate::models::leave::{
    LeaveBalanceSummary, LedgerEntry, NegativeBalancePolicy, ReconciliationReport,
};
use crate::repository::LeaveStore;
use crate::services::within_deadline;

pub struct LeaveLedger {
    store: Arc<dyn LeaveStore>,
    negative_balance: NegativeBalancePolicy,
    deadline: Duration,
}

impl LeaveLedger {
    pub fn new(
        store: Arc<dyn LeaveStore>,
        negative_balance: NegativeBalancePolicy,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            negative_balance,
            deadline,
        }
    }

    fn check_days(days: Decimal) -> Result<()> {
        if days <= Decimal::ZERO {
            return Err(AppError::validation(
                "VALIDATION_ERROR",
                "Ledger entries must carry a positive number of days",
            ));
        }
        Ok(())
    }

    /// 扣减余额，返回扣减后的余额
    #[instrument(skip(self))]
    pub async fn debit(&self, user_id: i64, policy_id: i64, days: Decimal, year: i32) -> Result<Decimal> {
        Self::check_days(days)?;
        let entry = LedgerEntry::Debit { days, year };

        within_deadline(
            self.deadline,
            "ledger.debit",
            self.store
                .adjust_balance(user_id, policy_id, entry, self.negative_balance),
        )
        .await
    }

    /// 返还余额，返回返还后的余额
    #[instrument(skip(self))]
    pub async fn credit(&self, user_id: i64, policy_id: i64, days: Decimal, year: i32) -> Result<Decimal> {
        Self::check_days(days)?;
        let entry = LedgerEntry::Credit { days, year };

        within_deadline(
            self.deadline,
            "ledger.credit",
            self.store
                .adjust_balance(user_id, policy_id, entry, self.negative_balance),
        )
        .await
    }

    /// 查询余额；用户当年没有某个启用策略的余额行时按年度额度补建
    #[instrument(skip(self))]
    pub async fn balances(&self, user_id: i64, year: Option<i32>) -> Result<LeaveBalanceSummary> {
        let year = year.unwrap_or_else(|| Utc::now().year());

        let balances = within_deadline(self.deadline, "ledger.balances", async {
            for policy in self.store.active_policies().await? {
                let created = self
                    .store
                    .allocate_balance(user_id, policy.policy_id, year, policy.annual_limit)
                    .await?;
                if created {
                    info!(
                        user_id,
                        policy_id = policy.policy_id,
                        year,
                        days = %policy.annual_limit,
                        "Provisioned leave balance"
                    );
                }
            }

            self.store.balances(user_id, year).await
        })
        .await?;

        Ok(LeaveBalanceSummary { user_id, balances })
    }

    /// 对账：NULL 余额归零并报告异常行
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let report = self.store.reconcile_balances().await?;

        if report.is_clean() {
            info!(
                total_rows = report.total_rows,
                null_fixed = report.null_fixed,
                "Leave balance reconciliation completed"
            );
        } else {
            warn!(
                total_rows = report.total_rows,
                null_fixed = report.null_fixed,
                null_remaining = report.null_remaining,
                negative_count = report.negative_count,
                "Leave balance reconciliation found invalid rows"
            );
        }

        Ok(report)
    }
}
