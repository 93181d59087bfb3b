//! Leave repository (休假数据访问)

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use tracing::{error, info, instrument};

use crate::db::is_foreign_key_violation;
use crate::error::{AppError, Result};
use crate::models::leave::*;
use crate::models::pagination::SortField;
use crate::repository::{LeaveStore, TransitionPlanner};

const REQUEST_SELECT: &str = r#"
    SELECT r.request_id, r.user_id, u.email AS user_email, u.display_name AS user_name,
           r.policy_id, p.name AS policy_name, r.status, r.start_date, r.end_date,
           r.half_day, r.reason, r.days_deducted, r.decided_by, r.decided_at, r.notes,
           r.created_at, r.updated_at
    FROM leave_requests r
    JOIN app_users u ON u.user_id = r.user_id
    JOIN leave_policies p ON p.policy_id = r.policy_id
"#;

pub struct PgLeaveRepository {
    db: PgPool,
}

impl PgLeaveRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn status_names(statuses: &[LeaveStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn missing_reference(e: sqlx::Error, user_id: i64, policy_id: i64) -> AppError {
    if is_foreign_key_violation(&e) {
        AppError::NotFound(format!("user {} or leave policy {}", user_id, policy_id))
    } else {
        AppError::Database(e)
    }
}

/// 锁定 (user, policy, year) 余额行，不存在时按策略年度额度建立
async fn lock_balance(
    conn: &mut PgConnection,
    user_id: i64,
    policy_id: i64,
    year: i32,
) -> Result<(i64, Decimal)> {
    sqlx::query(
        r#"
        INSERT INTO leave_balances (user_id, policy_id, year, balance_days)
        SELECT $1, policy_id, $3, annual_limit FROM leave_policies WHERE policy_id = $2
        ON CONFLICT (user_id, policy_id, year) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(policy_id)
    .bind(year)
    .execute(&mut *conn)
    .await
    .map_err(|e| missing_reference(e, user_id, policy_id))?;

    let row: Option<(i64, Option<Decimal>)> = sqlx::query_as(
        r#"
        SELECT balance_id, balance_days FROM leave_balances
        WHERE user_id = $1 AND policy_id = $2 AND year = $3
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .bind(policy_id)
    .bind(year)
    .fetch_optional(&mut *conn)
    .await?;

    let (balance_id, days) =
        row.ok_or_else(|| AppError::NotFound(format!("leave policy {}", policy_id)))?;

    Ok((balance_id, days.unwrap_or(Decimal::ZERO)))
}

async fn write_balance(conn: &mut PgConnection, balance_id: i64, value: Decimal) -> Result<()> {
    sqlx::query(
        "UPDATE leave_balances SET balance_days = $2, updated_at = NOW() WHERE balance_id = $1",
    )
    .bind(balance_id)
    .bind(value)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn fetch_request(conn: &mut PgConnection, request_id: i64) -> Result<Option<LeaveRequest>> {
    let request = sqlx::query_as::<_, LeaveRequest>(&format!(
        "{} WHERE r.request_id = $1",
        REQUEST_SELECT
    ))
    .bind(request_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(request)
}

#[async_trait]
impl LeaveStore for PgLeaveRepository {
    async fn policy(&self, policy_id: i64) -> Result<Option<LeavePolicy>> {
        let policy = sqlx::query_as::<_, LeavePolicy>(
            "SELECT policy_id, name, annual_limit, is_active FROM leave_policies WHERE policy_id = $1",
        )
        .bind(policy_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(policy)
    }

    async fn active_policies(&self) -> Result<Vec<LeavePolicy>> {
        let policies = sqlx::query_as::<_, LeavePolicy>(
            r#"
            SELECT policy_id, name, annual_limit, is_active FROM leave_policies
            WHERE is_active = TRUE
            ORDER BY policy_id
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        Ok(policies)
    }

    async fn balances(&self, user_id: i64, year: i32) -> Result<Vec<LeaveBalance>> {
        let balances = sqlx::query_as::<_, LeaveBalance>(
            r#"
            SELECT b.balance_id, b.policy_id, p.name AS policy_name,
                   COALESCE(b.balance_days, 0) AS balance_days, b.year
            FROM leave_balances b
            JOIN leave_policies p ON p.policy_id = b.policy_id
            WHERE b.user_id = $1 AND b.year = $2
            ORDER BY p.name
            "#,
        )
        .bind(user_id)
        .bind(year)
        .fetch_all(&self.db)
        .await?;

        Ok(balances)
    }

    async fn allocate_balance(
        &self,
        user_id: i64,
        policy_id: i64,
        year: i32,
        days: Decimal,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO leave_balances (user_id, policy_id, year, balance_days)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, policy_id, year) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(policy_id)
        .bind(year)
        .bind(days)
        .execute(&self.db)
        .await
        .map_err(|e| missing_reference(e, user_id, policy_id))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn adjust_balance(
        &self,
        user_id: i64,
        policy_id: i64,
        entry: LedgerEntry,
        negative_balance: NegativeBalancePolicy,
    ) -> Result<Decimal> {
        let mut tx = self.db.begin().await?;

        let (balance_id, current) = lock_balance(&mut tx, user_id, policy_id, entry.year()).await?;
        let next = entry.apply(current, negative_balance)?;
        write_balance(&mut tx, balance_id, next).await?;

        tx.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit balance adjustment");
            AppError::Database(e)
        })?;

        Ok(next)
    }

    #[instrument(skip(self, request), fields(user_id = request.user_id))]
    async fn insert_request(
        &self,
        request: &NewLeaveRequest,
        scope: OverlapScope,
    ) -> Result<LeaveRequest> {
        let mut tx = self.db.begin().await?;

        // 同一用户的创建串行化，使重叠检查与插入之间不被穿插
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(request.user_id)
            .execute(&mut *tx)
            .await?;

        let user: Option<(String,)> = sqlx::query_as("SELECT email FROM app_users WHERE user_id = $1")
            .bind(request.user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if user.is_none() {
            return Err(AppError::NotFound(format!("user {}", request.user_id)));
        }

        let overlap: Option<(NaiveDate, NaiveDate)> = sqlx::query_as(
            r#"
            SELECT start_date, end_date FROM leave_requests
            WHERE user_id = $1
              AND status::text = ANY($2)
              AND start_date <= $4
              AND end_date >= $3
            ORDER BY start_date
            LIMIT 1
            "#,
        )
        .bind(request.user_id)
        .bind(status_names(scope.statuses()))
        .bind(request.start_date)
        .bind(request.end_date)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((start_date, end_date)) = overlap {
            return Err(AppError::Overlap {
                start_date,
                end_date,
            });
        }

        let (request_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO leave_requests (user_id, policy_id, start_date, end_date, half_day, reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING request_id
            "#,
        )
        .bind(request.user_id)
        .bind(request.policy_id)
        .bind(request.start_date)
        .bind(request.end_date)
        .bind(request.half_day)
        .bind(&request.reason)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| missing_reference(e, request.user_id, request.policy_id))?;

        let created = fetch_request(&mut tx, request_id)
            .await?
            .ok_or_else(|| AppError::internal_error("Inserted leave request not visible"))?;

        tx.commit().await?;

        Ok(created)
    }

    async fn get_request(&self, request_id: i64) -> Result<Option<LeaveRequest>> {
        let mut conn = self.db.acquire().await?;
        fetch_request(&mut conn, request_id).await
    }

    async fn list_requests(&self, query: &LeaveRequestQuery) -> Result<(Vec<LeaveRequest>, i64)> {
        let mut where_clause = String::from(" WHERE 1=1");
        let mut index = 0;

        if query.user_id.is_some() {
            index += 1;
            where_clause.push_str(&format!(" AND r.user_id = ${}", index));
        }
        if query.status.is_some() {
            index += 1;
            where_clause.push_str(&format!(" AND r.status = ${}", index));
        }
        if query.start_date.is_some() {
            index += 1;
            where_clause.push_str(&format!(" AND r.start_date >= ${}", index));
        }
        if query.end_date.is_some() {
            index += 1;
            where_clause.push_str(&format!(" AND r.end_date <= ${}", index));
        }

        // 排序列只来自白名单
        let sql = format!(
            "{}{} ORDER BY r.{} {}, r.request_id DESC LIMIT ${} OFFSET ${}",
            REQUEST_SELECT,
            where_clause,
            query.sort.field.column(),
            query.sort.direction.as_sql(),
            index + 1,
            index + 2
        );
        let count_sql = format!("SELECT COUNT(*) FROM leave_requests r{}", where_clause);

        let mut rows = sqlx::query_as::<_, LeaveRequest>(&sql);
        let mut count = sqlx::query_scalar::<_, i64>(&count_sql);

        if let Some(user_id) = query.user_id {
            rows = rows.bind(user_id);
            count = count.bind(user_id);
        }
        if let Some(status) = query.status {
            rows = rows.bind(status);
            count = count.bind(status);
        }
        if let Some(start_date) = query.start_date {
            rows = rows.bind(start_date);
            count = count.bind(start_date);
        }
        if let Some(end_date) = query.end_date {
            rows = rows.bind(end_date);
            count = count.bind(end_date);
        }

        let content = rows
            .bind(query.page.limit())
            .bind(query.page.offset())
            .fetch_all(&self.db)
            .await?;
        let total = count.fetch_one(&self.db).await?;

        Ok((content, total))
    }

    async fn find_overlapping(
        &self,
        user_id: i64,
        start_date: NaiveDate,
        end_date: NaiveDate,
        statuses: &[LeaveStatus],
    ) -> Result<Vec<LeaveRequest>> {
        let requests = sqlx::query_as::<_, LeaveRequest>(&format!(
            r#"{}
            WHERE r.user_id = $1
              AND r.status::text = ANY($2)
              AND r.start_date <= $4
              AND r.end_date >= $3
            ORDER BY r.start_date
            "#,
            REQUEST_SELECT
        ))
        .bind(user_id)
        .bind(status_names(statuses))
        .bind(start_date)
        .bind(end_date)
        .fetch_all(&self.db)
        .await?;

        Ok(requests)
    }

    #[instrument(skip(self, planner, decision), fields(actor_id = decision.actor_id))]
    async fn apply_transition(
        &self,
        request_id: i64,
        planner: &TransitionPlanner<'_>,
        decision: &Decision,
        negative_balance: NegativeBalancePolicy,
    ) -> Result<TransitionOutcome> {
        let mut tx = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin transaction");
            AppError::Database(e)
        })?;

        // 锁定申请行，并发审批在此排队
        let current = sqlx::query_as::<_, LeaveRequest>(&format!(
            "{} WHERE r.request_id = $1 FOR UPDATE OF r",
            REQUEST_SELECT
        ))
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("leave request {}", request_id)))?;

        let plan = planner(&current)?;
        let previous = current.status;

        if plan.no_op {
            tx.rollback().await?;
            return Ok(TransitionOutcome {
                request: current,
                previous,
                plan,
                balance_after: None,
            });
        }

        let mut balance_after = None;
        if let Some(entry) = plan.ledger {
            let (balance_id, balance) =
                lock_balance(&mut tx, current.user_id, current.policy_id, entry.year()).await?;
            let next = entry.apply(balance, negative_balance)?;
            write_balance(&mut tx, balance_id, next).await?;
            balance_after = Some(next);
        }

        let days_deducted = match plan.ledger {
            Some(LedgerEntry::Debit { days, .. }) => Some(days),
            _ => current.days_deducted,
        };

        sqlx::query(
            r#"
            UPDATE leave_requests
            SET status = $2,
                decided_by = $3,
                decided_at = $4,
                notes = COALESCE($5, notes),
                days_deducted = $6,
                updated_at = NOW()
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .bind(plan.target)
        .bind(decision.actor_id)
        .bind(decision.decided_at)
        .bind(&decision.notes)
        .bind(days_deducted)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO leave_audit (request_id, action, actor_id, notes, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(request_id)
        .bind(plan.target)
        .bind(decision.actor_id)
        .bind(&decision.notes)
        .bind(decision.decided_at)
        .execute(&mut *tx)
        .await?;

        let request = fetch_request(&mut tx, request_id)
            .await?
            .ok_or_else(|| AppError::internal_error("Decided leave request not visible"))?;

        tx.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit transaction");
            AppError::Database(e)
        })?;

        info!(
            request_id,
            from = %previous,
            to = %plan.target,
            "Leave request transition committed"
        );

        Ok(TransitionOutcome {
            request,
            previous,
            plan,
            balance_after,
        })
    }

    async fn audit_trail(&self, request_id: i64) -> Result<Vec<LeaveAuditEntry>> {
        let entries = sqlx::query_as::<_, LeaveAuditEntry>(
            r#"
            SELECT request_id, action, actor_id, notes, created_at FROM leave_audit
            WHERE request_id = $1
            ORDER BY created_at, audit_id
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.db)
        .await?;

        Ok(entries)
    }

    async fn leave_summary(&self, query: &LeaveSummaryQuery) -> Result<Vec<LeavePolicySummary>> {
        let mut where_clause = String::from(" WHERE 1=1");
        let mut index = 0;

        if query.from.is_some() {
            index += 1;
            where_clause.push_str(&format!(" AND r.start_date >= ${}", index));
        }
        if query.to.is_some() {
            index += 1;
            where_clause.push_str(&format!(" AND r.end_date <= ${}", index));
        }

        let sql = format!(
            r#"
            SELECT p.policy_id, p.name AS policy_name,
                   COUNT(*) AS total_requests,
                   COUNT(*) FILTER (WHERE r.status = 'PENDING') AS pending,
                   COUNT(*) FILTER (WHERE r.status = 'APPROVED') AS approved,
                   COUNT(*) FILTER (WHERE r.status = 'REJECTED') AS rejected,
                   COUNT(*) FILTER (WHERE r.status = 'CANCELLED') AS cancelled,
                   COALESCE(SUM(r.days_deducted) FILTER (WHERE r.status = 'APPROVED'), 0) AS approved_days
            FROM leave_requests r
            JOIN leave_policies p ON p.policy_id = r.policy_id
            {}
            GROUP BY p.policy_id, p.name
            ORDER BY p.name ASC, p.policy_id ASC
            "#,
            where_clause
        );

        let mut rows = sqlx::query_as::<_, LeavePolicySummary>(&sql);
        if let Some(from) = query.from {
            rows = rows.bind(from);
        }
        if let Some(to) = query.to {
            rows = rows.bind(to);
        }

        Ok(rows.fetch_all(&self.db).await?)
    }

    #[instrument(skip(self))]
    async fn reconcile_balances(&self) -> Result<ReconciliationReport> {
        let mut tx = self.db.begin().await?;

        let fixed = sqlx::query(
            "UPDATE leave_balances SET balance_days = 0, updated_at = NOW() WHERE balance_days IS NULL",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let (total_rows, null_remaining, negative_count): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE balance_days IS NULL),
                   COUNT(*) FILTER (WHERE balance_days < 0)
            FROM leave_balances
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ReconciliationReport {
            total_rows,
            null_fixed: fixed as i64,
            null_remaining,
            negative_count,
        })
    }
}
