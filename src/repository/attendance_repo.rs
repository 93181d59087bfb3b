//! Attendance repository (考勤数据访问)

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{error, instrument, warn};

use crate::db::{is_foreign_key_violation, is_unique_violation, OPEN_SESSION_INDEX};
use crate::error::{AppError, Result};
use crate::models::attendance::*;
use crate::repository::{AttendanceStore, SessionPlanner};

const LOG_COLUMNS: &str =
    "log_id, user_id, clock_in, clock_out, duration_minutes, geo_location, source, created_at";

pub struct PgAttendanceRepository {
    db: PgPool,
}

impl PgAttendanceRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AttendanceStore for PgAttendanceRepository {
    async fn open_session(&self, user_id: i64) -> Result<Option<AttendanceLog>> {
        let log = sqlx::query_as::<_, AttendanceLog>(&format!(
            "SELECT {} FROM attendance_logs WHERE user_id = $1 AND clock_out IS NULL",
            LOG_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(log)
    }

    #[instrument(skip(self, clock_in), fields(user_id = clock_in.user_id))]
    async fn insert_clock_in(&self, clock_in: &NewClockIn) -> Result<AttendanceLog> {
        let inserted = sqlx::query_as::<_, AttendanceLog>(&format!(
            r#"
            INSERT INTO attendance_logs (user_id, clock_in, geo_location, source)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            LOG_COLUMNS
        ))
        .bind(clock_in.user_id)
        .bind(clock_in.clock_in)
        .bind(clock_in.geo_location.map(Json))
        .bind(&clock_in.source)
        .fetch_one(&self.db)
        .await;

        match inserted {
            Ok(log) => Ok(log),
            // 部分唯一索引是上班打卡的线性化点
            Err(e) if is_unique_violation(&e, OPEN_SESSION_INDEX) => {
                let existing = self.open_session(clock_in.user_id).await?;
                warn!("Concurrent clock-in rejected by open-session index");
                Err(AppError::AlreadyClockedIn {
                    log_id: existing.map(|log| log.log_id).unwrap_or_default(),
                })
            }
            Err(e) if is_foreign_key_violation(&e) => {
                Err(AppError::NotFound(format!("user {}", clock_in.user_id)))
            }
            Err(e) => {
                error!(error = %e, "Failed to insert clock-in");
                Err(AppError::Database(e))
            }
        }
    }

    #[instrument(skip(self, planner))]
    async fn close_session(
        &self,
        user_id: i64,
        planner: &SessionPlanner<'_>,
    ) -> Result<AttendanceLog> {
        let mut tx = self.db.begin().await?;

        let open = sqlx::query_as::<_, AttendanceLog>(&format!(
            "SELECT {} FROM attendance_logs WHERE user_id = $1 AND clock_out IS NULL FOR UPDATE",
            LOG_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NoActiveSession)?;

        let close = planner(&open)?;

        let closed = sqlx::query_as::<_, AttendanceLog>(&format!(
            r#"
            UPDATE attendance_logs
            SET clock_out = $2, duration_minutes = $3, geo_location = $4
            WHERE log_id = $1 AND clock_out IS NULL
            RETURNING {}
            "#,
            LOG_COLUMNS
        ))
        .bind(open.log_id)
        .bind(close.clock_out)
        .bind(close.duration_minutes)
        .bind(close.geo_location.map(Json))
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NoActiveSession)?;

        tx.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit clock-out");
            AppError::Database(e)
        })?;

        Ok(closed)
    }

    async fn list_logs(&self, query: &AttendanceQuery) -> Result<(Vec<AttendanceLog>, i64)> {
        let mut where_clause = String::from(" WHERE 1=1");
        let mut index = 0;

        if query.user_id.is_some() {
            index += 1;
            where_clause.push_str(&format!(" AND user_id = ${}", index));
        }
        if query.from.is_some() {
            index += 1;
            where_clause.push_str(&format!(" AND clock_in >= ${}", index));
        }
        if query.to.is_some() {
            index += 1;
            where_clause.push_str(&format!(
                " AND (clock_out <= ${} OR clock_out IS NULL)",
                index
            ));
        }

        let sql = format!(
            "SELECT {} FROM attendance_logs{} ORDER BY {}, log_id DESC LIMIT ${} OFFSET ${}",
            LOG_COLUMNS,
            where_clause,
            query.sort.order_by(),
            index + 1,
            index + 2
        );
        let count_sql = format!("SELECT COUNT(*) FROM attendance_logs{}", where_clause);

        let mut rows = sqlx::query_as::<_, AttendanceLog>(&sql);
        let mut count = sqlx::query_scalar::<_, i64>(&count_sql);

        if let Some(user_id) = query.user_id {
            rows = rows.bind(user_id);
            count = count.bind(user_id);
        }
        if let Some(from) = query.from {
            rows = rows.bind(from);
            count = count.bind(from);
        }
        if let Some(to) = query.to {
            rows = rows.bind(to);
            count = count.bind(to);
        }

        let content = rows
            .bind(query.page.limit())
            .bind(query.page.offset())
            .fetch_all(&self.db)
            .await?;
        let total = count.fetch_one(&self.db).await?;

        Ok((content, total))
    }
}
