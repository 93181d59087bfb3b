//! 统一错误模型
//! 定义考勤与休假引擎的全部错误类型和错误响应格式

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::calendar::CalendarError;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 输入不合法（日期无法解析、结束早于开始等）
    #[error("Validation error [{code}]: {message}")]
    Validation { code: &'static str, message: String },

    #[error("Leave request overlaps an existing request ({start_date} - {end_date})")]
    Overlap {
        start_date: NaiveDate,
        end_date: NaiveDate,
    },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("User already has an open attendance session (log {log_id})")]
    AlreadyClockedIn { log_id: i64 },

    #[error("No open attendance session")]
    NoActiveSession,

    #[error("Insufficient leave balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// 状态机不允许的迁移（例如从终态再次审批）
    #[error("Cannot {action} a request in status {from}")]
    InvalidTransition { from: String, action: String },

    #[error("Clock event outside the permitted geofence")]
    OutsideGeofence,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } | AppError::InvalidAction(_) => StatusCode::BAD_REQUEST,
            AppError::Overlap { .. }
            | AppError::AlreadyClockedIn { .. }
            | AppError::InsufficientBalance { .. }
            | AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::NotFound(_) | AppError::NoActiveSession => StatusCode::NOT_FOUND,
            AppError::OutsideGeofence => StatusCode::FORBIDDEN,
            AppError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// 机器可读的错误码
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation { code, .. } => *code,
            AppError::Overlap { .. } => "LEAVE_OVERLAP",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::AlreadyClockedIn { .. } => "CLOCK_ALREADY_STARTED",
            AppError::NoActiveSession => "NO_OPEN_SESSION",
            AppError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            AppError::InvalidAction(_) => "INVALID_ACTION",
            AppError::InvalidTransition { .. } => "INVALID_STATE",
            AppError::OutsideGeofence => "GEO_OUT_OF_RANGE",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                "INTERNAL_SERVER_ERROR"
            }
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::Validation { message, .. } => message.clone(),
            AppError::Overlap { .. } => "Overlapping leave request exists".to_string(),
            AppError::NotFound(msg) => format!("Resource not found: {}", msg),
            AppError::AlreadyClockedIn { .. } => {
                "You have an open attendance session".to_string()
            }
            AppError::NoActiveSession => {
                "No open attendance session to clock out of".to_string()
            }
            AppError::InsufficientBalance { .. } => {
                "Not enough leave balance for the requested days".to_string()
            }
            AppError::InvalidAction(action) => format!("Unsupported action: {}", action),
            AppError::InvalidTransition { from, action } => {
                format!("Cannot {} a leave request that is {}", action, from)
            }
            AppError::OutsideGeofence => {
                "You are outside the allowed area for clock-in".to_string()
            }
            AppError::Timeout(_) => "Request timed out before it could be applied".to_string(),
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    // 便捷方法
    pub fn validation(code: &'static str, msg: &str) -> Self {
        AppError::Validation {
            code,
            message: msg.to_string(),
        }
    }

    pub fn internal_error(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }

    pub fn timeout(msg: &str) -> Self {
        AppError::Timeout(msg.to_string())
    }

    /// 是否属于业务规则/输入类错误（可由调用方修正）
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub status: u16,
    pub message: String,
    pub request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                status: status.as_u16(),
                message: self.user_message(),
                request_id,
            },
        };

        // 记录错误日志（内部错误带完整上下文）
        if status.is_server_error() {
            tracing::error!(
                code = self.code(),
                error = ?self,
                request_id = %error_response.error.request_id,
                "Application error"
            );
        } else {
            tracing::warn!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Request rejected"
            );
        }

        (status, Json(error_response)).into_response()
    }
}

impl From<CalendarError> for AppError {
    fn from(e: CalendarError) -> Self {
        let code = match e {
            CalendarError::InvalidDate(_) => "INVALID_DATE",
            CalendarError::InvalidRange(_) => "INVALID_DATE_RANGE",
        };
        AppError::Validation {
            code,
            message: e.to_string(),
        }
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation {
            code: "VALIDATION_ERROR",
            message: e.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AppError::timeout("store deadline exceeded")
    }
}
