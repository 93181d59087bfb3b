//! Attendance domain models
//! 打卡记录与地理位置

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use validator::Validate;

use crate::models::pagination::{PageRequest, SortField, SortSpec};

/// 单次打卡坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// 坐标为有限数且在合法经纬度范围内
    pub fn is_well_formed(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.accuracy.map_or(true, |a| a.is_finite() && a >= 0.0)
    }

    /// 从可选的经纬度字段构造；任一缺失或非法则返回 None
    pub fn from_parts(
        latitude: Option<f64>,
        longitude: Option<f64>,
        accuracy: Option<f64>,
    ) -> Option<Self> {
        let point = Self {
            latitude: latitude?,
            longitude: longitude?,
            accuracy,
        };
        point.is_well_formed().then_some(point)
    }
}

/// 打卡记录上保存的位置
///
/// 顶层经纬度是上班打卡位置；下班位置合并进 `clock_out`，不覆盖上班坐标。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_out: Option<GeoPoint>,
}

impl From<GeoPoint> for GeoLocation {
    fn from(point: GeoPoint) -> Self {
        Self {
            latitude: point.latitude,
            longitude: point.longitude,
            accuracy: point.accuracy,
            clock_out: None,
        }
    }
}

impl GeoLocation {
    /// 合并下班打卡位置
    pub fn merge_clock_out(existing: Option<GeoLocation>, incoming: GeoPoint) -> GeoLocation {
        match existing {
            Some(current) => GeoLocation {
                latitude: current.latitude,
                longitude: current.longitude,
                accuracy: incoming.accuracy.or(current.accuracy),
                clock_out: Some(incoming),
            },
            None => GeoLocation {
                clock_out: Some(incoming),
                ..GeoLocation::from(incoming)
            },
        }
    }
}

/// 打卡记录
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AttendanceLog {
    pub log_id: i64,
    pub user_id: i64,
    pub clock_in: DateTime<Utc>,
    pub clock_out: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub geo_location: Option<Json<GeoLocation>>,
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AttendanceLog {
    pub fn is_open(&self) -> bool {
        self.clock_out.is_none()
    }

    pub fn location(&self) -> Option<GeoLocation> {
        self.geo_location.as_ref().map(|json| json.0)
    }
}

/// 上班打卡请求
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ClockInRequest {
    /// 缺省为当前时间
    pub timestamp: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: Option<f64>,
    #[validate(length(min = 1, max = 32))]
    pub source: Option<String>,
}

/// 下班打卡请求
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ClockOutRequest {
    pub timestamp: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: Option<f64>,
}

/// 写入存储的上班打卡
#[derive(Debug, Clone)]
pub struct NewClockIn {
    pub user_id: i64,
    pub clock_in: DateTime<Utc>,
    pub geo_location: Option<GeoLocation>,
    pub source: String,
}

/// 关闭会话时写入的字段（只写一次）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionClose {
    pub clock_out: DateTime<Utc>,
    pub duration_minutes: i64,
    pub geo_location: Option<GeoLocation>,
}

/// 打卡记录排序字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceSortField {
    ClockIn,
    ClockOut,
    CreatedAt,
}

impl SortField for AttendanceSortField {
    const ALLOWED: &'static [(&'static str, Self)] = &[
        ("clock_in", AttendanceSortField::ClockIn),
        ("clock_out", AttendanceSortField::ClockOut),
        ("created_at", AttendanceSortField::CreatedAt),
    ];

    fn fallback() -> Self {
        AttendanceSortField::ClockIn
    }

    fn column(self) -> &'static str {
        match self {
            AttendanceSortField::ClockIn => "clock_in",
            AttendanceSortField::ClockOut => "clock_out",
            AttendanceSortField::CreatedAt => "created_at",
        }
    }
}

/// 打卡记录查询条件（调用方原始输入）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttendanceFilters {
    pub user_id: Option<i64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub page: Option<i64>,
    pub size: Option<i64>,
    pub sort_field: Option<String>,
    pub sort_dir: Option<String>,
}

/// 规范化后的查询
#[derive(Debug, Clone)]
pub struct AttendanceQuery {
    pub user_id: Option<i64>,
    /// clock_in >= from
    pub from: Option<DateTime<Utc>>,
    /// clock_out <= to，或会话仍未关闭
    pub to: Option<DateTime<Utc>>,
    pub page: PageRequest,
    pub sort: SortSpec<AttendanceSortField>,
}
