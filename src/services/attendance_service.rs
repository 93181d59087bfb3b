//! 考勤会话服务
//! 上班打卡（可选地理围栏）、下班打卡、管理员强制下班与打卡记录查询

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::calendar::{compute_duration_minutes, is_within_geofence, parse_date};
use crate::config::{AppConfig, PaginationConfig};
use crate::error::{AppError, Result};
use crate::models::attendance::*;
use crate::models::pagination::{Page, PageRequest, SortSpec};
use crate::repository::AttendanceStore;
use crate::services::within_deadline;
use crate::telemetry::ATTENDANCE_CLOCK_EVENTS;

/// 允许上班打卡的圆形区域
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geofence {
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_meters: f64,
}

impl Geofence {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        is_within_geofence(
            point.latitude,
            point.longitude,
            self.center_lat,
            self.center_lon,
            self.radius_meters,
        )
    }
}

#[derive(Debug, Clone)]
pub struct AttendanceSettings {
    /// None 表示不校验位置
    pub geofence: Option<Geofence>,
    pub default_source: String,
    pub pagination: PaginationConfig,
    pub deadline: Duration,
}

impl Default for AttendanceSettings {
    fn default() -> Self {
        Self {
            geofence: None,
            default_source: "mobile".to_string(),
            pagination: PaginationConfig::default(),
            deadline: Duration::from_secs(10),
        }
    }
}

impl AttendanceSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let attendance = &config.attendance;
        let geofence = match (
            attendance.geo_validation_enabled,
            attendance.geo_center_lat,
            attendance.geo_center_lon,
        ) {
            (true, Some(center_lat), Some(center_lon)) => Some(Geofence {
                center_lat,
                center_lon,
                radius_meters: attendance.geo_radius_meters,
            }),
            _ => None,
        };

        Self {
            geofence,
            default_source: attendance.default_source.clone(),
            pagination: config.pagination.clone(),
            deadline: Duration::from_secs(config.store.timeout_secs),
        }
    }
}

fn event_time(timestamp: Option<&str>) -> Result<DateTime<Utc>> {
    match timestamp {
        Some(value) => Ok(parse_date(value)?),
        None => Ok(Utc::now()),
    }
}

pub struct AttendanceService {
    store: Arc<dyn AttendanceStore>,
    settings: AttendanceSettings,
}

impl AttendanceService {
    pub fn new(store: Arc<dyn AttendanceStore>, settings: AttendanceSettings) -> Self {
        Self { store, settings }
    }

    /// 上班打卡
    #[instrument(skip(self, input))]
    pub async fn clock_in(&self, user_id: i64, input: ClockInRequest) -> Result<AttendanceLog> {
        input.validate()?;
        let clock_in = event_time(input.timestamp.as_deref())?;

        let coordinates_given = input.latitude.is_some() || input.longitude.is_some();
        let point = GeoPoint::from_parts(input.latitude, input.longitude, input.accuracy);

        if let Some(fence) = &self.settings.geofence {
            let point = point.ok_or_else(|| {
                AppError::validation(
                    "GEO_REQUIRED",
                    "A valid latitude and longitude are required to clock in",
                )
            })?;
            if !fence.contains(&point) {
                warn!(
                    user_id,
                    latitude = point.latitude,
                    longitude = point.longitude,
                    "Clock-in outside geofence"
                );
                return Err(AppError::OutsideGeofence);
            }
        } else if coordinates_given && point.is_none() {
            return Err(AppError::validation(
                "INVALID_GEO_LOCATION",
                "Latitude and longitude must both be valid coordinates",
            ));
        }

        let new_clock_in = NewClockIn {
            user_id,
            clock_in,
            geo_location: point.map(GeoLocation::from),
            source: input
                .source
                .unwrap_or_else(|| self.settings.default_source.clone()),
        };

        let log = within_deadline(self.settings.deadline, "attendance.clock_in", async {
            if let Some(open) = self.store.open_session(user_id).await? {
                return Err(AppError::AlreadyClockedIn {
                    log_id: open.log_id,
                });
            }
            self.store.insert_clock_in(&new_clock_in).await
        })
        .await?;

        metrics::counter!(ATTENDANCE_CLOCK_EVENTS, "kind" => "clock_in").increment(1);
        info!(log_id = log.log_id, user_id, "Clocked in");

        Ok(log)
    }

    /// 下班打卡
    ///
    /// 位置合法时并入已有记录（保留上班坐标），否则保持原样。
    #[instrument(skip(self, input))]
    pub async fn clock_out(&self, user_id: i64, input: ClockOutRequest) -> Result<AttendanceLog> {
        input.validate()?;
        let clock_out = event_time(input.timestamp.as_deref())?;
        let point = GeoPoint::from_parts(input.latitude, input.longitude, input.accuracy);

        let log = self.close(user_id, clock_out, point, "attendance.clock_out").await?;

        metrics::counter!(ATTENDANCE_CLOCK_EVENTS, "kind" => "clock_out").increment(1);
        info!(
            log_id = log.log_id,
            user_id,
            duration_minutes = ?log.duration_minutes,
            "Clocked out"
        );

        Ok(log)
    }

    /// 管理员关闭他人的打开会话（会话不会自动超时）
    #[instrument(skip(self))]
    pub async fn force_clock_out(
        &self,
        user_id: i64,
        actor_id: i64,
        timestamp: Option<&str>,
    ) -> Result<AttendanceLog> {
        let clock_out = event_time(timestamp)?;
        let log = self
            .close(user_id, clock_out, None, "attendance.force_clock_out")
            .await?;

        metrics::counter!(ATTENDANCE_CLOCK_EVENTS, "kind" => "force_clock_out").increment(1);
        warn!(
            log_id = log.log_id,
            user_id,
            actor_id,
            "Attendance session closed by administrator"
        );

        Ok(log)
    }

    async fn close(
        &self,
        user_id: i64,
        clock_out: DateTime<Utc>,
        point: Option<GeoPoint>,
        operation: &'static str,
    ) -> Result<AttendanceLog> {
        let planner = move |open: &AttendanceLog| -> Result<SessionClose> {
            let duration_minutes = compute_duration_minutes(open.clock_in, clock_out)?;
            let geo_location = match point {
                Some(point) => Some(GeoLocation::merge_clock_out(open.location(), point)),
                None => open.location(),
            };

            Ok(SessionClose {
                clock_out,
                duration_minutes,
                geo_location,
            })
        };

        within_deadline(
            self.settings.deadline,
            operation,
            self.store.close_session(user_id, &planner),
        )
        .await
    }

    pub async fn current_session(&self, user_id: i64) -> Result<Option<AttendanceLog>> {
        within_deadline(
            self.settings.deadline,
            "attendance.current_session",
            self.store.open_session(user_id),
        )
        .await
    }

    pub async fn list_logs(&self, filters: AttendanceFilters) -> Result<Page<AttendanceLog>> {
        let page = PageRequest::normalize(filters.page, filters.size, &self.settings.pagination)?;
        let from = filters.start_date.as_deref().map(parse_date).transpose()?;
        let to = filters.end_date.as_deref().map(parse_date).transpose()?;

        let query = AttendanceQuery {
            user_id: filters.user_id,
            from,
            to,
            page,
            sort: SortSpec::new(filters.sort_field.as_deref(), filters.sort_dir.as_deref()),
        };

        let (content, total) = within_deadline(
            self.settings.deadline,
            "attendance.list",
            self.store.list_logs(&query),
        )
        .await?;

        Ok(Page::new(content, total, page))
    }
}
