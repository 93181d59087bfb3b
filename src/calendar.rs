//! 日历与地理工具
//! 日期解析、工作日计数、时长计算与地理围栏判断，全部为无状态纯函数

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc, Weekday};
use rust_decimal::Decimal;

/// 地球平均半径（米）
const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// 日历工具错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalendarError {
    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),
}

/// 解析日期/时间字符串，统一为 UTC 时间点
///
/// 支持 RFC 3339、无时区的 `YYYY-MM-DDTHH:MM:SS[.fff]`（按 UTC 处理）以及纯日期
/// `YYYY-MM-DD`（当日 00:00 UTC）。
pub fn parse_date(value: &str) -> Result<DateTime<Utc>, CalendarError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CalendarError::InvalidDate("empty value".to_string()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    Err(CalendarError::InvalidDate(value.to_string()))
}

/// 截断为 UTC 日历日
pub fn parse_date_only(value: &str) -> Result<NaiveDate, CalendarError> {
    parse_date(value).map(|dt| dt.date_naive())
}

/// 规范化为 `YYYY-MM-DD`
pub fn normalize_date_only(value: &str) -> Result<String, CalendarError> {
    parse_date_only(value).map(|date| date.format("%Y-%m-%d").to_string())
}

/// 节假日集合
///
/// 启动时由配置构造一次，显式传入计数函数。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HolidaySet {
    dates: BTreeSet<NaiveDate>,
}

impl HolidaySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析逗号分隔的日期列表，空项忽略
    pub fn parse(list: &str) -> Result<Self, CalendarError> {
        let dates = list
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(parse_date_only)
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(Self { dates })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

impl FromIterator<NaiveDate> for HolidaySet {
    fn from_iter<I: IntoIterator<Item = NaiveDate>>(iter: I) -> Self {
        Self {
            dates: iter.into_iter().collect(),
        }
    }
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// 计算请假天数
///
/// 半天请假恒为 0.5；否则统计 `[start, end]` 内既非周末也非节假日的天数。
pub fn count_leave_days(
    start: NaiveDate,
    end: NaiveDate,
    half_day: bool,
    holidays: &HolidaySet,
) -> Result<Decimal, CalendarError> {
    if end < start {
        return Err(CalendarError::InvalidRange(format!(
            "end date {} is before start date {}",
            end, start
        )));
    }

    if half_day {
        return Ok(Decimal::new(5, 1));
    }

    let days = start
        .iter_days()
        .take_while(|day| *day <= end)
        .filter(|day| !is_weekend(*day) && !holidays.contains(*day))
        .count();

    Ok(Decimal::from(days as u64))
}

/// 计算打卡时长（分钟，四舍五入）
pub fn compute_duration_minutes(
    clock_in: DateTime<Utc>,
    clock_out: DateTime<Utc>,
) -> Result<i64, CalendarError> {
    if clock_out < clock_in {
        return Err(CalendarError::InvalidRange(
            "clock-out must be after clock-in".to_string(),
        ));
    }

    let millis = (clock_out - clock_in).num_milliseconds();
    Ok((millis + 30_000) / 60_000)
}

/// 两点间大圆距离（haversine，米）
pub fn haversine_distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

/// 判断坐标是否位于以 center 为圆心、radius_meters 为半径的围栏内
pub fn is_within_geofence(
    lat: f64,
    lon: f64,
    center_lat: f64,
    center_lon: f64,
    radius_meters: f64,
) -> bool {
    haversine_distance_meters(lat, lon, center_lat, center_lon) <= radius_meters
}
