//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use config::{Config, ConfigError, Environment};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

use crate::calendar::HolidaySet;
use crate::models::leave::{NegativeBalancePolicy, OverlapScope};

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库连接 URL（使用 Secret 包装，防止日志泄露）
    pub url: Secret<String>,
    /// 最大连接数
    pub max_connections: u32,
    /// 最小连接数
    pub min_connections: u32,
    /// 获取连接超时时间（秒）
    pub acquire_timeout_secs: u64,
    /// 空闲连接超时时间（秒）
    pub idle_timeout_secs: u64,
    /// 连接最大生命周期（秒）
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaveConfig {
    /// 节假日，逗号分隔的 YYYY-MM-DD
    pub holiday_dates: String,
    /// 重叠检测范围
    pub overlap_scope: OverlapScope,
    /// 扣减导致负余额时的处理
    pub negative_balance: NegativeBalancePolicy,
}

impl LeaveConfig {
    pub fn holidays(&self) -> Result<HolidaySet, ConfigError> {
        HolidaySet::parse(&self.holiday_dates)
            .map_err(|e| ConfigError::Message(format!("Invalid leave.holiday_dates: {}", e)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttendanceConfig {
    /// 是否启用上班打卡地理围栏
    pub geo_validation_enabled: bool,
    pub geo_center_lat: Option<f64>,
    pub geo_center_lon: Option<f64>,
    /// 围栏半径（米）
    pub geo_radius_meters: f64,
    /// 未指定来源时的默认值
    pub default_source: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    pub default_size: u32,
    pub max_size: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_size: 25,
            max_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// 是否向日历同步推送
    pub enabled: bool,
    /// 事件总线容量
    pub channel_capacity: usize,
    /// 单个事件最大投递次数
    pub max_attempts: u32,
    /// 重试间隔（毫秒，线性递增）
    pub retry_backoff_ms: u64,
    /// 去重记录上限，超出后淘汰较早的 request_id
    pub dedupe_capacity: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 1000,
            max_attempts: 3,
            retry_backoff_ms: 500,
            dedupe_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// 单次存储操作的截止时间（秒），超时视为未生效
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub leave: LeaveConfig,
    pub attendance: AttendanceConfig,
    pub pagination: PaginationConfig,
    pub sync: SyncConfig,
    pub store: StoreConfig,
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("database.max_lifetime_secs", 1800)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("leave.holiday_dates", "")?
            .set_default("leave.overlap_scope", "active")?
            .set_default("leave.negative_balance", "reject")?
            .set_default("attendance.geo_validation_enabled", false)?
            .set_default("attendance.geo_radius_meters", 150.0)?
            .set_default("attendance.default_source", "mobile")?
            .set_default("pagination.default_size", 25)?
            .set_default("pagination.max_size", 100)?
            .set_default("sync.enabled", true)?
            .set_default("sync.channel_capacity", 1000)?
            .set_default("sync.max_attempts", 3)?
            .set_default("sync.retry_backoff_ms", 500)?
            .set_default("sync.dedupe_capacity", 10_000)?
            .set_default("store.timeout_secs", 10)?;

        // 从环境变量加载配置（前缀为 LA_）
        settings = settings.add_source(
            Environment::with_prefix("LA")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    fn validate(&self) -> Result<(), ConfigError> {
        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        if self.database.url.expose_secret().is_empty() {
            return Err(ConfigError::Message("database.url must be set".to_string()));
        }

        // 验证数据库连接池配置
        if self.database.max_connections < self.database.min_connections {
            return Err(ConfigError::Message(
                "max_connections must be >= min_connections".to_string(),
            ));
        }

        // 节假日必须可解析
        self.leave.holidays()?;

        // 启用地理围栏时必须给出合法圆心
        if self.attendance.geo_validation_enabled {
            match (self.attendance.geo_center_lat, self.attendance.geo_center_lon) {
                (Some(lat), Some(lon))
                    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) => {}
                _ => {
                    return Err(ConfigError::Message(
                        "geo_center_lat and geo_center_lon must be valid when geo validation is enabled"
                            .to_string(),
                    ))
                }
            }
        }

        if !(self.attendance.geo_radius_meters.is_finite() && self.attendance.geo_radius_meters > 0.0)
        {
            return Err(ConfigError::Message(
                "geo_radius_meters must be a positive number".to_string(),
            ));
        }

        if self.pagination.default_size == 0
            || self.pagination.default_size > self.pagination.max_size
        {
            return Err(ConfigError::Message(
                "pagination.default_size must be between 1 and pagination.max_size".to_string(),
            ));
        }

        if self.sync.channel_capacity == 0
            || self.sync.max_attempts == 0
            || self.sync.dedupe_capacity == 0
        {
            return Err(ConfigError::Message(
                "sync.channel_capacity, sync.max_attempts and sync.dedupe_capacity must be positive"
                    .to_string(),
            ));
        }

        if self.store.timeout_secs == 0 {
            return Err(ConfigError::Message(
                "store.timeout_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
