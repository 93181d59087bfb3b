//! 日志与指标
//! 初始化结构化日志，定义引擎使用的指标名称

use crate::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 休假申请创建计数
pub const LEAVE_REQUESTS_CREATED: &str = "leave.requests.created";
/// 审批决策计数（按 action/outcome 打标签）
pub const LEAVE_DECISIONS: &str = "leave.decisions";
/// 上下班打卡计数
pub const ATTENDANCE_CLOCK_EVENTS: &str = "attendance.clock_events";
/// 日历同步投递计数
pub const SYNC_DELIVERIES: &str = "sync.deliveries";
/// 存储操作超时计数
pub const STORE_TIMEOUTS: &str = "store.timeouts";

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的级别。重复调用（例如测试中）不会 panic。
pub fn init_telemetry(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let log_layer = match config.format.to_lowercase().as_str() {
        "json" => {
            // JSON 格式（生产环境）
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
                .boxed()
        }
        "pretty" => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer().with_target(false).boxed(),
    };

    let initialized = tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .try_init()
        .is_ok();

    if initialized {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            level = %config.level,
            format = %config.format,
            "Telemetry initialized"
        );
    }
}

/// 初始化指标
pub fn init_metrics() {
    // metrics 0.24 在首次使用时创建指标，这里只登记描述
    metrics::describe_counter!(LEAVE_REQUESTS_CREATED, "Leave requests accepted");
    metrics::describe_counter!(LEAVE_DECISIONS, "Leave request decisions applied");
    metrics::describe_counter!(ATTENDANCE_CLOCK_EVENTS, "Clock-in and clock-out events");
    metrics::describe_counter!(SYNC_DELIVERIES, "Calendar sync delivery attempts");
    metrics::describe_counter!(STORE_TIMEOUTS, "Store operations abandoned at the deadline");
    tracing::debug!("Metrics initialized");
}
