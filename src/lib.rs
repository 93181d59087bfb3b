//! 考勤与休假引擎
//! 打卡会话、休假工作流与余额台账的业务规则，以及它们依赖的存储与基础设施

pub mod calendar;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod repository;
pub mod services;
pub mod state;
pub mod sync;
pub mod telemetry;
