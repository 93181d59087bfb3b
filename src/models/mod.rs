//! 数据模型模块
//! 休假、考勤与分页信封

pub mod attendance;
pub mod leave;
pub mod pagination;
