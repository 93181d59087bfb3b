//! 分页与排序
//! 所有列表接口返回统一的分页信封；排序字段走白名单，不把调用方输入拼进 SQL

use serde::{Deserialize, Serialize};

use crate::config::PaginationConfig;
use crate::error::{AppError, Result};

/// 排序方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    /// 只有显式的 `asc` 才升序，其余一律降序
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("asc") => SortDirection::Asc,
            _ => SortDirection::Desc,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// 可排序字段白名单
pub trait SortField: Copy + Sized + 'static {
    /// 参数名与字段的映射
    const ALLOWED: &'static [(&'static str, Self)];

    /// 不在白名单中时回退的字段
    fn fallback() -> Self;

    /// 对应的列名（只会来自白名单常量）
    fn column(self) -> &'static str;

    fn from_param(value: Option<&str>) -> Self {
        value
            .map(str::trim)
            .and_then(|v| {
                Self::ALLOWED
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(v))
                    .map(|(_, field)| *field)
            })
            .unwrap_or_else(Self::fallback)
    }
}

/// 解析后的排序规格
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec<F: SortField> {
    pub field: F,
    pub direction: SortDirection,
}

impl<F: SortField> SortSpec<F> {
    pub fn new(field: Option<&str>, direction: Option<&str>) -> Self {
        Self {
            field: F::from_param(field),
            direction: SortDirection::parse(direction),
        }
    }

    /// 解析 `field,dir` 形式的排序参数
    pub fn from_sort_param(sort: Option<&str>) -> Self {
        let mut parts = sort.unwrap_or_default().splitn(2, ',');
        let field = parts.next().filter(|f| !f.trim().is_empty());
        let direction = parts.next();
        Self::new(field, direction)
    }

    /// `ORDER BY` 子句
    pub fn order_by(&self) -> String {
        format!("{} {}", self.field.column(), self.direction.as_sql())
    }
}

/// 规范化后的分页参数（page 从 1 开始）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    pub fn normalize(
        page: Option<i64>,
        size: Option<i64>,
        settings: &PaginationConfig,
    ) -> Result<Self> {
        let page = page.unwrap_or(1);
        let size = size.unwrap_or(settings.default_size as i64);

        if page < 1 || page > u32::MAX as i64 {
            return Err(AppError::validation(
                "VALIDATION_ERROR",
                "`page` must be a positive integer",
            ));
        }

        if size < 1 || size > settings.max_size as i64 {
            return Err(AppError::Validation {
                code: "VALIDATION_ERROR",
                message: format!("`size` must be between 1 and {}", settings.max_size),
            });
        }

        Ok(Self {
            page: page as u32,
            size: size as u32,
        })
    }

    pub fn limit(&self) -> i64 {
        self.size as i64
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.size as i64
    }
}

/// 分页信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    pub total_elements: i64,
    pub total_pages: i64,
    pub page: u32,
    pub size: u32,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, total_elements: i64, request: PageRequest) -> Self {
        let size = request.size.max(1) as i64;
        let total_pages = (total_elements + size - 1) / size;

        Self {
            content,
            total_elements,
            total_pages,
            page: request.page,
            size: request.size,
        }
    }
}
