//! 宿主输出载荷。
//!
//! 适配器不解读这些载荷的内容，只负责把它们原样交给拥有线程上的宿主。

use std::{borrow::Cow, fmt, time::SystemTime};

use strand_core::AdapterError;

/// 错误记录的粗粒度类别。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCategory {
    #[default]
    NotSpecified,
    InvalidArgument,
    InvalidOperation,
    ObjectNotFound,
    ResourceUnavailable,
    OperationStopped,
    WriteError,
}

/// 非终止错误记录。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorRecord {
    message: String,
    error_id: Cow<'static, str>,
    category: ErrorCategory,
    target: Option<String>,
}

impl ErrorRecord {
    /// 构造错误记录。`error_id` 应是稳定的机器可读标识。
    pub fn new(
        message: impl Into<String>,
        error_id: impl Into<Cow<'static, str>>,
        category: ErrorCategory,
    ) -> Self {
        Self {
            message: message.into(),
            error_id: error_id.into(),
            category,
            target: None,
        }
    }

    /// 以适配器错误构造记录，类别按错误种类映射。
    pub fn from_adapter_error(error: &AdapterError, error_id: impl Into<Cow<'static, str>>) -> Self {
        let category = match error {
            AdapterError::InvalidArgument { .. } => ErrorCategory::InvalidArgument,
            AdapterError::InvalidOperation { .. } | AdapterError::Disposed { .. } => {
                ErrorCategory::InvalidOperation
            }
            AdapterError::Cancelled => ErrorCategory::OperationStopped,
            _ => ErrorCategory::NotSpecified,
        };
        Self::new(error.to_string(), error_id, category)
    }

    /// 附加出错的目标对象描述。
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn error_id(&self) -> &str {
        &self.error_id
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {:?})", self.message, self.error_id, self.category)
    }
}

/// 进度记录的阶段。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProgressKind {
    #[default]
    Processing,
    Completed,
}

/// 进度记录。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressRecord {
    activity_id: i32,
    activity: String,
    status: String,
    percent_complete: Option<u8>,
    current_operation: Option<String>,
    kind: ProgressKind,
}

impl ProgressRecord {
    pub fn new(activity_id: i32, activity: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            activity_id,
            activity: activity.into(),
            status: status.into(),
            percent_complete: None,
            current_operation: None,
            kind: ProgressKind::Processing,
        }
    }

    /// 设置完成百分比，超过 100 的值按 100 处理。
    pub fn with_percent(mut self, percent: u8) -> Self {
        self.percent_complete = Some(percent.min(100));
        self
    }

    pub fn with_current_operation(mut self, operation: impl Into<String>) -> Self {
        self.current_operation = Some(operation.into());
        self
    }

    /// 标记活动已完成。
    pub fn completed(mut self) -> Self {
        self.kind = ProgressKind::Completed;
        self
    }

    pub fn activity_id(&self) -> i32 {
        self.activity_id
    }

    pub fn activity(&self) -> &str {
        &self.activity
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn percent_complete(&self) -> Option<u8> {
        self.percent_complete
    }

    pub fn current_operation(&self) -> Option<&str> {
        self.current_operation.as_deref()
    }

    pub fn kind(&self) -> ProgressKind {
        self.kind
    }
}

/// 结构化信息记录。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InformationRecord {
    message: String,
    source: Option<String>,
    tags: Vec<String>,
    time_generated: SystemTime,
}

impl InformationRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            tags: Vec::new(),
            time_generated: SystemTime::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn time_generated(&self) -> SystemTime {
        self.time_generated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_errors_map_to_categories() {
        let record = ErrorRecord::from_adapter_error(&AdapterError::Cancelled, "Stopped")
            .with_target("widget-7");
        assert_eq!(record.category(), ErrorCategory::OperationStopped);
        assert_eq!(record.target(), Some("widget-7"));
        assert_eq!(record.error_id(), "Stopped");
    }

    #[test]
    fn progress_percent_is_clamped() {
        let record = ProgressRecord::new(1, "Copy", "working").with_percent(250);
        assert_eq!(record.percent_complete(), Some(100));
        assert_eq!(record.completed().kind(), ProgressKind::Completed);
    }
}
