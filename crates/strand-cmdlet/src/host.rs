//! # CommandHost：宿主输出管道的抽象
//!
//! ## 意图（Why）
//! - 宿主（命令运行时）只允许在拥有线程上被调用。本 trait 描述宿主能力本身，
//!   线程约束由 [`crate::CmdletRuntime`] 统一负责，宿主实现无需关心跨线程问题。
//!
//! ## 契约（What）
//! - 每个方法都在拥有线程上、以请求提交的顺序被调用；
//! - 宿主可以通过返回 [`HostError`] 拒绝一次写入，该失败会交付给对应请求的完成句柄；
//! - `should_process`/`should_continue` 的默认实现总是同意，便于无交互宿主直接复用。

use std::borrow::Cow;

use strand_core::AdapterError;
use thiserror::Error;

use crate::records::{ErrorRecord, InformationRecord, ProgressRecord};

/// 宿主拒绝一次调用时返回的错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum HostError {
    /// 管道已被宿主停止，后续写入没有接收方。
    #[error("the pipeline has been stopped")]
    PipelineStopped,

    /// 宿主因其他原因拒绝调用。
    #[error("host rejected the call: {reason}")]
    Rejected { reason: Cow<'static, str> },
}

impl HostError {
    pub fn rejected(reason: impl Into<Cow<'static, str>>) -> Self {
        HostError::Rejected {
            reason: reason.into(),
        }
    }
}

impl From<HostError> for AdapterError {
    /// 管道停止与取消同义，其余拒绝作为故障交付。
    fn from(error: HostError) -> Self {
        match error {
            HostError::PipelineStopped => AdapterError::Cancelled,
            other => AdapterError::fault(other),
        }
    }
}

/// 宿主输出管道。
///
/// 实现者拥有真正的输出目标（控制台、管道下游、测试记录器等）。
/// 要求 `Send` 仅是为了能被放入跨线程提交的工作项；调用本身总发生在拥有线程上。
pub trait CommandHost: Send + 'static {
    /// 写入管道的对象类型。
    type Output: Send + 'static;

    fn write_object(&mut self, output: Self::Output) -> Result<(), HostError>;

    fn write_error(&mut self, record: ErrorRecord) -> Result<(), HostError>;

    fn write_warning(&mut self, message: String) -> Result<(), HostError>;

    fn write_verbose(&mut self, message: String) -> Result<(), HostError>;

    fn write_debug(&mut self, message: String) -> Result<(), HostError>;

    fn write_progress(&mut self, record: ProgressRecord) -> Result<(), HostError>;

    fn write_information(&mut self, record: InformationRecord) -> Result<(), HostError>;

    /// 询问是否对 `target` 执行 `action`。
    fn should_process(&mut self, target: &str, action: &str) -> Result<bool, HostError> {
        let _ = (target, action);
        Ok(true)
    }

    /// 询问是否继续执行，`query` 为提示内容，`caption` 为标题。
    fn should_continue(&mut self, query: &str, caption: &str) -> Result<bool, HostError> {
        let _ = (query, caption);
        Ok(true)
    }
}
