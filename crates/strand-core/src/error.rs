//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为适配器对外暴露的全部失败语义提供集中定义：参数错误、用法错误、已释放、取消、用户故障、等待超时；
//! - `Cancel`/`Stop` 路径需要按类别吞掉“已释放”错误，因此错误必须可被精确匹配。
//!
//! ## 设计要求（What）
//! - 所有变体均实现 `Clone + Send + Sync`，以便同一结果既能投递给等待方，又能在日志中复用；
//! - 用户故障以 `Arc<dyn Error>` 保存，保证跨线程转交后 `source()` 链与原始身份不丢失。

use std::{borrow::Cow, error::Error as StdError, fmt, sync::Arc};

use thiserror::Error;

/// 用户代码产生的装箱错误类型。
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// 适配器统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把宿主契约、作用域状态机与用户代码三类失败放进同一枚举，
///   使 `RunPhase` 边界能按类别做出“抛出 / 吞掉”决策；
/// - **契约 (What)**：
///   - `InvalidArgument`、`InvalidOperation`、`Disposed` 总是同步返回给触发调用的一方；
///   - `Cancelled` 是预期结局而非故障，最外层边界会将其吞掉；
///   - `Fault` 携带用户错误，仅在阶段结束时重新抛出一次；
///   - `Timeout` 仅出现在显式配置了同步等待上限的场景。
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum AdapterError {
    /// 公共入口收到非法参数，在任何状态变更之前失败。
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument {
        name: &'static str,
        reason: Cow<'static, str>,
    },

    /// 违反适配器用法契约，例如重复开启作用域或在关闭后继续入队。
    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: Cow<'static, str> },

    /// 目标对象已释放。
    #[error("{object} has been disposed")]
    Disposed { object: &'static str },

    /// 操作被取消。
    #[error("the operation was cancelled")]
    Cancelled,

    /// 用户代码（阶段主体或排队动作）产生的故障。
    #[error(transparent)]
    Fault(Fault),

    /// 跨线程同步请求在配置的时限内未被拥有线程执行。
    #[error("timed out after {waited_ms} ms waiting for the owner thread")]
    Timeout { waited_ms: u64 },
}

impl AdapterError {
    /// 以用户错误构造 `Fault` 变体。
    pub fn fault(error: impl Into<BoxError>) -> Self {
        AdapterError::Fault(Fault::new(error))
    }

    pub(crate) fn invalid_operation(reason: impl Into<Cow<'static, str>>) -> Self {
        AdapterError::InvalidOperation {
            reason: reason.into(),
        }
    }

    pub(crate) fn disposed(object: &'static str) -> Self {
        AdapterError::Disposed { object }
    }

    /// 是否为取消结局。
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AdapterError::Cancelled)
    }

    /// 是否为已释放错误，`Stop`/`Drop` 路径据此吞掉拆除竞态。
    pub fn is_disposed(&self) -> bool {
        matches!(self, AdapterError::Disposed { .. })
    }

    /// 若为用户故障，返回其引用。
    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            AdapterError::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

/// 被捕获的用户故障。
///
/// - **契约 (What)**：克隆只增加引用计数，`Display`/`source()` 透传给原始错误；
/// - 由 panic 转换而来的故障使用 [`PanicFault`] 作为内部错误。
#[derive(Clone)]
pub struct Fault {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl Fault {
    /// 包装用户错误。
    pub fn new(error: impl Into<BoxError>) -> Self {
        let boxed: BoxError = error.into();
        Self {
            inner: Arc::from(boxed),
        }
    }

    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
            (*text).to_owned()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self::new(PanicFault { message })
    }

    /// 原始错误的只读视图。
    pub fn error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }

    /// 尝试向下转型为具体错误类型。
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    /// 两个故障是否指向同一份原始错误。
    pub fn ptr_eq(&self, other: &Fault) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fault").field(&self.inner).finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for Fault {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

/// 排队动作 panic 后转换得到的错误。
#[derive(Debug, Error)]
#[error("queued operation panicked: {message}")]
pub struct PanicFault {
    message: String,
}

impl PanicFault {
    /// panic 携带的文本。
    pub fn message(&self) -> &str {
        &self.message
    }
}
