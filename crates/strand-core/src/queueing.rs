//! # QueueingExecutionContext：把“回到原上下文继续执行”改写为入队
//!
//! ## 核心意图（Why）
//! - 宿主只允许拥有线程触碰其对象；挂起的异步代码在任意线程上恢复时，
//!   凡是需要回到原上下文的续体都必须经由作用域队列交还拥有线程；
//!
//! ## 行为契约（What）
//! - `post`：发后即忘，总以非同步方式入队；作用域已取消时静默丢弃；
//!   回调失败无人等待，由作用域记下首个故障，在阶段主体成功结束后作为阶段结局返回；
//! - `send`：阻塞式，拥有线程上内联执行，其他线程入队并等待；作用域已取消时返回 `Cancelled`；
//! - `create_copy`：得到绑定同一作用域的新上下文；
//! - 主体 future 的 [`Waker`](std::task::Waker) 由 [`ResumeSignal`] 提供，唤醒即入队一个恢复工作项。
//!   恢复工作项不受取消短路影响，否则主体将永远无法观察到取消并结束。

use std::{
    fmt,
    sync::{Arc, Weak},
    task::Wake,
};

use crate::{ambient, error::AdapterError, scope::OperationScope};

/// 绑定到单个作用域的重定向上下文。
#[derive(Clone)]
pub struct QueueingExecutionContext {
    scope: Weak<OperationScope>,
}

impl QueueingExecutionContext {
    pub(crate) fn new(scope: &Arc<OperationScope>) -> Self {
        Self {
            scope: Arc::downgrade(scope),
        }
    }

    /// 当前线程上登记的上下文；仅在拥有线程处于某个作用域内时存在。
    pub fn current() -> Option<Self> {
        ambient::current()
    }

    /// 发后即忘地把回调交给拥有线程。
    pub fn post<F>(&self, callback: F) -> Result<(), AdapterError>
    where
        F: FnOnce() + Send + 'static,
    {
        let scope = self.scope()?;
        if scope.token().is_cancelled() {
            scope.note_dropped();
            tracing::trace!(scope = scope.id(), "post dropped after cancellation");
            return Ok(());
        }
        scope.post(move || {
            callback();
            Ok(())
        })
    }

    /// 在拥有线程上执行回调并等待其结束。
    pub fn send<F>(&self, callback: F) -> Result<(), AdapterError>
    where
        F: FnOnce() + Send + 'static,
    {
        let scope = self.scope()?;
        if scope.token().is_cancelled() {
            scope.note_dropped();
            return Err(AdapterError::Cancelled);
        }
        scope
            .request_operation(
                move || {
                    callback();
                    Ok(())
                },
                true,
                None,
            )?
            .wait()
    }

    /// 复制上下文，副本与原上下文绑定同一作用域。
    pub fn create_copy(&self) -> Self {
        self.clone()
    }

    /// 所绑定作用域的编号；作用域已回收时返回 `None`。
    pub fn scope_id(&self) -> Option<u64> {
        self.scope.upgrade().map(|scope| scope.id())
    }

    pub(crate) fn is_live(&self) -> bool {
        self.scope
            .upgrade()
            .is_some_and(|scope| !scope.is_disposed())
    }

    fn scope(&self) -> Result<Arc<OperationScope>, AdapterError> {
        match self.scope.upgrade() {
            Some(scope) if !scope.is_disposed() => Ok(scope),
            _ => Err(AdapterError::disposed("operation scope")),
        }
    }
}

impl fmt::Debug for QueueingExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueingExecutionContext")
            .field("scope", &self.scope_id())
            .finish()
    }
}

/// 阶段主体 future 的唤醒器。
pub(crate) struct ResumeSignal {
    scope: Weak<OperationScope>,
}

impl ResumeSignal {
    pub(crate) fn new(scope: &Arc<OperationScope>) -> Self {
        Self {
            scope: Arc::downgrade(scope),
        }
    }
}

impl Wake for ResumeSignal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(scope) = self.scope.upgrade() {
            scope.schedule_resume();
        }
    }
}
