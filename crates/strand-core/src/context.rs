//! # ExecutionAdapterContext：单个宿主对象的阶段编排器
//!
//! ## 核心意图（Why）
//! - 每个宿主对象实例对应一个上下文，保存“当前作用域”并驱动泵循环，
//!   让异步阶段主体在拥有线程之外完成真正的计算，而所有宿主可见的副作用仍回到拥有线程执行；
//!
//! ## 行为契约（What）
//! - 状态机：`Idle -> ScopeActive (begin_scope) -> Idle (end_scope)`，`dispose` 进入终态 `Disposed`；
//! - 同一时刻至多一个活动作用域，重复开启返回 `InvalidOperation`；
//! - `cancel` 在任意状态下均可调用，仅在存在活动作用域时生效，并吞掉拆除竞态产生的 `Disposed`；
//! - `run_phase` 中用户主体的取消结局在边界处被吞掉，其余故障原样返回。
//!
//! ## 并发约束
//! - 当前作用域引用是唯一需要互斥的字段：读取（取消、令牌查询、请求转发）取读锁，开启/结束取写锁。

use std::{
    fmt,
    future::Future,
    pin::pin,
    sync::{Arc, Weak},
    task::{Context, Poll, Waker},
};

use tracing::{debug, trace};

use crate::{
    cancellation::CancellationToken,
    completion::Completion,
    error::AdapterError,
    options::AdapterOptions,
    queue::WorkKind,
    queueing::ResumeSignal,
    registry::{CmdletId, ContextRegistry},
    scope::OperationScope,
    scoped_lock::ScopedRwLock,
};

/// 单个宿主对象的执行适配状态。
pub struct ExecutionAdapterContext {
    id: CmdletId,
    options: AdapterOptions,
    parent: CancellationToken,
    current: ScopedRwLock<Option<Arc<OperationScope>>>,
    registry: Weak<ContextRegistry>,
}

impl ExecutionAdapterContext {
    /// 创建不隶属任何注册表的上下文。
    ///
    /// `parent` 为外层取消令牌（例如宿主整体关闭），每个作用域的取消源都会链接到它。
    pub fn new(id: CmdletId, options: AdapterOptions, parent: CancellationToken) -> Arc<Self> {
        Arc::new(Self::build(id, options, parent, Weak::new()))
    }

    pub(crate) fn build(
        id: CmdletId,
        options: AdapterOptions,
        parent: CancellationToken,
        registry: Weak<ContextRegistry>,
    ) -> Self {
        Self {
            id,
            options,
            parent,
            current: ScopedRwLock::new("execution adapter context", None),
            registry,
        }
    }

    /// 所属宿主对象标识。
    pub fn id(&self) -> CmdletId {
        self.id
    }

    /// 运行参数。
    pub fn options(&self) -> &AdapterOptions {
        &self.options
    }

    /// 是否已释放。
    pub fn is_disposed(&self) -> bool {
        self.current.is_disposed()
    }

    /// 开启新作用域并将其设为当前作用域。
    ///
    /// - 已有活动作用域时返回 `InvalidOperation`；
    /// - 调用线程成为新作用域的拥有线程。
    pub fn begin_scope(&self) -> Result<Arc<OperationScope>, AdapterError> {
        let mut current = self.current.write()?;
        if current.is_some() {
            return Err(AdapterError::invalid_operation(
                "an operation scope is already active for this context",
            ));
        }
        let scope = OperationScope::begin(&self.parent, self.options.clone());
        *current = Some(Arc::clone(&scope));
        debug!(cmdlet = %self.id, scope = scope.id(), "scope attached to context");
        Ok(scope)
    }

    /// 清除当前作用域引用。作用域自身的释放由其 `dispose` 负责。
    pub fn end_scope(&self) -> Result<(), AdapterError> {
        let mut current = self.current.write()?;
        if let Some(scope) = current.take() {
            debug!(cmdlet = %self.id, scope = scope.id(), "scope detached from context");
        }
        Ok(())
    }

    /// 当前活动作用域。
    pub fn current_scope(&self) -> Result<Option<Arc<OperationScope>>, AdapterError> {
        Ok(self.current.read()?.clone())
    }

    /// 当前作用域的取消令牌；无活动作用域时返回不可取消的令牌。
    pub fn cancellation_token(&self) -> Result<CancellationToken, AdapterError> {
        let current = self.current.read()?;
        Ok(current
            .as_ref()
            .map(|scope| scope.token().clone())
            .unwrap_or_else(CancellationToken::none))
    }

    /// 向当前作用域转发无返回值请求。
    pub fn request_operation<F>(
        &self,
        action: F,
        execute_synchronously: bool,
        token: Option<&CancellationToken>,
    ) -> Result<Completion<()>, AdapterError>
    where
        F: FnOnce() -> Result<(), AdapterError> + Send + 'static,
    {
        self.request_function(action, execute_synchronously, token)
    }

    /// 向当前作用域转发带返回值的请求；无活动作用域时返回 `InvalidOperation`。
    pub fn request_function<T, F>(
        &self,
        action: F,
        execute_synchronously: bool,
        token: Option<&CancellationToken>,
    ) -> Result<Completion<T>, AdapterError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, AdapterError> + Send + 'static,
    {
        // 先释放读锁再转发：同步请求可能阻塞等待拥有线程，而拥有线程结束阶段时需要写锁。
        let scope = self.active_scope()?;
        scope.request_function(action, execute_synchronously, token)
    }

    /// 取消当前作用域。
    ///
    /// 无活动作用域时为空操作；上下文或作用域已释放时吞掉 `Disposed`。
    pub fn cancel(&self) {
        let scope = match self.current.read() {
            Ok(current) => current.clone(),
            Err(err) => {
                trace!(cmdlet = %self.id, error = %err, "cancel ignored");
                return;
            }
        };
        let Some(scope) = scope else {
            trace!(cmdlet = %self.id, "cancel requested without an active scope");
            return;
        };
        match scope.cancel() {
            Ok(_) => {}
            Err(err) if err.is_disposed() => {
                trace!(cmdlet = %self.id, scope = scope.id(), "cancel raced with scope teardown");
            }
            Err(err) => {
                debug!(cmdlet = %self.id, error = %err, "cancel failed");
            }
        }
    }

    /// 以泵循环驱动一个阶段主体直至结束。
    ///
    /// # 执行逻辑（How）
    /// 1. 开启作用域，调用线程成为拥有线程；
    /// 2. 在调用线程上轮询主体直到首次挂起；此后主体的每次唤醒都作为恢复工作项入队；
    /// 3. 逐个执行队列中的工作项，恢复工作项触发重新轮询主体；
    /// 4. 主体结束时关闭队列，继续执行剩余工作项直至队列排空；
    /// 5. 释放作用域并清除当前作用域引用，最后按结局返回：取消被吞掉，其余故障原样返回。
    ///
    /// # 契约说明（What）
    /// - 主体 future 只在调用线程上被轮询，无需 `Send`；
    /// - 返回时队列必定已关闭、作用域必定已释放（包括主体 panic 的展开路径）。
    pub fn run_phase<Fut>(&self, body: Fut) -> Result<(), AdapterError>
    where
        Fut: Future<Output = Result<(), AdapterError>>,
    {
        let scope = self.begin_scope()?;
        let outcome = {
            let _teardown = Teardown {
                context: self,
                scope: &scope,
            };
            pump(&scope, body)
        };
        match outcome {
            Err(AdapterError::Cancelled) => {
                debug!(cmdlet = %self.id, scope = scope.id(), "phase cancelled; suppressing at boundary");
                Ok(())
            }
            other => other,
        }
    }

    /// 释放上下文并从所属注册表中移除。
    ///
    /// 不要求处于 `Idle`：仍在进行的阶段的作用域引用在释放前被取出并取消，
    /// 该阶段随后自行拆除，并忽略 `end_scope` 的失败。
    pub fn dispose(&self) -> Result<(), AdapterError> {
        if let Some(orphan) = self.current.dispose_with(Option::take)? {
            debug!(cmdlet = %self.id, scope = orphan.id(), "context disposed during an active phase");
            if let Err(err) = orphan.cancel() {
                trace!(cmdlet = %self.id, error = %err, "orphaned scope already disposed");
            }
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(self.id);
        }
        debug!(cmdlet = %self.id, "execution adapter context disposed");
        Ok(())
    }

    fn active_scope(&self) -> Result<Arc<OperationScope>, AdapterError> {
        self.current.read()?.clone().ok_or_else(|| {
            AdapterError::invalid_operation("no operation scope is active for this context")
        })
    }
}

impl fmt::Debug for ExecutionAdapterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionAdapterContext")
            .field("id", &self.id)
            .field("label", &self.options.label)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn pump<Fut>(scope: &Arc<OperationScope>, body: Fut) -> Result<(), AdapterError>
where
    Fut: Future<Output = Result<(), AdapterError>>,
{
    let mut body = pin!(body);
    let waker = Waker::from(Arc::new(ResumeSignal::new(scope)));
    let mut cx = Context::from_waker(&waker);

    let mut outcome = match body.as_mut().poll(&mut cx) {
        Poll::Ready(result) => {
            scope.close_queue()?;
            Some(result)
        }
        Poll::Pending => None,
    };

    for item in scope.drain()? {
        match item.kind() {
            WorkKind::Resume => {
                scope.clear_resume();
                if outcome.is_some() {
                    continue;
                }
                if let Poll::Ready(result) = body.as_mut().poll(&mut cx) {
                    scope.close_queue()?;
                    outcome = Some(result);
                }
            }
            WorkKind::Action => item.execute(),
        }
    }

    match outcome {
        Some(Ok(())) => scope.take_unobserved_fault().map_or(Ok(()), Err),
        Some(err) => err,
        // 队列在主体结束前被关闭并排空，主体已无法再被恢复。
        None => Err(AdapterError::Cancelled),
    }
}

/// 阶段结束（含展开路径）时释放作用域并解除绑定。
struct Teardown<'a> {
    context: &'a ExecutionAdapterContext,
    scope: &'a Arc<OperationScope>,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.scope.dispose() {
            debug!(scope = self.scope.id(), error = %err, "scope already disposed");
        }
        if let Err(err) = self.context.end_scope() {
            debug!(cmdlet = %self.context.id, error = %err, "end_scope after context teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn context() -> Arc<ExecutionAdapterContext> {
        ExecutionAdapterContext::new(
            CmdletId::next(),
            AdapterOptions::default(),
            CancellationToken::none(),
        )
    }

    #[test]
    fn second_scope_is_rejected_until_the_first_ends() {
        let ctx = context();
        let first = ctx.begin_scope().expect("首个作用域应成功");
        let err = ctx.begin_scope().expect_err("重复开启应失败");
        assert!(matches!(err, AdapterError::InvalidOperation { .. }));

        first.dispose().expect("释放");
        ctx.end_scope().expect("结束");
        let second = ctx.begin_scope().expect("结束后可重新开启");
        second.dispose().expect("释放");
        ctx.end_scope().expect("结束");
    }

    #[test]
    fn idle_context_exposes_a_non_cancellable_token() {
        let ctx = context();
        let token = ctx.cancellation_token().expect("未释放");
        assert!(!token.can_be_cancelled());
        ctx.cancel();
        let err = ctx
            .request_operation(|| Ok(()), false, None)
            .expect_err("无活动作用域时不可请求");
        assert!(matches!(err, AdapterError::InvalidOperation { .. }));
    }

    #[test]
    fn cancel_after_dispose_is_swallowed() {
        let ctx = context();
        ctx.dispose().expect("释放");
        ctx.cancel();
        assert!(ctx.cancellation_token().unwrap_err().is_disposed());
        assert!(ctx.begin_scope().unwrap_err().is_disposed());
    }

    #[test]
    fn phase_body_that_completes_synchronously_needs_no_pumping() {
        let ctx = context();
        ctx.run_phase(async { Ok(()) }).expect("同步完成的主体应成功");
        assert!(ctx.current_scope().expect("未释放").is_none());
    }

    #[traced_test]
    #[test]
    fn cancellation_is_suppressed_and_logged_at_the_boundary() {
        let ctx = context();
        let token_source = Arc::clone(&ctx);
        ctx.run_phase(async move {
            token_source.cancel();
            token_source.cancellation_token()?.check()
        })
        .expect("取消不应作为故障返回");
        assert!(logs_contain("phase cancelled; suppressing at boundary"));
        assert!(logs_contain("operation scope disposed"));
    }
    #[traced_test]
    #[test]
    fn failed_post_surfaces_after_a_successful_body() {
        let ctx = context();
        let err = ctx
            .run_phase(async {
                let ambient = crate::QueueingExecutionContext::current()
                    .ok_or_else(|| AdapterError::invalid_operation("no ambient context"))?;
                ambient.post(|| panic!("posted callback exploded"))?;
                ambient.post(|| panic!("second failure is only logged"))?;
                Ok(())
            })
            .expect_err("投递回调的故障不应被吞掉");
        let fault = err.as_fault().expect("应为故障");
        assert_eq!(
            fault
                .downcast_ref::<crate::PanicFault>()
                .map(crate::PanicFault::message),
            Some("posted callback exploded"),
            "返回首个未被观察的故障"
        );
        assert!(logs_contain("posted callback failed"));
    }

    #[test]
    fn dispose_during_a_phase_releases_and_cancels_the_scope() {
        let ctx = context();
        let scope = ctx.begin_scope().expect("开启");
        ctx.dispose().expect("阶段进行中也可释放上下文");

        assert_eq!(Arc::strong_count(&scope), 1, "已释放的上下文不应继续持有作用域");
        assert!(scope.token().is_cancelled(), "滞留的阶段应被取消");
        assert!(ctx.end_scope().unwrap_err().is_disposed());
        scope.dispose().expect("作用域仍由阶段自行释放");
    }
}
