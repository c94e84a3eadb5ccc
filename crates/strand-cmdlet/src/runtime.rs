//! # CmdletRuntime：宿主输出的线程安全门面
//!
//! ## 意图（Why）
//! - 阶段主体及其派生的后台任务可能运行在任意线程，但宿主只能在拥有线程上调用；
//! - 本类型把每个宿主操作包装成一次 `request_function`，让调用方无需关心所在线程。
//!
//! ## 契约（What）
//! - 每个包装方法都返回 [`Completion`]，解析为宿主调用的结果；
//! - 作用域令牌已取消时立即返回 `Err(Cancelled)`，不再产生新的宿主写入；
//! - 默认以排队方式提交；[`Dispatch::synchronous`] 在拥有线程上内联执行，在其他线程上阻塞等待；
//! - 无活动阶段时返回 `InvalidOperation`，上下文释放后返回 `Disposed`。
//!
//! ## 风险（Trade-offs）
//! - 宿主以互斥锁保护，动作执行期间持锁；在 [`CmdletRuntime::with_host`] 的闭包内
//!   再次同步调用同一运行时属于重入，内层调用以 `InvalidOperation` 失败。

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use strand_core::{AdapterError, CancellationToken, CmdletId, Completion, ExecutionAdapterContext};

use crate::{
    host::{CommandHost, HostError},
    records::{ErrorRecord, InformationRecord, ProgressRecord},
};

/// 单次请求的提交方式。
#[derive(Clone, Debug, Default)]
pub struct Dispatch {
    synchronous: bool,
    token: Option<CancellationToken>,
}

impl Dispatch {
    /// 排队提交，由泵在拥有线程上按序执行。
    pub fn queued() -> Self {
        Self::default()
    }

    /// 同步提交：拥有线程上内联执行，其他线程上阻塞至执行完毕。
    pub fn synchronous() -> Self {
        Self {
            synchronous: true,
            token: None,
        }
    }

    /// 附加调用方令牌；令牌在执行前被取消时该请求被跳过。
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    pub fn token(&self) -> Option<&CancellationToken> {
        self.token.as_ref()
    }
}

/// 面向阶段主体的宿主门面。
pub struct CmdletRuntime<H: CommandHost> {
    context: Arc<ExecutionAdapterContext>,
    host: Arc<Mutex<H>>,
    dispatch: Dispatch,
}

impl<H: CommandHost> Clone for CmdletRuntime<H> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            host: Arc::clone(&self.host),
            dispatch: self.dispatch.clone(),
        }
    }
}

impl<H: CommandHost> fmt::Debug for CmdletRuntime<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdletRuntime")
            .field("cmdlet", &self.context.id())
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

impl<H: CommandHost> CmdletRuntime<H> {
    pub(crate) fn new(context: Arc<ExecutionAdapterContext>, host: H) -> Self {
        Self {
            context,
            host: Arc::new(Mutex::new(host)),
            dispatch: Dispatch::default(),
        }
    }

    /// 以另一种提交方式复制运行时。
    pub fn with(&self, dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            ..self.clone()
        }
    }

    pub fn cmdlet_id(&self) -> CmdletId {
        self.context.id()
    }

    pub fn context(&self) -> &Arc<ExecutionAdapterContext> {
        &self.context
    }

    /// 当前阶段的取消令牌；空闲时返回不可取消的令牌。
    pub fn cancellation(&self) -> Result<CancellationToken, AdapterError> {
        self.context.cancellation_token()
    }

    pub fn write_object(&self, output: H::Output) -> Result<Completion<()>, AdapterError> {
        self.call(move |host| host.write_object(output))
    }

    pub fn write_error(&self, record: ErrorRecord) -> Result<Completion<()>, AdapterError> {
        self.call(move |host| host.write_error(record))
    }

    pub fn write_warning(&self, message: impl Into<String>) -> Result<Completion<()>, AdapterError> {
        let message = message.into();
        self.call(move |host| host.write_warning(message))
    }

    pub fn write_verbose(&self, message: impl Into<String>) -> Result<Completion<()>, AdapterError> {
        let message = message.into();
        self.call(move |host| host.write_verbose(message))
    }

    pub fn write_debug(&self, message: impl Into<String>) -> Result<Completion<()>, AdapterError> {
        let message = message.into();
        self.call(move |host| host.write_debug(message))
    }

    pub fn write_progress(&self, record: ProgressRecord) -> Result<Completion<()>, AdapterError> {
        self.call(move |host| host.write_progress(record))
    }

    pub fn write_information(
        &self,
        record: InformationRecord,
    ) -> Result<Completion<()>, AdapterError> {
        self.call(move |host| host.write_information(record))
    }

    /// 在拥有线程上询问宿主是否对 `target` 执行 `action`。
    pub fn should_process(
        &self,
        target: impl Into<String>,
        action: impl Into<String>,
    ) -> Result<Completion<bool>, AdapterError> {
        let (target, action) = (target.into(), action.into());
        self.call(move |host| host.should_process(&target, &action))
    }

    pub fn should_continue(
        &self,
        query: impl Into<String>,
        caption: impl Into<String>,
    ) -> Result<Completion<bool>, AdapterError> {
        let (query, caption) = (query.into(), caption.into());
        self.call(move |host| host.should_continue(&query, &caption))
    }

    /// 在拥有线程上以宿主执行任意闭包，用于包装方法未覆盖的宿主能力。
    pub fn with_host<T, F>(&self, f: F) -> Result<Completion<T>, AdapterError>
    where
        T: Send + 'static,
        F: FnOnce(&mut H) -> Result<T, AdapterError> + Send + 'static,
    {
        self.cancellation()?.check()?;
        let host = Arc::clone(&self.host);
        self.context.request_function(
            move || {
                // 宿主调用只发生在拥有线程上，锁被占用只可能是同一线程的重入。
                let Some(mut host) = host.try_lock() else {
                    return Err(AdapterError::InvalidOperation {
                        reason: "the host is already in use by an enclosing host call".into(),
                    });
                };
                f(&mut host)
            },
            self.dispatch.synchronous,
            self.dispatch.token.as_ref(),
        )
    }

    fn call<T, F>(&self, f: F) -> Result<Completion<T>, AdapterError>
    where
        T: Send + 'static,
        F: FnOnce(&mut H) -> Result<T, HostError> + Send + 'static,
    {
        self.with_host(move |host| f(host).map_err(AdapterError::from))
    }
}
