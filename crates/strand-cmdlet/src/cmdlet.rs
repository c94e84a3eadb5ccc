//! # AsyncCmdlet 与 CmdletAdapter
//!
//! ## 意图（Why）
//! - 宿主以同步方式依次调用 `begin_processing`、`process_record`（每条输入一次）与
//!   `end_processing`；命令作者希望以 `async` 编写这些阶段；
//! - [`CmdletAdapter`] 把每个同步钩子转换为一次 `run_phase`：阶段主体在拥有线程上被轮询，
//!   主体中 `await` 的其他线程工作通过 [`CmdletRuntime`] 把宿主写入送回拥有线程。
//!
//! ## 契约（What）
//! - 三个阶段默认实现均为立即成功；
//! - 阶段内的取消（宿主调用 `stop_processing`）在钩子边界被吞掉，钩子正常返回；
//! - 用户故障原样返回给宿主；
//! - `dispose` 可在 `Drop` 中安全调用，上下文已释放时的错误被吞掉。

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use strand_core::{AdapterError, AdapterOptions, CancellationToken, CmdletId, ExecutionAdapterContext};
use tracing::{Instrument, debug, debug_span, trace};

use crate::{host::CommandHost, runtime::CmdletRuntime};

/// 以 `async` 编写的命令。
///
/// 阶段 future 只在拥有线程上被轮询，因此不要求 `Send`；
/// 需要在其他线程上运行的计算应交给外部运行时，并通过 [`CmdletRuntime`] 写回宿主。
#[async_trait(?Send)]
pub trait AsyncCmdlet: 'static {
    /// 命令写入的宿主类型。
    type Host: CommandHost;

    async fn begin_processing(
        &mut self,
        runtime: &CmdletRuntime<Self::Host>,
    ) -> Result<(), AdapterError> {
        let _ = runtime;
        Ok(())
    }

    async fn process_record(
        &mut self,
        runtime: &CmdletRuntime<Self::Host>,
    ) -> Result<(), AdapterError> {
        let _ = runtime;
        Ok(())
    }

    async fn end_processing(
        &mut self,
        runtime: &CmdletRuntime<Self::Host>,
    ) -> Result<(), AdapterError> {
        let _ = runtime;
        Ok(())
    }
}

/// 宿主生命周期阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Begin,
    Process,
    End,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Begin => "begin_processing",
            Phase::Process => "process_record",
            Phase::End => "end_processing",
        })
    }
}

/// 可跨线程持有的停止句柄，供宿主在处理线程之外调用 `stop_processing`。
#[derive(Clone)]
pub struct StopHandle {
    context: Arc<ExecutionAdapterContext>,
}

impl StopHandle {
    /// 取消当前阶段；无活动阶段或上下文已释放时为空操作。
    pub fn stop(&self) {
        self.context.cancel();
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("cmdlet", &self.context.id())
            .finish()
    }
}

/// 把 [`AsyncCmdlet`] 接入同步宿主生命周期的适配器。
///
/// # 教案式说明
/// - **意图 (Why)**：宿主只认识同步钩子，适配器负责为每个钩子开启作用域、泵送工作并拆除；
/// - **契约 (What)**：
///   - 钩子必须在同一拥有线程上依次调用，调用线程即该阶段的拥有线程；
///   - 宿主在两次 `process_record` 之间可通过 [`CmdletAdapter::cmdlet_mut`] 绑定输入；
///   - 释放后再调用任何钩子返回 `Disposed`；
/// - **风险 (Trade-offs)**：`Drop` 时会释放上下文，仍持有 [`StopHandle`] 的一方此后调用 `stop` 为空操作。
pub struct CmdletAdapter<C: AsyncCmdlet> {
    cmdlet: C,
    runtime: CmdletRuntime<C::Host>,
}

impl<C: AsyncCmdlet> CmdletAdapter<C> {
    /// 以独立上下文和默认配置创建适配器。
    pub fn new(cmdlet: C, host: C::Host) -> Self {
        let context = ExecutionAdapterContext::new(
            CmdletId::next(),
            AdapterOptions::default(),
            CancellationToken::none(),
        );
        Self::with_context(cmdlet, host, context)
    }

    /// 以外部提供的上下文创建适配器，通常来自 [`strand_core::ContextRegistry::context_for`]。
    pub fn with_context(cmdlet: C, host: C::Host, context: Arc<ExecutionAdapterContext>) -> Self {
        trace!(cmdlet = %context.id(), "cmdlet adapter created");
        Self {
            cmdlet,
            runtime: CmdletRuntime::new(context, host),
        }
    }

    pub fn id(&self) -> CmdletId {
        self.runtime.cmdlet_id()
    }

    pub fn cmdlet(&self) -> &C {
        &self.cmdlet
    }

    pub fn cmdlet_mut(&mut self) -> &mut C {
        &mut self.cmdlet
    }

    pub fn runtime(&self) -> &CmdletRuntime<C::Host> {
        &self.runtime
    }

    pub fn begin_processing(&mut self) -> Result<(), AdapterError> {
        self.run(Phase::Begin)
    }

    pub fn process_record(&mut self) -> Result<(), AdapterError> {
        self.run(Phase::Process)
    }

    pub fn end_processing(&mut self) -> Result<(), AdapterError> {
        self.run(Phase::End)
    }

    /// 取消正在进行的阶段。
    pub fn stop_processing(&self) {
        self.runtime.context().cancel();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            context: Arc::clone(self.runtime.context()),
        }
    }

    /// 释放上下文；重复释放被忽略。
    pub fn dispose(&self) {
        match self.runtime.context().dispose() {
            Ok(()) => debug!(cmdlet = %self.id(), "cmdlet adapter disposed"),
            Err(err) if err.is_disposed() => {}
            Err(err) => debug!(cmdlet = %self.id(), error = %err, "dispose failed"),
        }
    }

    fn run(&mut self, phase: Phase) -> Result<(), AdapterError> {
        let Self { cmdlet, runtime } = self;
        let span = debug_span!("phase", cmdlet = %runtime.cmdlet_id(), %phase);
        let _entered = span.enter();
        let context = Arc::clone(runtime.context());
        let outcome = match phase {
            Phase::Begin => context.run_phase(cmdlet.begin_processing(runtime).in_current_span()),
            Phase::Process => context.run_phase(cmdlet.process_record(runtime).in_current_span()),
            Phase::End => context.run_phase(cmdlet.end_processing(runtime).in_current_span()),
        };
        if let Err(err) = &outcome {
            debug!(error = %err, "phase failed");
        }
        outcome
    }
}

impl<C: AsyncCmdlet> Drop for CmdletAdapter<C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<C: AsyncCmdlet> fmt::Debug for CmdletAdapter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdletAdapter")
            .field("cmdlet", &self.id())
            .finish_non_exhaustive()
    }
}
