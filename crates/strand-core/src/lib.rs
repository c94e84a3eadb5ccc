#![deny(unsafe_code)]
#![doc = "strand-core: 单拥有线程执行适配器。"]
#![doc = ""]
#![doc = "宿主只允许一条线程（拥有线程）触碰其对象，而用户的异步代码可以在任意线程上恢复。"]
#![doc = "本 crate 以“作用域 + 阻塞队列 + 泵循环”把所有宿主可见的副作用按提交顺序交还拥有线程执行，"]
#![doc = "同时保留取消传播与释放语义。"]
#![doc = ""]
#![doc = "```"]
#![doc = "use strand_core::{AdapterOptions, CancellationToken, CmdletId, ExecutionAdapterContext};"]
#![doc = ""]
#![doc = "let context = ExecutionAdapterContext::new(CmdletId::next(), AdapterOptions::default(), CancellationToken::none());"]
#![doc = "let scope_context = context.clone();"]
#![doc = "context"]
#![doc = "    .run_phase(async move {"]
#![doc = "        scope_context.request_operation(|| Ok(()), false, None)?.await"]
#![doc = "    })"]
#![doc = "    .expect(\"phase should succeed\");"]
#![doc = "```"]

mod ambient;
pub mod cancellation;
pub mod completion;
pub mod context;
pub mod error;
pub mod options;
pub mod queue;
pub mod queueing;
pub mod registry;
pub mod scope;
pub mod scoped_lock;

pub use cancellation::{Cancelled, CancellationSource, CancellationToken, Registration};
pub use completion::Completion;
pub use context::ExecutionAdapterContext;
pub use error::{AdapterError, BoxError, Fault, PanicFault};
pub use options::AdapterOptions;
pub use queue::{WorkItem, WorkKind};
pub use queueing::QueueingExecutionContext;
pub use registry::{CmdletId, ContextRegistry};
pub use scope::{Drain, OperationScope, ScopeStats};
pub use scoped_lock::{ReadScope, ScopedRwLock, WriteScope};
