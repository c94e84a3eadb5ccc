//! # OperationScope：拥有线程与其他线程之间的唯一协调点
//!
//! ## 角色定位（Why）
//! - 每次顶层异步调用（一个生命周期阶段）对应一个作用域，持有工作队列、取消源与拥有线程标识；
//! - 拥有线程在泵循环中消费队列，其余线程只能通过 [`OperationScope::request_operation`] 生产工作项。
//!
//! ## 行为契约（What）
//! - 拥有线程发起的同步请求内联执行，不经过队列；其余请求一律入队，
//!   若为同步请求则调用线程阻塞到该工作项执行完毕；
//! - 队列关闭后入队返回 `InvalidOperation`；作用域释放后任何操作返回 `Disposed`；
//! - 排队动作的失败只投递给该工作项自己的 [`Completion`]，不会抛进泵循环。
//!
//! ## 风险提示（Trade-offs）
//! - 非拥有线程的同步请求默认无限等待：若拥有线程此时正阻塞等待该调用方，将形成死锁。
//!   可通过 [`AdapterOptions::send_timeout_ms`] 设置上限。

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    ambient::{self, AmbientSnapshot},
    cancellation::{CancellationSource, CancellationToken, Registration},
    completion::Completion,
    error::{AdapterError, Fault},
    options::AdapterOptions,
    queue::{WorkItem, WorkKind, WorkQueue},
    queueing::QueueingExecutionContext,
};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// 作用域计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScopeStats {
    /// 进入队列的动作数。
    pub enqueued: u64,
    /// 在拥有线程上内联执行的同步请求数。
    pub inline: u64,
    /// 泵循环已交付的动作数。
    pub delivered: u64,
    /// 因取消被丢弃或在释放时被放弃的动作数。
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    inline: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// 单次阶段调用的队列与取消状态。
pub struct OperationScope {
    id: u64,
    owner: ThreadId,
    options: AdapterOptions,
    queue: WorkQueue,
    cancellation: CancellationSource,
    token: CancellationToken,
    cancel_hook: Mutex<Option<Registration>>,
    cancel_cutoff: AtomicU64,
    unobserved_fault: Mutex<Option<AdapterError>>,
    ambient: Mutex<Option<AmbientSnapshot>>,
    disposed: AtomicBool,
    resume_scheduled: AtomicBool,
    next_item: AtomicU64,
    counters: Counters,
}

impl OperationScope {
    /// 在当前线程上开启作用域。
    ///
    /// # 契约说明（What）
    /// - 当前线程成为拥有线程；
    /// - 取消源链接到 `parent`（若可取消），`parent` 取消时作用域随之取消；
    /// - 当前线程登记本作用域的 [`QueueingExecutionContext`]，此前的登记值保存在快照中，释放时恢复。
    pub fn begin(parent: &CancellationToken, options: AdapterOptions) -> Arc<Self> {
        let cancellation = CancellationSource::linked(&[parent]);
        let token = cancellation.token();
        let scope = Arc::new(Self {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            owner: thread::current().id(),
            options,
            queue: WorkQueue::new(),
            cancellation,
            token: token.clone(),
            cancel_hook: Mutex::new(None),
            cancel_cutoff: AtomicU64::new(u64::MAX),
            unobserved_fault: Mutex::new(None),
            ambient: Mutex::new(None),
            disposed: AtomicBool::new(false),
            resume_scheduled: AtomicBool::new(false),
            next_item: AtomicU64::new(0),
            counters: Counters::default(),
        });

        let weak_scope = Arc::downgrade(&scope);
        let hook = token.register(move || {
            if let Some(scope) = weak_scope.upgrade() {
                scope.mark_cancelled();
            }
        });
        *scope.cancel_hook.lock() = Some(hook);
        *scope.ambient.lock() = Some(ambient::install(QueueingExecutionContext::new(&scope)));

        debug!(
            scope = scope.id,
            adapter = %scope.options.label,
            "operation scope opened"
        );
        scope
    }

    /// 作用域编号。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 拥有线程标识。
    pub fn owner_thread(&self) -> ThreadId {
        self.owner
    }

    /// 调用线程是否为拥有线程。
    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// 作用域取消令牌。
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// 当前排队深度。
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// 队列是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// 是否已释放。
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// 计数快照。
    pub fn stats(&self) -> ScopeStats {
        ScopeStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            inline: self.counters.inline.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// 请求在拥有线程上执行无返回值的动作。
    ///
    /// 等价于 `T = ()` 的 [`OperationScope::request_function`]。
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

    /// 请求在拥有线程上执行动作并取回其结果。
    ///
    /// # 契约说明（What）
    /// - `execute_synchronously && 拥有线程`：立即内联执行，返回已完成的句柄；
    /// - 其余情况：入队，返回在动作执行完毕（成功、失败或取消）时完成的句柄；
    ///   `execute_synchronously` 且来自其他线程时，入队后阻塞到完成，再返回已完成的句柄；
    /// - `token` 为调用方令牌：与作用域令牌不同且可取消时，工作项使用二者的链接令牌；
    /// - 队列已关闭返回 `InvalidOperation`，作用域已释放返回 `Disposed`。
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
        self.ensure_live()?;

        if execute_synchronously && self.is_owner_thread() {
            self.counters.inline.fetch_add(1, Ordering::Relaxed);
            trace!(scope = self.id, "executing request inline on owner thread");
            return Ok(Completion::ready(invoke(action, self.options.capture_panics)));
        }

        let (completer, completion) = Completion::pair();
        let capture_panics = self.options.capture_panics;
        let job = Box::new(move || completer.complete(invoke(action, capture_panics)));
        let id = self.next_item.fetch_add(1, Ordering::Relaxed);
        let item = WorkItem::action(id, job, self.token.clone(), token.cloned());

        if let Err(rejected) = self.queue.push(item) {
            drop(rejected);
            return Err(AdapterError::invalid_operation(
                "the operation queue no longer accepts work",
            ));
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        trace!(scope = self.id, item = id, sync = execute_synchronously, "work item queued");

        if !execute_synchronously {
            return Ok(completion);
        }
        let result = match self.options.send_timeout() {
            Some(limit) => completion.wait_timeout(limit),
            None => completion.wait(),
        };
        if let Err(AdapterError::Timeout { waited_ms }) = &result {
            warn!(
                scope = self.id,
                item = id,
                waited_ms, "synchronous request timed out waiting for the owner thread"
            );
        }
        Ok(Completion::ready(result))
    }

    /// 标记队列不再接受新工作项。重复关闭为空操作。
    pub fn close_queue(&self) -> Result<(), AdapterError> {
        self.ensure_live()?;
        if self.queue.close() {
            debug!(scope = self.id, pending = self.queue.len(), "operation queue closed");
        }
        Ok(())
    }

    /// 阻塞式消费队列的迭代器。
    ///
    /// 队列关闭且为空时结束。队列关闭后，取消之后才入队的工作项不再交付，
    /// 其等待方收到 `Cancelled`；取消之前已入队的工作项照常交付。
    pub fn drain(&self) -> Result<Drain<'_>, AdapterError> {
        self.ensure_live()?;
        Ok(Drain { scope: self })
    }

    /// 触发作用域取消，返回是否为首次触发。
    pub fn cancel(&self) -> Result<bool, AdapterError> {
        self.ensure_live()?;
        let first = self.cancellation.cancel();
        if first {
            debug!(scope = self.id, "operation scope cancelled");
        }
        Ok(first)
    }

    /// 释放作用域。
    ///
    /// - 第二次调用返回 `Disposed`；
    /// - 关闭队列并放弃尚未交付的工作项，其等待方收到 `Cancelled`；
    /// - 在拥有线程上恢复作用域开始前的线程环境登记。
    pub fn dispose(&self) -> Result<(), AdapterError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(AdapterError::disposed("operation scope"));
        }

        let abandoned = self.queue.close_and_take();
        if !abandoned.is_empty() {
            self.counters
                .dropped
                .fetch_add(abandoned.len() as u64, Ordering::Relaxed);
            debug!(scope = self.id, abandoned = abandoned.len(), "abandoning queued work");
        }
        drop(abandoned);
        drop(self.cancel_hook.lock().take());

        if let Some(snapshot) = self.ambient.lock().take() {
            if snapshot.thread() == thread::current().id() {
                ambient::restore(snapshot);
            } else {
                warn!(scope = self.id, "scope disposed off its owner thread; ambient slot is cleared on its next read");
            }
        }

        debug!(scope = self.id, stats = ?self.stats(), "operation scope disposed");
        Ok(())
    }

    pub(crate) fn schedule_resume(&self) {
        if self.resume_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = self.next_item.fetch_add(1, Ordering::Relaxed);
        if self.queue.push(WorkItem::resume(id, self.token.clone())).is_err() {
            // 主体已结束或作用域已释放。
            self.resume_scheduled.store(false, Ordering::Release);
        }
    }

    pub(crate) fn clear_resume(&self) {
        self.resume_scheduled.store(false, Ordering::Release);
    }

    pub(crate) fn note_dropped(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// 发后即忘地入队：动作的失败无人等待，记入作用域，由泵循环在主体成功后返回。
    pub(crate) fn post<F>(self: &Arc<Self>, action: F) -> Result<(), AdapterError>
    where
        F: FnOnce() -> Result<(), AdapterError> + Send + 'static,
    {
        let scope = Arc::downgrade(self);
        let capture_panics = self.options.capture_panics;
        let _completion = self.request_operation(
            move || {
                let result = invoke(action, capture_panics);
                if let (Err(err), Some(scope)) = (&result, scope.upgrade()) {
                    scope.note_unobserved_fault(err);
                }
                result
            },
            false,
            None,
        )?;
        Ok(())
    }

    /// 取走首个无人观察的投递故障。
    pub(crate) fn take_unobserved_fault(&self) -> Option<AdapterError> {
        self.unobserved_fault.lock().take()
    }

    fn note_unobserved_fault(&self, err: &AdapterError) {
        if err.is_cancelled() {
            return;
        }
        warn!(scope = self.id, error = %err, "posted callback failed");
        self.unobserved_fault.lock().get_or_insert_with(|| err.clone());
    }

    /// 记录取消时刻：此后分配编号的工作项在队列关闭后不再交付。
    fn mark_cancelled(&self) {
        let cutoff = self.next_item.load(Ordering::Acquire);
        let _ = self.cancel_cutoff.compare_exchange(
            u64::MAX,
            cutoff,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn is_abandoned(&self, item: &WorkItem) -> bool {
        item.id() >= self.cancel_cutoff.load(Ordering::Acquire) && self.queue.is_closed()
    }

    fn ensure_live(&self) -> Result<(), AdapterError> {
        if self.is_disposed() {
            Err(AdapterError::disposed("operation scope"))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for OperationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationScope")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("pending", &self.pending())
            .field("cancelled", &self.token.is_cancelled())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn invoke<T, F>(action: F, capture_panics: bool) -> Result<T, AdapterError>
where
    F: FnOnce() -> Result<T, AdapterError>,
{
    if !capture_panics {
        return action();
    }
    catch_unwind(AssertUnwindSafe(action))
        .unwrap_or_else(|payload| Err(AdapterError::Fault(Fault::from_panic(payload.as_ref()))))
}

/// [`OperationScope::drain`] 返回的阻塞迭代器。
#[derive(Debug)]
pub struct Drain<'a> {
    scope: &'a OperationScope,
}

impl Iterator for Drain<'_> {
    type Item = WorkItem;

    fn next(&mut self) -> Option<WorkItem> {
        loop {
            let item = self.scope.queue.pop()?;
            let is_action = item.kind() == WorkKind::Action;
            if self.scope.is_abandoned(&item) {
                if is_action {
                    self.scope.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                trace!(scope = self.scope.id, item = item.id(), "work item abandoned after cancellation");
                continue;
            }
            if is_action {
                self.scope.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            trace!(scope = self.scope.id, item = item.id(), kind = ?item.kind(), "work item delivered");
            return Some(item);
        }
    }
}
