//! 阻塞工作队列与工作项。
//!
//! # 教案式说明
//! - **意图（Why）**：拥有线程与其他线程之间唯一的交汇点；生产方来自任意线程，
//!   消费方固定为拥有线程上的泵循环；
//! - **逻辑（How）**：`VecDeque` + 关闭标记由同一把互斥锁保护，条件变量负责唤醒消费方；
//! - **契约（What）**：
//!   - FIFO，关闭后拒绝入队并把工作项原样退回给调用方；
//!   - 关闭且队列为空时消费结束；是否交付某个工作项由消费方（作用域）决定。

use std::{collections::VecDeque, fmt};

use parking_lot::{Condvar, Mutex};

use crate::cancellation::{CancellationSource, CancellationToken};

/// 工作项类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkKind {
    /// 恢复挂起的阶段主体：由泵循环在拥有线程上重新轮询主体 future。
    Resume,
    /// 用户或宿主包装层提交的动作。
    Action,
}

enum Job {
    Resume,
    Action(Box<dyn FnOnce() + Send + 'static>),
}

/// 队列中的单个待执行单元。
///
/// - 动作闭包内部持有完成句柄的生产端；工作项未执行即被丢弃时，等待方收到 `Cancelled`；
/// - `token` 为生效令牌：作用域令牌，或作用域与调用方令牌的链接令牌；
/// - 链接源随工作项一起析构，执行结束即释放链接。
pub struct WorkItem {
    id: u64,
    job: Job,
    token: CancellationToken,
    caller: Option<CancellationToken>,
    _link: Option<CancellationSource>,
}

impl WorkItem {
    pub(crate) fn resume(id: u64, token: CancellationToken) -> Self {
        Self {
            id,
            job: Job::Resume,
            token,
            caller: None,
            _link: None,
        }
    }

    pub(crate) fn action(
        id: u64,
        action: Box<dyn FnOnce() + Send + 'static>,
        scope_token: CancellationToken,
        caller: Option<CancellationToken>,
    ) -> Self {
        // 调用方令牌与作用域令牌不同且可取消时才需要链接。
        let caller = caller.filter(|t| t.can_be_cancelled() && !t.same_source(&scope_token));
        let (token, link) = match &caller {
            Some(caller_token) => {
                let link = CancellationSource::linked(&[&scope_token, caller_token]);
                (link.token(), Some(link))
            }
            None => (scope_token, None),
        };
        Self {
            id,
            job: Job::Action(action),
            token,
            caller,
            _link: link,
        }
    }

    /// 单调递增的工作项编号（同一作用域内）。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 工作项类别。
    pub fn kind(&self) -> WorkKind {
        match self.job {
            Job::Resume => WorkKind::Resume,
            Job::Action(_) => WorkKind::Action,
        }
    }

    /// 生效的取消令牌。
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// 在当前线程执行工作项。
    ///
    /// - 调用方自带的令牌已取消时不执行动作，等待方收到 `Cancelled`；
    ///   仅作用域取消不会跳过已入队的动作；
    /// - `Resume` 类别在此处为空操作，由泵循环负责轮询主体。
    pub fn execute(self) {
        let Self { job, caller, .. } = self;
        match job {
            Job::Resume => {}
            Job::Action(action) => {
                if caller.as_ref().is_some_and(CancellationToken::is_cancelled) {
                    return;
                }
                action();
            }
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<WorkItem>,
    closed: bool,
}

/// 无界、线程安全、可关闭的阻塞 FIFO。
#[derive(Default)]
pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 入队；队列已关闭时退回工作项。
    pub(crate) fn push(&self, item: WorkItem) -> Result<(), WorkItem> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// 标记不再接受新工作项，返回是否为首次关闭。
    pub(crate) fn close(&self) -> bool {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        self.available.notify_all();
        first
    }

    /// 关闭并取出所有尚未交付的工作项。
    pub(crate) fn close_and_take(&self) -> Vec<WorkItem> {
        let items = {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.available.notify_all();
        items
    }

    /// 阻塞取出下一个工作项；队列已关闭且为空时返回 `None`。
    pub(crate) fn pop(&self) -> Option<WorkItem> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
