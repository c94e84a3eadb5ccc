//! 取消原语，统一表达作用域、工作项与用户代码之间的可中断性契约。
//!
//! # 设计背景（Why）
//! - 每个作用域持有唯一的取消源；取消必须能唤醒阻塞在队列上的拥有线程，
//!   因此在原子位之外还需要回调注册能力；
//! - 调用方可以为单个工作项附带自己的令牌，此时需要“任一取消即取消”的链接令牌。
//!
//! # 逻辑解析（How）
//! - [`CancellationState`] 以 [`AtomicBool`] 记录状态，并以互斥保护的回调表支持注册/注销；
//! - `cancel` 首次成功时取出全部回调并在锁外执行，避免回调重入注册时死锁；
//! - [`Registration`] 析构即注销；[`CancellationSource::linked`] 通过注册实现链接，
//!   链接源析构即释放链接。
//!
//! # 契约说明（What）
//! - `cancel` 在首次触发时返回 `true`，重复调用返回 `false`；
//! - 在已取消的令牌上注册回调会立即在当前线程执行该回调；
//! - [`CancellationToken::none`] 永远不会被取消，`can_be_cancelled` 返回 `false`。

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use futures::task::AtomicWaker;
use parking_lot::Mutex;

use crate::error::AdapterError;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct CancellationState {
    flag: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

impl CancellationState {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn cancel(&self) -> bool {
        if self
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for (_, callback) in callbacks {
            callback();
        }
        true
    }

    fn register(self: &Arc<Self>, callback: Callback) -> Registration {
        {
            let mut callbacks = self.callbacks.lock();
            // 在锁内复查，保证与 `cancel` 取走回调表的动作互斥。
            if !self.is_cancelled() {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                callbacks.push((id, callback));
                return Registration {
                    state: Arc::downgrade(self),
                    id: Some(id),
                };
            }
        }
        callback();
        Registration::inert()
    }

    fn unregister(&self, id: u64) {
        let mut callbacks = self.callbacks.lock();
        if let Some(index) = callbacks.iter().position(|(slot, _)| *slot == id) {
            callbacks.swap_remove(index);
        }
    }
}

/// 取消源：唯一有权触发取消的一方。
///
/// - 克隆源共享同一状态；链接源额外持有对输入令牌的注册，析构时一并释放。
pub struct CancellationSource {
    state: Arc<CancellationState>,
    links: Vec<Registration>,
}

impl CancellationSource {
    /// 创建处于“未取消”状态的取消源。
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancellationState::new()),
            links: Vec::new(),
        }
    }

    /// 创建链接源：任一可取消的输入令牌被取消时，本源随之取消。
    ///
    /// # 契约说明（What）
    /// - 不可取消的输入（[`CancellationToken::none`]）被忽略；
    /// - 若某个输入已处于取消状态，返回的源立即处于取消状态；
    /// - 返回值析构时注销全部链接，输入令牌不会再持有本源的引用。
    pub fn linked(tokens: &[&CancellationToken]) -> Self {
        let mut source = Self::new();
        for token in tokens {
            let Some(parent) = token.state.as_ref() else {
                continue;
            };
            let weak = Arc::downgrade(&source.state);
            let registration = parent.register(Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    state.cancel();
                }
            }));
            source.links.push(registration);
        }
        source
    }

    /// 获取与本源绑定的令牌。
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// 将本源标记为取消，返回是否为首次触发。
    pub fn cancel(&self) -> bool {
        self.state.cancel()
    }

    /// 查询是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// 链接源当前持有的注册数量。
    pub fn link_count(&self) -> usize {
        self.links.iter().filter(|link| link.is_active()).count()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("cancelled", &self.is_cancelled())
            .field("links", &self.links.len())
            .finish()
    }
}

/// 取消令牌：只读视图，可自由克隆并跨线程传递。
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Option<Arc<CancellationState>>,
}

impl CancellationToken {
    /// 永不取消的令牌。
    pub const fn none() -> Self {
        Self { state: None }
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.is_cancelled())
    }

    /// 令牌是否可能被取消。
    pub fn can_be_cancelled(&self) -> bool {
        self.state.is_some()
    }

    /// 若已取消则返回 [`AdapterError::Cancelled`]，供用户代码以 `?` 做取消检查。
    pub fn check(&self) -> Result<(), AdapterError> {
        if self.is_cancelled() {
            Err(AdapterError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 注册取消回调。
    ///
    /// - 回调最多执行一次，执行线程为触发取消的线程；
    /// - 若令牌已取消，回调在当前线程立即执行，返回的注册处于失效状态；
    /// - 不可取消的令牌直接丢弃回调。
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.state {
            Some(state) => state.register(Box::new(callback)),
            None => Registration::inert(),
        }
    }

    /// 两个令牌是否来自同一取消源。
    pub fn same_source(&self, other: &CancellationToken) -> bool {
        match (&self.state, &other.state) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// 取消完成时就绪的 future。不可取消的令牌返回永远挂起的 future。
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
            waker: Arc::new(AtomicWaker::new()),
            registration: None,
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancellable", &self.can_be_cancelled())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// 回调注册句柄，析构即注销。
#[must_use = "dropping a Registration unregisters its callback"]
pub struct Registration {
    state: Weak<CancellationState>,
    id: Option<u64>,
}

impl Registration {
    fn inert() -> Self {
        Self {
            state: Weak::new(),
            id: None,
        }
    }

    fn is_active(&self) -> bool {
        self.id.is_some() && self.state.strong_count() > 0
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let (Some(id), Some(state)) = (self.id, self.state.upgrade()) {
            state.unregister(id);
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("active", &self.is_active())
            .finish()
    }
}

/// [`CancellationToken::cancelled`] 返回的 future。
pub struct Cancelled {
    token: CancellationToken,
    waker: Arc<AtomicWaker>,
    registration: Option<Registration>,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            return Poll::Ready(());
        }
        this.waker.register(cx.waker());
        if this.registration.is_none() {
            let waker = Arc::clone(&this.waker);
            this.registration = Some(this.token.register(move || waker.wake()));
        }
        if this.token.is_cancelled() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::atomic::AtomicUsize, thread};

    #[test]
    fn cancel_reports_first_transition_only() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());
        assert!(source.cancel(), "首次取消应返回 true");
        assert!(!source.cancel(), "重复取消应返回 false");
        assert!(token.is_cancelled());
        assert!(token.check().unwrap_err().is_cancelled());
    }

    #[test]
    fn callbacks_run_once_and_unregister_on_drop() {
        let source = CancellationSource::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let kept = {
            let hits = Arc::clone(&hits);
            source.token().register(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let dropped = {
            let hits = Arc::clone(&hits);
            source.token().register(move || {
                hits.fetch_add(10, Ordering::SeqCst);
            })
        };
        drop(dropped);

        source.cancel();
        source.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1, "已注销的回调不应执行");
        drop(kept);
    }

    #[test]
    fn registering_after_cancel_runs_inline() {
        let source = CancellationSource::new();
        source.cancel();
        let hit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hit);
        let registration = source.token().register(move || flag.store(true, Ordering::SeqCst));
        assert!(hit.load(Ordering::SeqCst));
        assert!(!registration.is_active());
    }

    #[test]
    fn linked_source_follows_any_parent_and_releases_links() {
        let scope = CancellationSource::new();
        let caller = CancellationSource::new();
        let linked = CancellationSource::linked(&[&scope.token(), &caller.token()]);
        assert_eq!(linked.link_count(), 2);

        caller.cancel();
        assert!(linked.is_cancelled(), "任一输入取消后链接源应取消");
        assert!(!scope.is_cancelled(), "链接不应反向传播");

        let other = CancellationSource::linked(&[&scope.token(), &CancellationToken::none()]);
        assert_eq!(other.link_count(), 1, "不可取消的输入应被忽略");
        drop(other);
        drop(linked);
        assert!(scope.state.callbacks.lock().is_empty(), "析构链接源应注销注册");
    }

    #[test]
    fn none_token_is_never_cancelled() {
        let token = CancellationToken::none();
        assert!(!token.can_be_cancelled());
        assert!(token.check().is_ok());
        let registration = token.register(|| panic!("不可取消的令牌不应执行回调"));
        assert!(!registration.is_active());
    }

    #[test]
    fn cancelled_future_wakes_across_threads() {
        let source = CancellationSource::new();
        let token = source.token();
        let waiter = thread::spawn(move || futures::executor::block_on(token.cancelled()));
        thread::sleep(std::time::Duration::from_millis(10));
        source.cancel();
        waiter.join().expect("等待线程应在取消后退出");
    }
}
