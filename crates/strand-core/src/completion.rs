//! 工作项完成句柄。
//!
//! # 教案式说明
//! - **意图（Why）**：请求方需要确认宿主操作“已经在拥有线程上执行完毕”再继续，
//!   例如等待一次进度写入真正到达宿主；等待方既可能是 `async` 代码，也可能是被阻塞的外部线程；
//! - **逻辑（How）**：共享槽位由互斥锁保护，完成时同时唤醒条件变量（阻塞等待方）与
//!   [`AtomicWaker`]（异步等待方）；
//! - **契约（What）**：
//!   - 生产端 [`Completer`] 未完成即被析构时，结果视为 [`AdapterError::Cancelled`]，
//!     因而被丢弃的工作项不会让等待方永久挂起；
//!   - 结果只能被取走一次。

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};

use crate::error::AdapterError;

enum Slot<T> {
    Pending,
    Ready(Result<T, AdapterError>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    waker: AtomicWaker,
}

impl<T> Shared<T> {
    fn resolve(&self, result: Result<T, AdapterError>) {
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Pending) {
                return;
            }
            *slot = Slot::Ready(result);
        }
        self.ready.notify_all();
        self.waker.wake();
    }

    fn take(slot: &mut Slot<T>) -> Option<Result<T, AdapterError>> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(result) => Some(result),
            Slot::Pending => {
                *slot = Slot::Pending;
                None
            }
            Slot::Taken => Some(Err(AdapterError::invalid_operation(
                "completion result was already taken",
            ))),
        }
    }
}

/// 工作项结果的等待句柄。
#[must_use = "a Completion reports whether the host operation succeeded"]
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Completion<T> {
    /// 生成一对未完成的句柄。
    pub(crate) fn pair() -> (Completer<T>, Completion<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
            waker: AtomicWaker::new(),
        });
        (
            Completer {
                shared: Some(Arc::clone(&shared)),
            },
            Completion { shared },
        )
    }

    /// 已完成的句柄，用于拥有线程上的内联执行路径。
    pub fn ready(result: Result<T, AdapterError>) -> Self {
        let (completer, completion) = Self::pair();
        completer.complete(result);
        completion
    }

    /// 结果是否已经产生。
    pub fn is_completed(&self) -> bool {
        !matches!(*self.shared.slot.lock(), Slot::Pending)
    }

    /// 阻塞当前线程直到结果产生。
    ///
    /// 在拥有线程上对仍在排队的工作项调用此方法会造成死锁：拥有线程正是执行该工作项的唯一线程。
    pub fn wait(self) -> Result<T, AdapterError> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = Shared::take(&mut slot) {
                return result;
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// 带上限的阻塞等待；超时返回 [`AdapterError::Timeout`]，工作项本身不受影响。
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, AdapterError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = Shared::take(&mut slot) {
                return result;
            }
            if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                return Shared::take(&mut slot).unwrap_or(Err(AdapterError::Timeout {
                    waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }));
            }
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, AdapterError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.shared.waker.register(cx.waker());
        let mut slot = self.shared.slot.lock();
        match Shared::take(&mut slot) {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// 完成句柄的生产端，随工作项一同入队。
pub(crate) struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(mut self, result: Result<T, AdapterError>) {
        if let Some(shared) = self.shared.take() {
            shared.resolve(result);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.resolve(Err(AdapterError::Cancelled));
        }
    }
}
