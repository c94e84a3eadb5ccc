//! 线程环境钩子。
//!
//! 这是整个适配器中唯一读取线程局部状态的位置：作用域开始时在拥有线程上登记自己的
//! [`QueueingExecutionContext`]，并记下此前的登记值；作用域释放时恢复。其余逻辑一律显式传参。

use std::{cell::RefCell, thread::ThreadId};

use crate::queueing::QueueingExecutionContext;

thread_local! {
    static CURRENT: RefCell<Option<QueueingExecutionContext>> = const { RefCell::new(None) };
}

/// 作用域开始前的线程环境快照。
#[derive(Debug)]
pub(crate) struct AmbientSnapshot {
    thread: ThreadId,
    previous: Option<QueueingExecutionContext>,
}

impl AmbientSnapshot {
    pub(crate) fn thread(&self) -> ThreadId {
        self.thread
    }
}

/// 在当前线程登记 `context`，返回用于恢复的快照。
pub(crate) fn install(context: QueueingExecutionContext) -> AmbientSnapshot {
    let previous = CURRENT.with(|slot| slot.replace(Some(context)));
    AmbientSnapshot {
        thread: std::thread::current().id(),
        previous,
    }
}

/// 恢复快照。调用方需保证处于快照所属线程。
pub(crate) fn restore(snapshot: AmbientSnapshot) {
    CURRENT.with(|slot| {
        *slot.borrow_mut() = snapshot.previous;
    });
}

/// 当前线程登记的执行上下文。
///
/// 作用域在其他线程上被释放时无法恢复本线程的登记，此处发现登记已失效即清空。
pub(crate) fn current() -> Option<QueueingExecutionContext> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.as_ref().is_some_and(|context| !context.is_live()) {
            *slot = None;
        }
        slot.clone()
    })
}
