//! 带释放语义的读写锁作用域。
//!
//! 读写守卫本身由 `parking_lot` 以 RAII 方式释放；本模块额外维护“已释放”标记，
//! 使锁的拥有者被拆除后，迟到的读取/写入以 [`AdapterError::Disposed`] 失败，而不是静默成功。

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::AdapterError;

/// 读作用域守卫。
pub type ReadScope<'a, T> = RwLockReadGuard<'a, T>;
/// 写作用域守卫。
pub type WriteScope<'a, T> = RwLockWriteGuard<'a, T>;

/// 可释放的读写锁。
///
/// - **契约 (What)**：`dispose` 会先取得写锁，等待全部在途守卫归还后再置位，
///   之后的 `read`/`write` 均返回 `Disposed`；重复 `dispose` 同样返回 `Disposed`。
#[derive(Debug)]
pub struct ScopedRwLock<T> {
    object: &'static str,
    disposed: AtomicBool,
    inner: RwLock<T>,
}

impl<T> ScopedRwLock<T> {
    /// 创建锁；`object` 为错误信息中使用的拥有者名称。
    pub fn new(object: &'static str, value: T) -> Self {
        Self {
            object,
            disposed: AtomicBool::new(false),
            inner: RwLock::new(value),
        }
    }

    /// 进入读作用域。
    pub fn read(&self) -> Result<ReadScope<'_, T>, AdapterError> {
        self.ensure_live()?;
        let guard = self.inner.read();
        // 等锁期间可能发生释放。
        self.ensure_live()?;
        Ok(guard)
    }

    /// 进入写作用域。
    pub fn write(&self) -> Result<WriteScope<'_, T>, AdapterError> {
        self.ensure_live()?;
        let guard = self.inner.write();
        self.ensure_live()?;
        Ok(guard)
    }

    /// 释放锁。
    pub fn dispose(&self) -> Result<(), AdapterError> {
        self.dispose_with(|_| ())
    }

    /// 在写锁内先以 `f` 处理受保护的值，再置位释放标记。
    ///
    /// 用于在释放前取出值中持有的资源，使其不随已释放的锁一同滞留。
    pub fn dispose_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, AdapterError> {
        let mut guard = self.inner.write();
        if self.disposed.load(Ordering::Acquire) {
            return Err(AdapterError::disposed(self.object));
        }
        let output = f(&mut guard);
        self.disposed.store(true, Ordering::Release);
        Ok(output)
    }

    /// 是否已释放。
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<(), AdapterError> {
        if self.is_disposed() {
            Err(AdapterError::disposed(self.object))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn read_and_write_scopes_guard_the_value() {
        let lock = ScopedRwLock::new("context", 1_u32);
        *lock.write().expect("未释放时可写") += 1;
        assert_eq!(*lock.read().expect("未释放时可读"), 2);
    }

    #[test]
    fn dispose_waits_for_readers_then_rejects_everything() {
        let lock = Arc::new(ScopedRwLock::new("context", ()));
        let reader = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _scope = lock.read().expect("释放前读取应成功");
                thread::sleep(Duration::from_millis(20));
            })
        };
        thread::sleep(Duration::from_millis(5));
        lock.dispose().expect("首次释放应成功");
        reader.join().expect("读线程不应 panic");

        assert!(lock.read().unwrap_err().is_disposed());
        assert!(lock.write().unwrap_err().is_disposed());
        assert!(lock.dispose().unwrap_err().is_disposed(), "重复释放应报告已释放");
    }
    #[test]
    fn dispose_with_takes_the_value_before_marking() {
        let lock = ScopedRwLock::new("context", Some(Arc::new(7_u32)));
        let taken = lock.dispose_with(Option::take).expect("首次释放应成功");
        assert_eq!(taken.as_deref(), Some(&7));
        assert!(lock.dispose_with(Option::take).unwrap_err().is_disposed());
    }
}
