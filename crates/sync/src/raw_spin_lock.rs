//! 原始自旋锁实现
//!
//! 基于原子操作实现自旋锁机制。

use core::{
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

/// 不携带数据的自旋锁。
///
/// 不可重入 (即不能在持有锁时再次调用 `lock()`)。
///
/// 除了通过 [`SpinLock`](crate::SpinLock) 使用外，也可以经由
/// [`lock_api::RawMutex`] 显式加锁/解锁：
///
/// ```
/// use sync::{RawMutex, RawSpinLock};
///
/// let lock = RawSpinLock::new();
/// lock.lock();
/// assert!(lock.is_locked());
/// // SAFETY: 当前上下文持有锁
/// unsafe { lock.unlock() };
/// ```
#[derive(Debug)]
pub struct RawSpinLock {
    lock: AtomicBool,
}

impl RawSpinLock {
    /// 创建一个新的 RawSpinLock 实例。
    pub const fn new() -> Self {
        RawSpinLock {
            lock: AtomicBool::new(false),
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: lock/try_lock 以 Acquire 语义获取锁，unlock 以 Release 语义释放，
// 同一时刻至多一个上下文能够成功获取锁。
unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLock::new();

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // 只读自旋，避免在锁被占用时反复争抢缓存行
            while self.lock.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}
