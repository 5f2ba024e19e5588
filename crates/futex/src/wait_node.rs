//! 等待节点
//!
//! 每个阻塞在 futex 上的调用者对应一个 [`WaitNode`]。节点由等待者持有，
//! futex 队列中只保存它的共享句柄；节点里记录它当前所在的 futex 对象，
//! 被 requeue 移动后等待者依靠它找到需要重新加锁的对象。

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use sync::SpinLock;

use crate::ops::Blocker;
use crate::table::Futex;

bitflags! {
    /// 等待节点状态
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitFlags: u32 {
        /// 已被 requeue 到另一个 futex 对象
        const REQUEUED = 1 << 0;
        /// 已被唤醒方从队列中摘除
        const REMOVED = 1 << 1;
    }
}

/// 等待节点
pub struct WaitNode {
    flags: AtomicU32,
    /// 当前所在的 futex 对象，只在持有该对象锁时修改
    futex: SpinLock<Arc<Futex>>,
    blocker: Arc<dyn Blocker>,
}

impl WaitNode {
    /// 创建挂在 `futex` 上的等待节点
    pub fn new(futex: Arc<Futex>, blocker: Arc<dyn Blocker>) -> Self {
        Self {
            flags: AtomicU32::new(0),
            futex: SpinLock::new(futex),
            blocker,
        }
    }

    /// 当前状态
    pub fn flags(&self) -> WaitFlags {
        WaitFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// 是否已被唤醒方摘除
    pub fn is_removed(&self) -> bool {
        self.flags().contains(WaitFlags::REMOVED)
    }

    /// 是否被 requeue 过
    pub fn is_requeued(&self) -> bool {
        self.flags().contains(WaitFlags::REQUEUED)
    }

    /// 当前所在的 futex 对象
    pub fn current(&self) -> Arc<Futex> {
        self.futex.lock().clone()
    }

    /// 移到新的 futex 对象，返回原对象
    pub(crate) fn move_to(&self, futex: Arc<Futex>) -> Arc<Futex> {
        let old = core::mem::replace(&mut *self.futex.lock(), futex);
        self.flags
            .fetch_or(WaitFlags::REQUEUED.bits(), Ordering::AcqRel);
        old
    }

    /// 标记为已摘除并唤醒等待者
    ///
    /// 调用者必须持有节点当前所在对象的锁，并且已经把节点移出队列。
    pub(crate) fn wake(&self) {
        self.flags
            .fetch_or(WaitFlags::REMOVED.bits(), Ordering::AcqRel);
        self.blocker.unblock();
    }

    pub(crate) fn blocker(&self) -> &dyn Blocker {
        self.blocker.as_ref()
    }
}

impl core::fmt::Debug for WaitNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitNode")
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}
