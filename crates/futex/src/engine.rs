//! 等待/唤醒引擎
//!
//! 在已加锁的 futex 对象上实现入队、睡眠、按 FIFO 唤醒和跨队列 requeue。
//!
//! # 睡眠协议
//!
//! 1. 调用者持有对象锁，把等待节点放到队尾
//! 2. [`sleep`] 释放对象锁后在节点的阻塞令牌上等待
//! 3. 唤醒方在持有对象锁时把节点摘出队列、设置 `REMOVED`，然后释放令牌
//!
//! 令牌具有 park/unpark 语义，步骤 3 即使发生在步骤 2 真正阻塞之前也不会丢失。
//! 等待者醒来后通过节点记录的当前对象重新加锁，被 requeue 过时锁的是新对象。

use alloc::sync::Arc;
use core::time::Duration;

use log::trace;

use crate::error::{FutexError, FutexResult};
use crate::ops::{BlockResult, ClockId, FutexTask};
use crate::table::FutexRef;
use crate::wait_node::WaitNode;

/// 一次睡眠的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// 被唤醒（包括 requeue 之后在新对象上被唤醒）
    Woken,
    /// 超时
    TimedOut,
    /// 被信号打断
    Interrupted {
        /// 系统调用是否可以重新启动
        restartable: bool,
    },
}

/// 把节点放到对象的等待队列队尾
///
/// 调用者必须持有对象锁。
pub fn enqueue(futex: &mut FutexRef<'_>, node: Arc<WaitNode>) -> FutexResult<()> {
    let queue = futex.queue();
    queue.waiters.try_reserve(1)?;
    queue.waiters.push_back(node);
    Ok(())
}

/// 按 FIFO 顺序唤醒至多 `max_count` 个与 `bitset` 相交的等待者，返回唤醒个数
///
/// 调用者必须持有对象锁。
///
/// # Errors
/// `bitset` 为 0 时返回 [`FutexError::InvalidArgument`]，不唤醒任何等待者。
pub fn wake(futex: &mut FutexRef<'_>, max_count: usize, bitset: u32) -> FutexResult<usize> {
    if bitset == 0 {
        return Err(FutexError::InvalidArgument);
    }

    let uaddr = futex.futex().uaddr();
    let queue = futex.queue();
    let mut count = 0;
    while count < max_count {
        // 过滤条件取等待者所在对象的 bitset
        if queue.bitset & bitset == 0 {
            break;
        }
        let Some(node) = queue.waiters.pop_front() else {
            break;
        };
        trace!("futex wake: uaddr={:#x} node={:p}", uaddr, Arc::as_ptr(&node));
        node.wake();
        count += 1;
    }
    Ok(count)
}

/// 唤醒 `from` 队首的 `nr_wake` 个等待者，再把之后至多 `nr_requeue` 个移到 `to` 的队尾
///
/// 调用者必须同时持有两个对象的锁（见 [`lock_pair`](crate::table::lock_pair)）。
/// 被移动的节点各自在 `to` 上持有一个引用。返回唤醒与移动的总数。
pub fn requeue(
    from: &mut FutexRef<'_>,
    nr_wake: usize,
    to: &mut FutexRef<'_>,
    nr_requeue: usize,
) -> FutexResult<usize> {
    let uaddr = from.futex().uaddr();
    let target = to.futex().clone();
    let source = from.queue();

    let nr_move = nr_requeue.min(source.waiters.len().saturating_sub(nr_wake));
    to.queue().waiters.try_reserve(nr_move)?;

    let mut count = 0;
    while count < nr_wake {
        let Some(node) = source.waiters.pop_front() else {
            return Ok(count);
        };
        trace!("futex requeue: uaddr={:#x} wake node={:p}", uaddr, Arc::as_ptr(&node));
        node.wake();
        count += 1;
    }

    for _ in 0..nr_move {
        let Some(node) = source.waiters.pop_front() else {
            break;
        };
        trace!(
            "futex requeue: uaddr={:#x} move node={:p} to uaddr={:#x}",
            uaddr,
            Arc::as_ptr(&node),
            target.uaddr()
        );
        let held = node.is_requeued();
        target.acquire_extra();
        let old = node.move_to(target.clone());
        if held {
            old.release_extra();
        }
        to.queue().waiters.push_back(node);
        count += 1;
    }
    Ok(count)
}

/// 在对象上睡眠，直到被唤醒、超时或被打断
///
/// 进入时 `futex` 必须已加锁且 `node` 已入队。返回前重新锁定节点当前所在的对象，
/// 把节点移出队列（若尚未被摘除）并释放引用。`timeout` 为相对时间。
///
/// 超时或打断与唤醒竞争时，只要节点已被摘除就报告 [`SleepOutcome::Woken`]，
/// 唤醒方计入的那一次唤醒不会丢失。
pub fn sleep(
    mut futex: FutexRef<'_>,
    node: &Arc<WaitNode>,
    timeout: Option<Duration>,
    task: &dyn FutexTask,
) -> SleepOutcome {
    let uaddr = futex.futex().uaddr();
    let deadline = timeout.map(|t| task.clock_now(ClockId::Monotonic).saturating_add(t));

    trace!(
        "futex sleep enter: uaddr={:#x} node={:p} timeout={:?}",
        uaddr,
        Arc::as_ptr(node),
        timeout
    );
    futex.unlock();

    let mut result = BlockResult::Unblocked;
    while !node.is_removed() {
        let remaining = match deadline {
            None => None,
            Some(deadline) => {
                let now = task.clock_now(ClockId::Monotonic);
                if now >= deadline {
                    result = BlockResult::TimedOut;
                    break;
                }
                Some(deadline - now)
            }
        };
        result = node.blocker().block(remaining);
        if result != BlockResult::Unblocked {
            break;
        }
        // Unblocked 但节点仍在队列中：残留令牌或虚假唤醒，继续等待
    }

    let futex = futex.relock_for(node);
    let outcome = if node.is_removed() {
        SleepOutcome::Woken
    } else {
        match result {
            BlockResult::Unblocked => SleepOutcome::Woken,
            BlockResult::TimedOut => SleepOutcome::TimedOut,
            BlockResult::Interrupted { restartable } => SleepOutcome::Interrupted { restartable },
        }
    };

    trace!(
        "futex sleep out: uaddr={:#x} node={:p} outcome={:?} requeued={}",
        uaddr,
        Arc::as_ptr(node),
        outcome,
        node.is_requeued()
    );
    futex.put(Some(node));
    outcome
}
