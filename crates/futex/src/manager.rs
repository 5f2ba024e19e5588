//! futex 操作分发
//!
//! [`FutexManager`] 是 futex 子系统的入口，持有注册表、各线程的 robust list 头以及
//! “不支持操作”的日志记录状态。系统调用层把 `futex(2)` 的参数打包成 [`FutexArgs`]
//! 交给 [`FutexManager::futex`]。
//!
//! 管理器没有全局实例，由内核在初始化时构造一个并在各处共享；测试可以各自构造独立的实例。
//!
//! ## 操作码处理
//!
//! | 操作 | 行为 |
//! |------|------|
//! | `FUTEX_WAIT` / `FUTEX_WAIT_BITSET` | 比较用户字后睡眠 |
//! | `FUTEX_WAKE` / `FUTEX_WAKE_BITSET` | 唤醒，不存在对象时返回 0 |
//! | `FUTEX_CMP_REQUEUE` | 比较用户字后唤醒并转移等待者 |
//! | `FUTEX_WAKE_OP` | 原子修改第二个字，按比较结果唤醒两个对象 |
//! | PI 系列 | `ENOSYS`，每个进程只记录一次日志 |
//! | `FUTEX_REQUEUE` | `EINVAL`，每个进程只记录一次日志 |
//! | 其他 | `ENOSYS` |

use alloc::sync::Arc;
use core::time::Duration;

use bitflags::bitflags;
use hashbrown::HashMap;
use log::debug;
use sync::SpinLock;
use uapi::futex::*;
use uapi::time::TimeSpec;

use crate::atomic_op::AtomicOp;
use crate::config::MAX_TIMEOUT_SECS;
use crate::engine::{self, SleepOutcome};
use crate::error::{FutexError, FutexResult};
use crate::key::{FutexKey, KeyScope};
use crate::ops::{ClockId, FutexTask};
use crate::table::{FutexTable, GetFlags, lock_pair};
use crate::wait_node::WaitNode;

bitflags! {
    /// 已经为某进程记录过日志的不支持操作类别
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnsupportedOps: u32 {
        /// 优先级继承系列操作
        const PI_OPS = 1 << 0;
        /// 已废弃的 FUTEX_REQUEUE
        const REQUEUE = 1 << 1;
    }
}

/// `futex(2)` 的参数
///
/// `val2` 对应系统调用中复用为整数的 timeout 参数（CMP_REQUEUE 的转移个数、
/// WAKE_OP 的第二个唤醒个数）；`timeout` 只对 WAIT 系列有意义。
#[derive(Debug, Clone, Copy, Default)]
pub struct FutexArgs {
    /// futex 字地址
    pub uaddr: usize,
    /// 操作码及修饰位
    pub op: u32,
    /// 期望值或唤醒个数
    pub val: u32,
    /// WAIT 系列的超时
    pub timeout: Option<TimeSpec>,
    /// 第二个计数
    pub val2: u32,
    /// 第二个 futex 字地址
    pub uaddr2: usize,
    /// bitset、比较值或 WAKE_OP 编码
    pub val3: u32,
}

/// futex 管理器
pub struct FutexManager {
    table: FutexTable,
    /// tid -> robust list 头地址
    pub(crate) robust_heads: SpinLock<HashMap<u32, usize>>,
    /// pid -> 已记录过日志的不支持操作
    reported: SpinLock<HashMap<u32, UnsupportedOps>>,
}

impl FutexManager {
    /// 创建一个新的 Futex 管理器实例
    pub fn new() -> Self {
        Self {
            table: FutexTable::new(),
            robust_heads: SpinLock::new(HashMap::new()),
            reported: SpinLock::new(HashMap::new()),
        }
    }

    /// 注册表
    pub fn table(&self) -> &FutexTable {
        &self.table
    }

    /// 分发一次 `futex(2)` 调用
    ///
    /// 成功时返回系统调用的返回值（WAIT 为 0，其余为唤醒/处理的等待者个数）。
    pub fn futex(&self, task: &dyn FutexTask, args: &FutexArgs) -> FutexResult<usize> {
        let flags = FutexOpFlags::from_bits_truncate(args.op);
        let cmd = args.op & FUTEX_CMD_MASK;
        let scope = if flags.contains(FutexOpFlags::PRIVATE) {
            KeyScope::Private
        } else {
            KeyScope::Shared
        };

        if flags.contains(FutexOpFlags::CLOCK_REALTIME)
            && cmd != FUTEX_WAIT_BITSET
            && cmd != FUTEX_WAIT_REQUEUE_PI
        {
            return Err(FutexError::NotSupported);
        }

        match cmd {
            FUTEX_WAIT => {
                let timeout = Self::relative_timeout(args.timeout)?;
                self.wait(task, args.uaddr, scope, args.val, timeout, FUTEX_BITSET_MATCH_ANY)?;
                Ok(0)
            }
            FUTEX_WAIT_BITSET => {
                if args.val3 == 0 {
                    return Err(FutexError::InvalidArgument);
                }
                let clock = if flags.contains(FutexOpFlags::CLOCK_REALTIME) {
                    ClockId::Realtime
                } else {
                    ClockId::Monotonic
                };
                let timeout = Self::absolute_timeout(task, args.timeout, clock)?;
                self.wait(task, args.uaddr, scope, args.val, timeout, args.val3)?;
                Ok(0)
            }
            FUTEX_WAKE => self.wake(task, args.uaddr, scope, wake_count(args.val), FUTEX_BITSET_MATCH_ANY),
            FUTEX_WAKE_BITSET => self.wake(task, args.uaddr, scope, wake_count(args.val), args.val3),
            FUTEX_CMP_REQUEUE => self.cmp_requeue(
                task,
                args.uaddr,
                args.uaddr2,
                scope,
                args.val as i32,
                args.val2 as i32,
                args.val3,
            ),
            FUTEX_WAKE_OP => self.wake_op(
                task,
                args.uaddr,
                args.uaddr2,
                scope,
                wake_count(args.val),
                wake_count(args.val2),
                args.val3,
            ),
            FUTEX_LOCK_PI | FUTEX_UNLOCK_PI | FUTEX_TRYLOCK_PI | FUTEX_WAIT_REQUEUE_PI
            | FUTEX_CMP_REQUEUE_PI => {
                self.report_unsupported(task.pid(), UnsupportedOps::PI_OPS, cmd);
                Err(FutexError::NotSupported)
            }
            FUTEX_REQUEUE => {
                self.report_unsupported(task.pid(), UnsupportedOps::REQUEUE, cmd);
                Err(FutexError::InvalidArgument)
            }
            _ => {
                log::warn!("futex: pid {} used unsupported op {:#x}", task.pid(), args.op);
                Err(FutexError::NotSupported)
            }
        }
    }

    /// 若 `uaddr` 处的值等于 `val`，睡眠直到被唤醒
    ///
    /// `timeout` 为相对时间。
    ///
    /// # Errors
    /// - 值不相等：[`FutexError::WouldBlock`]
    /// - 超时：[`FutexError::TimedOut`]
    /// - 被打断：无超时且可重启时为 [`FutexError::Restart`]，否则为 [`FutexError::Interrupted`]
    pub fn wait(
        &self,
        task: &dyn FutexTask,
        uaddr: usize,
        scope: KeyScope,
        val: u32,
        timeout: Option<Duration>,
        bitset: u32,
    ) -> FutexResult<()> {
        if bitset == 0 {
            return Err(FutexError::InvalidArgument);
        }

        let memory = task.memory();
        let key = FutexKey::resolve(memory, uaddr, scope)?;

        let mut futex = loop {
            let futex = self
                .table
                .get(key, uaddr, GetFlags::empty())?
                .ok_or(FutexError::NotFound)?;
            match memory.read_u32_nofault(uaddr) {
                Ok(cur) if cur != val => {
                    debug!("futex wait: uaddr={:#x} val={:#x} cur={:#x} mismatch", uaddr, val, cur);
                    return Err(FutexError::WouldBlock);
                }
                Ok(_) => break futex,
                Err(_) => {
                    // 释放对象锁后使用允许睡眠的拷贝解决页错误
                    drop(futex);
                    debug!("futex wait: uaddr={:#x} copyin fault, retry", uaddr);
                    memory.read_u32(uaddr)?;
                }
            }
        };

        futex.queue().bitset = bitset;
        let node = Arc::new(WaitNode::new(futex.futex().clone(), task.blocker()));
        engine::enqueue(&mut futex, node.clone())?;

        match engine::sleep(futex, &node, timeout, task) {
            SleepOutcome::Woken => Ok(()),
            SleepOutcome::TimedOut => Err(FutexError::TimedOut),
            SleepOutcome::Interrupted { restartable } => {
                if restartable && timeout.is_none() {
                    Err(FutexError::Restart)
                } else {
                    Err(FutexError::Interrupted)
                }
            }
        }
    }

    /// 唤醒至多 `count` 个等待者
    ///
    /// 对象不存在时直接返回 0，不会为此创建对象。
    pub fn wake(
        &self,
        task: &dyn FutexTask,
        uaddr: usize,
        scope: KeyScope,
        count: usize,
        bitset: u32,
    ) -> FutexResult<usize> {
        if bitset == 0 {
            return Err(FutexError::InvalidArgument);
        }

        let key = FutexKey::resolve(task.memory(), uaddr, scope)?;
        let Some(mut futex) = self.table.get(key, uaddr, GetFlags::DONT_CREATE)? else {
            return Ok(0);
        };
        engine::wake(&mut futex, count, bitset)
    }

    /// 若 `uaddr` 处的值等于 `cmpval`，唤醒 `nr_wake` 个等待者并把至多 `nr_requeue` 个转移到 `uaddr2`
    ///
    /// # Errors
    /// - 两个地址相同或计数为负：[`FutexError::InvalidArgument`]
    /// - `uaddr2` 已有 futex 对象：[`FutexError::AlreadyExists`]
    /// - 值不相等：[`FutexError::TryAgain`]
    pub fn cmp_requeue(
        &self,
        task: &dyn FutexTask,
        uaddr: usize,
        uaddr2: usize,
        scope: KeyScope,
        nr_wake: i32,
        nr_requeue: i32,
        cmpval: u32,
    ) -> FutexResult<usize> {
        if uaddr == uaddr2 {
            return Err(FutexError::InvalidArgument);
        }
        if nr_wake < 0 || nr_requeue < 0 {
            return Err(FutexError::InvalidArgument);
        }

        let memory = task.memory();
        let key = FutexKey::resolve(memory, uaddr, scope)?;
        let key2 = FutexKey::resolve(memory, uaddr2, scope)?;

        loop {
            let mut from = self
                .table
                .get(key, uaddr, GetFlags::DONT_LOCK)?
                .ok_or(FutexError::NotFound)?;
            let to = self
                .table
                .get(key2, uaddr2, GetFlags::DONT_EXIST | GetFlags::DONT_LOCK)?
                .ok_or(FutexError::NotFound)?;
            let mut to = lock_pair(&mut from, to).ok_or(FutexError::InvalidArgument)?;

            match memory.read_u32_nofault(uaddr) {
                Ok(cur) if cur != cmpval => {
                    debug!(
                        "futex cmp_requeue: uaddr={:#x} val={:#x} cur={:#x} mismatch",
                        uaddr, cmpval, cur
                    );
                    return Err(FutexError::TryAgain);
                }
                Ok(_) => {
                    return engine::requeue(&mut from, nr_wake as usize, &mut to, nr_requeue as usize);
                }
                Err(_) => {
                    drop(to);
                    drop(from);
                    debug!("futex cmp_requeue: uaddr={:#x} copyin fault, retry", uaddr);
                    memory.read_u32(uaddr)?;
                }
            }
        }
    }

    /// 对 `uaddr2` 执行原子操作，唤醒 `uaddr` 上 `nr_wake` 个等待者，
    /// 比较成立时再唤醒 `uaddr2` 上 `nr_wake2` 个
    ///
    /// 两个地址解析到同一对象时，第二次唤醒作用在第一个对象上。
    /// 原子操作遇到页错误时释放两个对象，用允许睡眠的拷贝解决页错误后重试。
    pub fn wake_op(
        &self,
        task: &dyn FutexTask,
        uaddr: usize,
        uaddr2: usize,
        scope: KeyScope,
        nr_wake: usize,
        nr_wake2: usize,
        encoded_op: u32,
    ) -> FutexResult<usize> {
        if uaddr == uaddr2 {
            return Err(FutexError::InvalidArgument);
        }

        let memory = task.memory();
        let key = FutexKey::resolve(memory, uaddr, scope)?;
        let key2 = FutexKey::resolve(memory, uaddr2, scope)?;
        let op = AtomicOp::decode(encoded_op);

        loop {
            let mut first = self
                .table
                .get(key, uaddr, GetFlags::DONT_LOCK)?
                .ok_or(FutexError::NotFound)?;
            let second = self
                .table
                .get(key2, uaddr2, GetFlags::DONT_LOCK)?
                .ok_or(FutexError::NotFound)?;
            let mut second = lock_pair(&mut first, second);

            let cmp = match op.apply(memory, uaddr2) {
                Ok(cmp) => cmp,
                Err(FutexError::Fault) => {
                    drop(second);
                    drop(first);
                    debug!("futex wake_op: uaddr2={:#x} atomic op fault, retry", uaddr2);
                    memory.read_u32(uaddr2)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!("futex wake_op: uaddr2={:#x} op={:?} cmp={}", uaddr2, op, cmp);

            let mut woken = engine::wake(&mut first, nr_wake, FUTEX_BITSET_MATCH_ANY)?;
            if cmp {
                let target = match second.as_mut() {
                    Some(second) => second,
                    None => &mut first,
                };
                woken += engine::wake(target, nr_wake2, FUTEX_BITSET_MATCH_ANY)?;
            }
            return Ok(woken);
        }
    }

    /// 进程退出时丢弃其日志记录状态
    pub fn forget_process(&self, pid: u32) {
        self.reported.lock().remove(&pid);
    }

    /// 是否已为进程记录过某类不支持操作
    pub fn has_reported(&self, pid: u32, class: UnsupportedOps) -> bool {
        self.reported
            .lock()
            .get(&pid)
            .is_some_and(|seen| seen.contains(class))
    }

    fn report_unsupported(&self, pid: u32, class: UnsupportedOps, cmd: u32) {
        let mut reported = self.reported.lock();
        let seen = reported.entry(pid).or_insert_with(UnsupportedOps::empty);
        if seen.contains(class) {
            return;
        }
        seen.insert(class);
        drop(reported);

        if class == UnsupportedOps::PI_OPS {
            log::warn!("futex: pid {} used unsupported PI op {}", pid, cmd);
        } else {
            log::warn!("futex: pid {} used deprecated FUTEX_REQUEUE, use FUTEX_CMP_REQUEUE", pid);
        }
    }

    fn relative_timeout(timeout: Option<TimeSpec>) -> FutexResult<Option<Duration>> {
        let Some(ts) = timeout else {
            return Ok(None);
        };
        let t = ts.to_duration().ok_or(FutexError::InvalidArgument)?;
        Ok(Some(t.min(Duration::from_secs(MAX_TIMEOUT_SECS))))
    }

    fn absolute_timeout(
        task: &dyn FutexTask,
        timeout: Option<TimeSpec>,
        clock: ClockId,
    ) -> FutexResult<Option<Duration>> {
        let Some(ts) = timeout else {
            return Ok(None);
        };
        let deadline = ts.to_duration().ok_or(FutexError::InvalidArgument)?;
        let t = deadline.saturating_sub(task.clock_now(clock));
        Ok(Some(t.min(Duration::from_secs(MAX_TIMEOUT_SECS))))
    }
}

impl Default for FutexManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 唤醒个数按有符号数解释，负数视为 0
fn wake_count(val: u32) -> usize {
    (val as i32).max(0) as usize
}
