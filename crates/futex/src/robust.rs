//! robust futex 链表
//!
//! 用户态在 `set_robust_list` 登记一个链表头，链表中是线程当前持有的锁。
//! 线程退出时内核遍历链表：仍标记为该线程持有的锁被设置 `FUTEX_OWNER_DIED`，
//! 有等待者时唤醒其中一个，避免其他线程永远阻塞在已死亡的持有者上。
//!
//! 链表由用户态维护，内容不可信：任何读取失败都会终止遍历，遍历节点数也有上限。

use uapi::futex::{
    FUTEX_BITSET_MATCH_ANY, FUTEX_OWNER_DIED, FUTEX_TID_MASK, FUTEX_WAITERS, ROBUST_ENTRY_PI,
    RobustListHead,
};

use crate::config::{ROBUST_LIST_HEAD_SIZE, ROBUST_LIST_LIMIT};
use crate::engine;
use crate::error::{FutexError, FutexResult};
use crate::key::{FutexKey, KeyScope};
use crate::manager::FutexManager;
use crate::ops::{FutexTask, UserMemory};
use crate::table::GetFlags;

/// 链表中的一项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RobustEntry {
    addr: usize,
    pi: bool,
}

/// 读取 `uaddr` 处的链表指针，拆出 PI 标志位
fn fetch_robust_entry(memory: &dyn UserMemory, uaddr: usize) -> FutexResult<RobustEntry> {
    let raw = memory.read_usize(uaddr)?;
    Ok(RobustEntry {
        addr: raw & !ROBUST_ENTRY_PI,
        pi: raw & ROBUST_ENTRY_PI != 0,
    })
}

impl FutexManager {
    /// 登记当前线程的 robust list 头
    ///
    /// # Errors
    /// `len` 与链表头结构大小不一致时返回 [`FutexError::InvalidArgument`]。
    pub fn set_robust_list(&self, task: &dyn FutexTask, head: usize, len: usize) -> FutexResult<()> {
        if len != ROBUST_LIST_HEAD_SIZE {
            return Err(FutexError::InvalidArgument);
        }
        let mut heads = self.robust_heads.lock();
        heads.try_reserve(1)?;
        heads.insert(task.tid(), head);
        Ok(())
    }

    /// 查询线程登记的 robust list 头，返回 `(head, len)`
    ///
    /// `tid` 为 0 时查询当前线程；未登记时头地址为 0。
    pub fn get_robust_list(&self, task: &dyn FutexTask, tid: u32) -> FutexResult<(usize, usize)> {
        let tid = if tid == 0 {
            task.tid()
        } else {
            task.inspect_thread(tid)?;
            tid
        };
        let head = self.robust_heads.lock().get(&tid).copied().unwrap_or(0);
        Ok((head, ROBUST_LIST_HEAD_SIZE))
    }

    /// 线程退出时处理它的 robust list
    ///
    /// 由线程退出路径调用，在退出线程的上下文中执行。所有错误都被吞掉，只会提前结束遍历。
    pub fn release_robust_futexes(&self, task: &dyn FutexTask) {
        let Some(head) = self.robust_heads.lock().remove(&task.tid()) else {
            return;
        };
        let memory = task.memory();

        let Ok(mut entry) = fetch_robust_entry(memory, head + RobustListHead::LIST_OFFSET) else {
            return;
        };
        let Ok(futex_offset) = memory.read_isize(head + RobustListHead::FUTEX_OFFSET_OFFSET) else {
            return;
        };
        let Ok(pending) = fetch_robust_entry(memory, head + RobustListHead::PENDING_OFFSET) else {
            return;
        };

        let mut limit = ROBUST_LIST_LIMIT;
        while entry.addr != head + RobustListHead::LIST_OFFSET {
            // 先取下一项，处理当前项时用户态可能已经改写了链表
            let next = fetch_robust_entry(memory, entry.addr);

            if entry.addr != pending.addr
                && self
                    .handle_futex_death(task, entry.addr.wrapping_add_signed(futex_offset), entry.pi)
                    .is_err()
            {
                break;
            }
            let Ok(next) = next else {
                break;
            };
            entry = next;

            limit -= 1;
            if limit == 0 {
                log::warn!("futex: tid {} robust list exceeds {} entries", task.tid(), ROBUST_LIST_LIMIT);
                break;
            }
            task.relinquish();
        }

        if pending.addr != 0 {
            let _ = self.handle_futex_death(task, pending.addr.wrapping_add_signed(futex_offset), pending.pi);
        }
    }

    /// 处理退出线程持有的一个 robust futex
    ///
    /// 字中的持有者仍为退出线程时，清除持有者、保留 `FUTEX_WAITERS` 并设置 `FUTEX_OWNER_DIED`；
    /// 有等待者且不是 PI futex 时唤醒一个等待者。
    pub fn handle_futex_death(&self, task: &dyn FutexTask, uaddr: usize, pi: bool) -> FutexResult<()> {
        let memory = task.memory();
        let tid = task.tid();

        let uval = loop {
            let uval = memory.read_u32(uaddr)?;
            if uval & FUTEX_TID_MASK != tid {
                return Ok(());
            }
            let mval = (uval & FUTEX_WAITERS) | FUTEX_OWNER_DIED;
            if memory.cmpxchg_u32(uaddr, uval, mval)? == uval {
                break uval;
            }
        };

        if !pi && uval & FUTEX_WAITERS != 0 {
            let key = FutexKey::resolve(memory, uaddr, KeyScope::Shared)?;
            if let Some(mut futex) = self.table().get(key, uaddr, GetFlags::DONT_CREATE)? {
                engine::wake(&mut futex, 1, FUTEX_BITSET_MATCH_ANY)?;
            }
        }
        Ok(())
    }
}
