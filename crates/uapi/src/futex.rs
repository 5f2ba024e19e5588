//! futex(2) 相关定义
//!
//! 对应 Linux `include/uapi/linux/futex.h`。

use bitflags::bitflags;
use core::mem::size_of;

// ========== 操作码 ==========

pub const FUTEX_WAIT: u32 = 0;
pub const FUTEX_WAKE: u32 = 1;
pub const FUTEX_FD: u32 = 2;
pub const FUTEX_REQUEUE: u32 = 3;
pub const FUTEX_CMP_REQUEUE: u32 = 4;
pub const FUTEX_WAKE_OP: u32 = 5;
pub const FUTEX_LOCK_PI: u32 = 6;
pub const FUTEX_UNLOCK_PI: u32 = 7;
pub const FUTEX_TRYLOCK_PI: u32 = 8;
pub const FUTEX_WAIT_BITSET: u32 = 9;
pub const FUTEX_WAKE_BITSET: u32 = 10;
pub const FUTEX_WAIT_REQUEUE_PI: u32 = 11;
pub const FUTEX_CMP_REQUEUE_PI: u32 = 12;

bitflags! {
    /// 操作码中与命令正交的修饰位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FutexOpFlags: u32 {
        /// 进程私有 futex（不跨地址空间共享）
        const PRIVATE = 128;
        /// 绝对超时基于 CLOCK_REALTIME
        const CLOCK_REALTIME = 256;
    }
}

pub const FUTEX_PRIVATE_FLAG: u32 = FutexOpFlags::PRIVATE.bits();
pub const FUTEX_CLOCK_REALTIME: u32 = FutexOpFlags::CLOCK_REALTIME.bits();
pub const FUTEX_CMD_MASK: u32 = !(FUTEX_PRIVATE_FLAG | FUTEX_CLOCK_REALTIME);

/// 匹配任意等待者的 bitset
pub const FUTEX_BITSET_MATCH_ANY: u32 = 0xffff_ffff;

// ========== FUTEX_WAKE_OP 编码 ==========
//
// | 31..28      | 27..24 | 23..12 | 11..0  |
// | shift|op    | cmp    | oparg  | cmparg |

pub const FUTEX_OP_SET: u32 = 0;
pub const FUTEX_OP_ADD: u32 = 1;
pub const FUTEX_OP_OR: u32 = 2;
pub const FUTEX_OP_ANDN: u32 = 3;
pub const FUTEX_OP_XOR: u32 = 4;

/// `oparg` 表示移位量，实际操作数为 `1 << oparg`
pub const FUTEX_OP_OPARG_SHIFT: u32 = 8;

pub const FUTEX_OP_CMP_EQ: u32 = 0;
pub const FUTEX_OP_CMP_NE: u32 = 1;
pub const FUTEX_OP_CMP_LT: u32 = 2;
pub const FUTEX_OP_CMP_LE: u32 = 3;
pub const FUTEX_OP_CMP_GT: u32 = 4;
pub const FUTEX_OP_CMP_GE: u32 = 5;

/// 构造一个 FUTEX_WAKE_OP 编码（与 glibc 的 `FUTEX_OP` 宏一致）
pub const fn futex_op(op: u32, oparg: u32, cmp: u32, cmparg: u32) -> u32 {
    ((op & 0xf) << 28) | ((cmp & 0xf) << 24) | ((oparg & 0xfff) << 12) | (cmparg & 0xfff)
}

// ========== robust list ==========

/// futex 字上的“存在等待者”位
pub const FUTEX_WAITERS: u32 = 0x8000_0000;
/// futex 字上的“持有者已退出”位
pub const FUTEX_OWNER_DIED: u32 = 0x4000_0000;
/// futex 字中持有者 TID 所在的位
pub const FUTEX_TID_MASK: u32 = 0x3fff_ffff;

/// 对应 Linux 的 `struct robust_list`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RobustList {
    /// 下一个节点地址；最低位标记该锁为 PI futex
    pub next: usize,
}

/// 对应 Linux 的 `struct robust_list_head`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RobustListHead {
    /// 链表哨兵节点
    pub list: RobustList,
    /// 从链表节点到 futex 字的偏移
    pub futex_offset: isize,
    /// 正在获取/释放中的锁
    pub list_op_pending: usize,
}

impl RobustListHead {
    pub const LIST_OFFSET: usize = 0;
    pub const FUTEX_OFFSET_OFFSET: usize = size_of::<RobustList>();
    pub const PENDING_OFFSET: usize = Self::FUTEX_OFFSET_OFFSET + size_of::<isize>();
}

pub const ROBUST_LIST_HEAD_SIZE: usize = size_of::<RobustListHead>();

/// 链表项中标记 PI futex 的位
pub const ROBUST_ENTRY_PI: usize = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_mask_strips_modifiers() {
        let op = FUTEX_WAIT_BITSET | FUTEX_PRIVATE_FLAG | FUTEX_CLOCK_REALTIME;
        assert_eq!(op & FUTEX_CMD_MASK, FUTEX_WAIT_BITSET);
        let flags = FutexOpFlags::from_bits_truncate(op);
        assert!(flags.contains(FutexOpFlags::PRIVATE | FutexOpFlags::CLOCK_REALTIME));
    }

    #[test]
    fn test_futex_op_encoding_layout() {
        let enc = futex_op(FUTEX_OP_ADD, 5, FUTEX_OP_CMP_GT, 1);
        assert_eq!(enc >> 28, FUTEX_OP_ADD);
        assert_eq!((enc >> 24) & 0xf, FUTEX_OP_CMP_GT);
        assert_eq!((enc >> 12) & 0xfff, 5);
        assert_eq!(enc & 0xfff, 1);
    }

    #[test]
    fn test_robust_head_layout() {
        assert_eq!(RobustListHead::LIST_OFFSET, 0);
        assert_eq!(RobustListHead::FUTEX_OFFSET_OFFSET, size_of::<usize>());
        assert_eq!(RobustListHead::PENDING_OFFSET, 2 * size_of::<usize>());
        assert_eq!(ROBUST_LIST_HEAD_SIZE, 3 * size_of::<usize>());
    }
}
