//! FUTEX_WAKE_OP 原子操作
//!
//! 编码格式见 [`uapi::futex`]：
//!
//! ```text
//! | 31    | 30..28 | 27..24 | 23..12 | 11..0  |
//! | shift | op     | cmp    | oparg  | cmparg |
//! ```
//!
//! `oparg` 与 `cmparg` 都是 12 位有符号数。比较使用操作前的旧值，按 32 位有符号数比较。

use uapi::futex::*;

use crate::error::{FutexError, FutexResult};
use crate::ops::{PageFaultGuard, RmwOp, UserMemory};

/// 解码后的 FUTEX_WAKE_OP 操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicOp {
    /// 操作类型（`FUTEX_OP_*`）
    pub op: u32,
    /// 比较类型（`FUTEX_OP_CMP_*`）
    pub cmp: u32,
    /// 操作数，已处理移位标志
    pub oparg: i32,
    /// 比较操作数
    pub cmparg: i32,
}

impl AtomicOp {
    /// 解码
    pub fn decode(encoded: u32) -> Self {
        let op = (encoded >> 28) & 7;
        let cmp = (encoded >> 24) & 15;
        let mut oparg = ((encoded << 8) as i32) >> 20;
        let cmparg = ((encoded << 20) as i32) >> 20;

        if encoded & (FUTEX_OP_OPARG_SHIFT << 28) != 0 {
            oparg = 1i32.wrapping_shl(oparg as u32);
        }

        Self {
            op,
            cmp,
            oparg,
            cmparg,
        }
    }

    /// 对应的读-改-写操作，不支持的操作类型返回 `None`
    pub fn rmw(&self) -> Option<RmwOp> {
        let arg = self.oparg as u32;
        match self.op {
            FUTEX_OP_SET => Some(RmwOp::Set(arg)),
            FUTEX_OP_ADD => Some(RmwOp::Add(arg)),
            FUTEX_OP_OR => Some(RmwOp::Or(arg)),
            FUTEX_OP_ANDN => Some(RmwOp::And(!arg)),
            FUTEX_OP_XOR => Some(RmwOp::Xor(arg)),
            _ => None,
        }
    }

    /// 用旧值与 `cmparg` 比较，不支持的比较类型返回 `None`
    pub fn compare(&self, old: u32) -> Option<bool> {
        let old = old as i32;
        match self.cmp {
            FUTEX_OP_CMP_EQ => Some(old == self.cmparg),
            FUTEX_OP_CMP_NE => Some(old != self.cmparg),
            FUTEX_OP_CMP_LT => Some(old < self.cmparg),
            FUTEX_OP_CMP_LE => Some(old <= self.cmparg),
            FUTEX_OP_CMP_GT => Some(old > self.cmparg),
            FUTEX_OP_CMP_GE => Some(old >= self.cmparg),
            _ => None,
        }
    }

    /// 在禁用页错误的情况下对 `uaddr` 执行操作，返回比较结果
    ///
    /// # Errors
    /// - 操作类型不支持：[`FutexError::NotSupported`]，用户内存不被修改
    /// - 访问用户内存失败：[`FutexError::Fault`]
    /// - 比较类型不支持：[`FutexError::NotSupported`]，此时修改已经生效
    pub fn apply(&self, memory: &dyn UserMemory, uaddr: usize) -> FutexResult<bool> {
        let rmw = self.rmw().ok_or(FutexError::NotSupported)?;
        let old = {
            let _guard = PageFaultGuard::new(memory);
            memory.atomic_rmw_u32(uaddr, rmw)?
        };
        self.compare(old).ok_or(FutexError::NotSupported)
    }
}
