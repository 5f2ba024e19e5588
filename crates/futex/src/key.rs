//! futex key 解析
//!
//! 把 (用户地址, 共享范围) 映射为可比较的规范标识：
//! - 私有 key 由地址空间标识和虚拟地址组成，仅在同一地址空间内相等
//! - 共享 key 由后备内存对象和偏移组成，不同地址空间映射到同一位置时相等

use crate::error::{FutexError, FutexResult};
use crate::ops::UserMemory;

/// futex 字的对齐要求
const FUTEX_ALIGN: usize = core::mem::size_of::<u32>();

/// 解析时使用的共享范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// `FUTEX_PRIVATE_FLAG`：只在当前地址空间内可见
    Private,
    /// 根据地址所在映射自动判断：共享映射得到共享 key，否则得到私有 key
    Shared,
}

/// futex 的规范标识
///
/// 实现了全序，两个对象同时加锁时按 key 排序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FutexKey {
    /// 进程私有
    Private {
        /// 地址空间标识
        space: usize,
        /// 用户虚拟地址
        uaddr: usize,
    },
    /// 跨地址空间共享
    Shared {
        /// 后备内存对象
        object: usize,
        /// 对象内偏移
        offset: usize,
    },
}

impl FutexKey {
    /// 解析用户地址
    ///
    /// # Errors
    /// - 地址未按 4 字节对齐：[`FutexError::InvalidArgument`]
    /// - 共享范围下找不到地址所在映射：[`FutexError::Fault`]
    pub fn resolve(memory: &dyn UserMemory, uaddr: usize, scope: KeyScope) -> FutexResult<Self> {
        if uaddr % FUTEX_ALIGN != 0 {
            return Err(FutexError::InvalidArgument);
        }

        let private = FutexKey::Private {
            space: memory.space_id(),
            uaddr,
        };

        match scope {
            KeyScope::Private => Ok(private),
            KeyScope::Shared => {
                let mapping = memory.mapping(uaddr)?;
                if mapping.shared {
                    Ok(FutexKey::Shared {
                        object: mapping.object,
                        offset: mapping.offset,
                    })
                } else {
                    Ok(private)
                }
            }
        }
    }

    /// 是否为共享 key
    pub fn is_shared(&self) -> bool {
        matches!(self, FutexKey::Shared { .. })
    }
}
