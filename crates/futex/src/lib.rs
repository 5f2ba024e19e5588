//! futex 子系统
//!
//! 提供与 Linux 兼容的 `futex(2)`、`set_robust_list(2)` 与 `get_robust_list(2)` 语义。
//!
//! # 模块组成
//!
//! - [`key`]：把用户地址解析为可比较的 [`FutexKey`]
//! - [`table`]：按 key 索引、带引用计数的 futex 对象注册表
//! - [`wait_node`]：阻塞调用者的等待节点
//! - [`engine`]：睡眠、FIFO 唤醒与跨队列 requeue
//! - [`atomic_op`]：FUTEX_WAKE_OP 的原子操作编码
//! - [`manager`]：操作分发入口 [`FutexManager`]
//! - [`robust`]：线程退出时的 robust list 处理
//! - [`ops`]：需要由内核其余部分实现的 trait
//!
//! # 锁层次
//!
//! ```text
//! 对象锁 (按 FutexKey 顺序，至多两把)
//!   └── 表锁 (叶子锁)
//! ```
//!
//! 持有表锁时不会获取对象锁；睡眠前总会释放所有锁。

#![no_std]
#![allow(clippy::too_many_arguments)]

extern crate alloc;

pub mod atomic_op;
pub mod config;
pub mod engine;
pub mod error;
pub mod key;
pub mod manager;
pub mod ops;
pub mod robust;
pub mod table;
pub mod wait_node;

#[cfg(test)]
mod tests;

pub use atomic_op::AtomicOp;
pub use engine::SleepOutcome;
pub use error::{FutexError, FutexResult, MemFault};
pub use key::{FutexKey, KeyScope};
pub use manager::{FutexArgs, FutexManager, UnsupportedOps};
pub use ops::{BlockResult, Blocker, ClockId, FutexTask, Mapping, PageFaultGuard, RmwOp, UserMemory};
pub use table::{Futex, FutexRef, FutexTable, GetFlags};
pub use wait_node::WaitNode;
