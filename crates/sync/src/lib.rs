//! 同步原语
//!
//! 向 futex 子系统提供自旋锁。
//!
//! - [`RawSpinLock`]：不携带数据的原始锁，实现了 [`lock_api::RawMutex`]，
//!   可以脱离 RAII 保护器显式加锁/解锁（futex 对象在睡眠路径上需要这种用法）。
//! - [`SpinLock`]：基于 `lock_api::Mutex` 的数据锁。
//!
//! # 锁顺序
//!
//! 自旋锁本身不会“自动防死锁”。在同一条执行路径上嵌套获取多把锁时，
//! 调用方必须遵循一致的锁顺序，避免循环等待。

#![no_std]

mod raw_spin_lock;
mod spin_lock;

pub use lock_api::RawMutex;
pub use raw_spin_lock::*;
pub use spin_lock::*;
