//! futex 运行时操作 trait 定义
//!
//! 此模块定义了 futex 子系统需要的外部依赖接口，通过 trait 抽象实现与内核其余部分的解耦：
//!
//! - [`UserMemory`]：一个地址空间的用户内存访问能力（含页错误保护的原子操作）
//! - [`Blocker`]：线程的阻塞/唤醒令牌
//! - [`FutexTask`]：发起调用的线程上下文
//!
//! 与 `VfsOps` 不同，这些实现不做全局注册，而是随每次调用传入，
//! 从而允许同一进程内存在相互独立的 [`FutexManager`](crate::FutexManager)。

use alloc::sync::Arc;
use core::time::Duration;

use crate::error::{FutexResult, MemFault};

/// 用户地址所在映射的描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// 后备内存对象的标识
    pub object: usize,
    /// 地址在后备内存对象中的偏移
    pub offset: usize,
    /// 映射是否为共享映射（`MAP_SHARED`）
    pub shared: bool,
}

/// 作用在 32 位用户字上的原子读-改-写操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmwOp {
    /// 交换为给定值
    Set(u32),
    /// 加上给定值（回绕）
    Add(u32),
    /// 按位或
    Or(u32),
    /// 按位与
    And(u32),
    /// 按位异或
    Xor(u32),
}

impl RmwOp {
    /// 计算旧值经过该操作后的新值
    pub fn apply(self, old: u32) -> u32 {
        match self {
            RmwOp::Set(v) => v,
            RmwOp::Add(v) => old.wrapping_add(v),
            RmwOp::Or(v) => old | v,
            RmwOp::And(v) => old & v,
            RmwOp::Xor(v) => old ^ v,
        }
    }
}

/// 用户内存访问
///
/// 每个地址空间一个实现。所有访问在地址无效时返回 [`MemFault`]，不得导致内核崩溃。
pub trait UserMemory: Send + Sync {
    // ========== 地址解析 ==========

    /// 地址空间的标识，用于构造进程私有 key
    fn space_id(&self) -> usize;

    /// 查询地址所在映射的后备对象
    fn mapping(&self, uaddr: usize) -> Result<Mapping, MemFault>;

    // ========== 拷贝 ==========

    /// 读取一个 32 位字，不允许睡眠处理页错误（持自旋锁时使用）
    fn read_u32_nofault(&self, uaddr: usize) -> Result<u32, MemFault>;

    /// 读取一个 32 位字，允许睡眠以解决页错误
    fn read_u32(&self, uaddr: usize) -> Result<u32, MemFault>;

    /// 读取一个机器字，允许睡眠以解决页错误
    fn read_usize(&self, uaddr: usize) -> Result<usize, MemFault>;

    /// 读取一个有符号机器字
    fn read_isize(&self, uaddr: usize) -> Result<isize, MemFault> {
        self.read_usize(uaddr).map(|v| v as isize)
    }

    // ========== 原子操作 ==========

    /// 比较并交换，返回操作前的值
    fn cmpxchg_u32(&self, uaddr: usize, expected: u32, new: u32) -> Result<u32, MemFault>;

    /// 原子读-改-写，返回操作前的值
    ///
    /// 在页错误被禁用期间（见 [`PageFaultGuard`]），访问不在内存中的页会直接失败。
    fn atomic_rmw_u32(&self, uaddr: usize, op: RmwOp) -> Result<u32, MemFault>;

    // ========== 页错误控制 ==========

    /// 禁用页错误处理，返回之前的状态
    fn disable_page_faults(&self) -> usize;

    /// 恢复页错误处理状态
    fn restore_page_faults(&self, saved: usize);
}

/// 页错误禁用保护器
///
/// 在作用域内禁用页错误处理，离开作用域时恢复
pub struct PageFaultGuard<'a> {
    memory: &'a dyn UserMemory,
    saved: usize,
}

impl<'a> PageFaultGuard<'a> {
    /// 禁用页错误处理
    #[inline]
    pub fn new(memory: &'a dyn UserMemory) -> Self {
        let saved = memory.disable_page_faults();
        Self { memory, saved }
    }
}

impl Drop for PageFaultGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.memory.restore_page_faults(self.saved);
    }
}

/// [`Blocker::block`] 的返回原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockResult {
    /// 被 [`Blocker::unblock`] 唤醒（也可能是虚假唤醒）
    Unblocked,
    /// 超时
    TimedOut,
    /// 被信号打断
    Interrupted {
        /// 信号处理完成后系统调用是否可以重新启动
        restartable: bool,
    },
}

/// 线程阻塞令牌
///
/// 语义与 park/unpark 一致：若 `unblock` 先于 `block` 发生，
/// 下一次 `block` 立即返回，因此唤醒不会丢失。
pub trait Blocker: Send + Sync {
    /// 阻塞当前线程，`timeout` 为 `None` 时无限等待
    fn block(&self, timeout: Option<Duration>) -> BlockResult;

    /// 唤醒阻塞在此令牌上的线程
    fn unblock(&self);
}

/// 时钟选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockId {
    /// CLOCK_MONOTONIC
    Monotonic,
    /// CLOCK_REALTIME
    Realtime,
}

/// 发起 futex 调用的线程上下文
pub trait FutexTask {
    /// 当前线程 ID
    fn tid(&self) -> u32;

    /// 当前进程 ID
    fn pid(&self) -> u32;

    /// 当前进程的用户内存
    fn memory(&self) -> &dyn UserMemory;

    /// 当前线程的阻塞令牌
    fn blocker(&self) -> Arc<dyn Blocker>;

    /// 读取时钟
    fn clock_now(&self, clock: ClockId) -> Duration;

    /// 主动让出处理器
    fn relinquish(&self);

    /// 检查当前线程是否可以查询目标线程
    ///
    /// 目标不存在返回 [`NoSuchThread`](crate::FutexError::NoSuchThread)，
    /// 无权查询返回 [`PermissionDenied`](crate::FutexError::PermissionDenied)。
    fn inspect_thread(&self, tid: u32) -> FutexResult<()>;
}
