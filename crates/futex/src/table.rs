//! futex 注册表
//!
//! [`FutexTable`] 按 [`FutexKey`] 索引存活的 [`Futex`] 对象。
//!
//! # 引用计数
//!
//! 每个对象带一个引用计数：创建者持有 1，每次查找命中 +1，每个被 requeue
//! 到该对象上的等待节点 +1。计数在表锁下归零时对象从表中移除，此后同一
//! key 的查找会创建新对象，旧对象不会被重新插入。
//!
//! 计数与 `Arc` 的强引用相互独立：`Arc` 只负责内存安全，对象是否仍在表中
//! 完全由引用计数决定。
//!
//! # 锁顺序
//!
//! 表锁是叶子锁：持有表锁时不会再获取任何对象锁。对象锁可以在持有时去拿
//! 表锁（[`FutexRef`] 释放引用时会这样做）。尚未发布的新对象可以在表锁内加锁，
//! 因为其他执行流还看不到它。

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use hashbrown::HashMap;
use log::trace;
use sync::{RawMutex, RawSpinLock, SpinLock};
use uapi::futex::FUTEX_BITSET_MATCH_ANY;

use crate::error::{FutexError, FutexResult};
use crate::key::FutexKey;
use crate::wait_node::WaitNode;

bitflags! {
    /// [`FutexTable::get`] 的查找选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GetFlags: u32 {
        /// 对象不存在时不创建，返回 `None`
        const DONT_CREATE = 1 << 0;
        /// 对象已存在时失败（[`FutexError::AlreadyExists`]）
        const DONT_EXIST = 1 << 1;
        /// 返回前不对对象加锁
        const DONT_LOCK = 1 << 2;
    }
}

/// 受对象锁保护的队列状态
pub(crate) struct FutexQueue {
    /// 最近一次 WAIT 设置的 bitset
    pub(crate) bitset: u32,
    /// FIFO 等待队列
    pub(crate) waiters: VecDeque<Arc<WaitNode>>,
}

impl FutexQueue {
    /// 把节点从队列中摘除，返回节点是否在队列中
    pub(crate) fn unlink(&mut self, node: &WaitNode) -> bool {
        match self
            .waiters
            .iter()
            .position(|w| core::ptr::eq(Arc::as_ptr(w), node))
        {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// futex 对象
pub struct Futex {
    key: FutexKey,
    uaddr: usize,
    refcount: AtomicUsize,
    lock: RawSpinLock,
    queue: UnsafeCell<FutexQueue>,
}

// SAFETY: queue 只在持有 lock 时通过 FutexRef::queue 访问
unsafe impl Send for Futex {}
// SAFETY: 同上
unsafe impl Sync for Futex {}

impl Futex {
    fn new(key: FutexKey, uaddr: usize) -> Self {
        Self {
            key,
            uaddr,
            refcount: AtomicUsize::new(1),
            lock: RawSpinLock::new(),
            queue: UnsafeCell::new(FutexQueue {
                bitset: FUTEX_BITSET_MATCH_ANY,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// 对象的 key
    pub fn key(&self) -> FutexKey {
        self.key
    }

    /// 创建对象时使用的用户地址，仅用于调试输出
    pub fn uaddr(&self) -> usize {
        self.uaddr
    }

    /// 当前引用计数
    pub fn ref_count(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// 已持有一个引用时再增加一个，不需要表锁
    pub(crate) fn acquire_extra(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// 释放一个额外引用，调用者另外持有引用，计数不会因此归零
    pub(crate) fn release_extra(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 1);
    }
}

impl core::fmt::Debug for Futex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Futex")
            .field("key", &self.key)
            .field("uaddr", &format_args!("{:#x}", self.uaddr))
            .field("refcount", &self.ref_count())
            .finish_non_exhaustive()
    }
}

/// futex 注册表
pub struct FutexTable {
    futexes: SpinLock<HashMap<FutexKey, Arc<Futex>>>,
}

impl FutexTable {
    /// 创建空注册表
    pub fn new() -> Self {
        Self {
            futexes: SpinLock::new(HashMap::new()),
        }
    }

    /// 查找或创建 key 对应的对象
    ///
    /// 返回的 [`FutexRef`] 持有一个引用；除非指定 [`GetFlags::DONT_LOCK`]，返回时已加锁。
    /// [`GetFlags::DONT_CREATE`] 下对象不存在返回 `Ok(None)`。
    pub fn get(&self, key: FutexKey, uaddr: usize, flags: GetFlags) -> FutexResult<Option<FutexRef<'_>>> {
        let lock_it = !flags.contains(GetFlags::DONT_LOCK);
        let mut spare: Option<Arc<Futex>> = None;

        loop {
            let mut futexes = self.futexes.lock();

            if let Some(futex) = futexes.get(&key) {
                if flags.contains(GetFlags::DONT_EXIST) {
                    return Err(FutexError::AlreadyExists);
                }
                futex.refcount.fetch_add(1, Ordering::AcqRel);
                let futex = futex.clone();
                drop(futexes);

                trace!(
                    "futex get: uaddr={:#x} key={:?} ref={} hit",
                    uaddr,
                    key,
                    futex.ref_count()
                );
                let mut fref = FutexRef::adopt(self, futex, false);
                if lock_it {
                    fref.lock();
                }
                return Ok(Some(fref));
            }

            if flags.contains(GetFlags::DONT_CREATE) {
                drop(futexes);
                trace!("futex get: uaddr={:#x} key={:?} null", uaddr, key);
                return Ok(None);
            }

            match spare.take() {
                None => {
                    // 不在表锁内分配，分配完成后重新查找
                    drop(futexes);
                    spare = Some(Arc::new(Futex::new(key, uaddr)));
                }
                Some(futex) => {
                    futexes.try_reserve(1)?;
                    if lock_it {
                        futex.lock.lock();
                    }
                    futexes.insert(key, futex.clone());
                    drop(futexes);

                    trace!("futex get: uaddr={:#x} key={:?} new", uaddr, key);
                    return Ok(Some(FutexRef::adopt(self, futex, lock_it)));
                }
            }
        }
    }

    /// 释放一个引用，计数归零时移除对象
    fn release(&self, futex: &Arc<Futex>) {
        let mut futexes = self.futexes.lock();
        let prev = futex.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        if prev == 1 {
            if futexes
                .get(&futex.key)
                .is_some_and(|cur| Arc::ptr_eq(cur, futex))
            {
                futexes.remove(&futex.key);
            }
            drop(futexes);
            trace!("futex put: uaddr={:#x} destroy", futex.uaddr);
        } else {
            drop(futexes);
            trace!("futex put: uaddr={:#x} ref={}", futex.uaddr, prev - 1);
        }
    }

    /// 表中对象个数
    pub fn len(&self) -> usize {
        self.futexes.lock().len()
    }

    /// 表是否为空
    pub fn is_empty(&self) -> bool {
        self.futexes.lock().is_empty()
    }

    /// key 是否有存活对象
    pub fn contains(&self, key: &FutexKey) -> bool {
        self.futexes.lock().contains_key(key)
    }

    /// key 对应对象的引用计数
    pub fn ref_count(&self, key: &FutexKey) -> Option<usize> {
        self.futexes.lock().get(key).map(|f| f.ref_count())
    }

    /// key 对应对象队列中的等待者数量
    pub fn waiter_count(&self, key: &FutexKey) -> Option<usize> {
        // 表锁是叶子锁，先复制句柄再加对象锁
        let futex = self.futexes.lock().get(key).cloned()?;
        futex.lock.lock();
        // SAFETY: 持有对象锁
        let count = unsafe { (*futex.queue.get()).waiters.len() };
        // SAFETY: 当前上下文持有锁
        unsafe { futex.lock.unlock() };
        Some(count)
    }
}

impl Default for FutexTable {
    fn default() -> Self {
        Self::new()
    }
}

/// 持有一个对象引用的句柄
///
/// 记录自身是否持有对象锁；drop 时先解锁再释放引用。
pub struct FutexRef<'t> {
    table: &'t FutexTable,
    futex: Arc<Futex>,
    locked: bool,
}

impl<'t> FutexRef<'t> {
    /// 接管一个已计入引用计数的引用
    pub(crate) fn adopt(table: &'t FutexTable, futex: Arc<Futex>, locked: bool) -> Self {
        Self {
            table,
            futex,
            locked,
        }
    }

    /// 所属注册表
    pub fn table(&self) -> &'t FutexTable {
        self.table
    }

    /// 底层对象
    pub fn futex(&self) -> &Arc<Futex> {
        &self.futex
    }

    /// 对象的 key
    pub fn key(&self) -> FutexKey {
        self.futex.key
    }

    /// 是否持有对象锁
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// 加对象锁
    pub fn lock(&mut self) {
        assert!(!self.locked, "futex already locked by this reference");
        self.futex.lock.lock();
        self.locked = true;
    }

    /// 释放对象锁（未持有时什么也不做）
    pub fn unlock(&mut self) {
        if self.locked {
            // SAFETY: locked 为 true 说明锁由本句柄获取
            unsafe { self.futex.lock.unlock() };
            self.locked = false;
        }
    }

    /// 访问受锁保护的队列
    pub(crate) fn queue(&mut self) -> &mut FutexQueue {
        assert!(self.locked, "futex queue accessed without its lock");
        // SAFETY: 持有对象锁，且 &mut self 保证本句柄内不存在其他借用
        unsafe { &mut *self.futex.queue.get() }
    }

    /// 释放引用；若给出等待节点且节点尚未被摘除，先把它移出队列
    pub fn put(mut self, node: Option<&WaitNode>) {
        if let Some(node) = node {
            if !node.is_removed() {
                if !self.locked {
                    self.lock();
                }
                self.queue().unlink(node);
            }
        }
        // drop 负责解锁和释放引用
    }

    /// 睡眠返回后重新锁定节点当前所在的对象
    ///
    /// 节点被 requeue 过时，放弃本句柄对原对象的引用，改为接管节点在新对象上的引用。
    /// 返回的句柄已加锁，且节点在返回期间不会再被移动。
    pub(crate) fn relock_for(mut self, node: &WaitNode) -> FutexRef<'t> {
        self.unlock();
        loop {
            let target = node.current();
            target.lock.lock();
            if Arc::ptr_eq(&target, &node.current()) {
                if Arc::ptr_eq(&target, &self.futex) {
                    if node.is_requeued() {
                        // 绕了一圈又回到原对象，节点持有的那个引用不再需要
                        target.release_extra();
                    }
                    self.locked = true;
                    return self;
                }
                // 节点已被移走，它在 target 上持有的引用转给调用者
                let moved = FutexRef::adopt(self.table, target, true);
                drop(self);
                return moved;
            }
            // 加锁期间节点又被移动了
            // SAFETY: 上面刚获取的锁
            unsafe { target.lock.unlock() };
        }
    }
}

impl Drop for FutexRef<'_> {
    fn drop(&mut self) {
        self.unlock();
        self.table.release(&self.futex);
    }
}

impl core::fmt::Debug for FutexRef<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FutexRef")
            .field("futex", &self.futex)
            .field("locked", &self.locked)
            .finish()
    }
}

/// 以统一顺序锁住两个对象
///
/// 所有需要同时持有两把对象锁的操作都经由此函数加锁：按 [`FutexKey`] 的全序
/// 先锁较小者，交换参数顺序的并发调用不会死锁。两个句柄指向同一对象时
/// （不同地址映射到同一共享位置），丢弃 `b` 的引用，只锁一次并返回 `None`。
pub fn lock_pair<'t>(a: &mut FutexRef<'t>, mut b: FutexRef<'t>) -> Option<FutexRef<'t>> {
    debug_assert!(!a.is_locked() && !b.is_locked());

    if Arc::ptr_eq(&a.futex, &b.futex) {
        drop(b);
        a.lock();
        return None;
    }

    if a.key() <= b.key() {
        a.lock();
        b.lock();
    } else {
        b.lock();
        a.lock();
    }
    Some(b)
}
