//! 用户内存的 Mock 实现
//!
//! - [`MockPhysMemory`]：按 (内存对象, 偏移) 寻址的“物理内存”，可被多个地址空间共享
//! - [`MockUserSpace`]：一个地址空间，由若干映射区域组成，支持把页换出以模拟页错误
//!
//! 注意：这里不直接依赖 `futex` crate（避免循环依赖）。
//! `futex` crate 在 `cfg(test)` 下为 [`MockUserSpace`] 实现 `UserMemory`。

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Mock 页大小
pub const PAGE_SIZE: usize = 4096;

thread_local! {
    /// 当前线程的页错误禁用深度
    static PAGEFAULT_DISABLED: Cell<usize> = const { Cell::new(0) };
}

/// 可在多个地址空间之间共享的内存
pub struct MockPhysMemory {
    bytes: Mutex<HashMap<(usize, usize), u8>>,
    next_object: AtomicUsize,
}

impl MockPhysMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(HashMap::new()),
            next_object: AtomicUsize::new(1),
        })
    }

    /// 分配一个新的内存对象标识
    pub fn alloc_object(&self) -> usize {
        self.next_object.fetch_add(1, Ordering::Relaxed)
    }

    fn load(&self, object: usize, offset: usize, len: usize) -> u64 {
        let bytes = self.bytes.lock().unwrap();
        (0..len).rev().fold(0u64, |acc, i| {
            (acc << 8) | *bytes.get(&(object, offset + i)).unwrap_or(&0) as u64
        })
    }

    fn store(&self, object: usize, offset: usize, len: usize, value: u64) {
        let mut bytes = self.bytes.lock().unwrap();
        for i in 0..len {
            bytes.insert((object, offset + i), (value >> (8 * i)) as u8);
        }
    }

    /// 在同一把锁内对一个 32 位字做读-改-写，返回旧值
    fn update_u32(&self, object: usize, offset: usize, f: impl FnOnce(u32) -> Option<u32>) -> u32 {
        let mut bytes = self.bytes.lock().unwrap();
        let old = (0..4).rev().fold(0u32, |acc, i| {
            (acc << 8) | *bytes.get(&(object, offset + i)).unwrap_or(&0) as u32
        });
        if let Some(new) = f(old) {
            for i in 0..4 {
                bytes.insert((object, offset + i), (new >> (8 * i)) as u8);
            }
        }
        old
    }
}

/// 地址空间中的一段映射
#[derive(Debug, Clone, Copy)]
struct Region {
    start: usize,
    len: usize,
    object: usize,
    offset: usize,
    shared: bool,
}

/// Mock 地址空间
pub struct MockUserSpace {
    id: usize,
    phys: Arc<MockPhysMemory>,
    regions: Mutex<Vec<Region>>,
    /// 被换出的页（页号）
    evicted: Mutex<HashSet<usize>>,
    /// 页错误被解决的次数
    faults: AtomicUsize,
}

impl MockUserSpace {
    pub fn new(id: usize, phys: Arc<MockPhysMemory>) -> Arc<Self> {
        Arc::new(Self {
            id,
            phys,
            regions: Mutex::new(Vec::new()),
            evicted: Mutex::new(HashSet::new()),
            faults: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn phys(&self) -> &Arc<MockPhysMemory> {
        &self.phys
    }

    /// 建立私有匿名映射，返回后备对象
    pub fn map_private(&self, start: usize, len: usize) -> usize {
        let object = self.phys.alloc_object();
        self.map(start, len, object, 0, false);
        object
    }

    /// 把内存对象以共享方式映射到 `start`
    pub fn map_shared(&self, start: usize, len: usize, object: usize, offset: usize) {
        self.map(start, len, object, offset, true);
    }

    fn map(&self, start: usize, len: usize, object: usize, offset: usize, shared: bool) {
        self.regions.lock().unwrap().push(Region {
            start,
            len,
            object,
            offset,
            shared,
        });
    }

    /// 换出 `uaddr` 所在的页，之后禁用页错误的访问会失败
    pub fn evict(&self, uaddr: usize) {
        self.evicted.lock().unwrap().insert(uaddr / PAGE_SIZE);
    }

    pub fn is_resident(&self, uaddr: usize) -> bool {
        !self.evicted.lock().unwrap().contains(&(uaddr / PAGE_SIZE))
    }

    /// 已解决的页错误次数
    pub fn fault_count(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }

    fn translate(&self, uaddr: usize, len: usize) -> Option<Region> {
        let end = uaddr.checked_add(len)?;
        self.regions
            .lock()
            .unwrap()
            .iter()
            .find(|r| uaddr >= r.start && end <= r.start + r.len)
            .copied()
    }

    /// 查询地址所在映射，返回 (对象, 对象内偏移, 是否共享)
    pub fn mapping(&self, uaddr: usize) -> Option<(usize, usize, bool)> {
        let r = self.translate(uaddr, 1)?;
        Some((r.object, r.offset + (uaddr - r.start), r.shared))
    }

    /// 解决 `uaddr` 处的页错误（把页换入），地址无效时返回 `None`
    pub fn fault_in(&self, uaddr: usize, len: usize) -> Option<()> {
        self.translate(uaddr, len)?;
        let mut evicted = self.evicted.lock().unwrap();
        for page in uaddr / PAGE_SIZE..=(uaddr + len - 1) / PAGE_SIZE {
            if evicted.remove(&page) {
                self.faults.fetch_add(1, Ordering::Relaxed);
            }
        }
        Some(())
    }

    /// 访问前检查：页不在内存中时，禁用页错误则失败，否则换入
    fn access(&self, uaddr: usize, len: usize) -> Option<(usize, usize)> {
        let r = self.translate(uaddr, len)?;
        if !self.is_resident(uaddr) || !self.is_resident(uaddr + len - 1) {
            if Self::page_faults_disabled() {
                return None;
            }
            self.fault_in(uaddr, len)?;
        }
        Some((r.object, r.offset + (uaddr - r.start)))
    }

    // ========== 测试直接读写（不受换页影响） ==========

    pub fn store_u32(&self, uaddr: usize, value: u32) {
        let r = self.translate(uaddr, 4).expect("store_u32: unmapped address");
        self.phys
            .store(r.object, r.offset + (uaddr - r.start), 4, value as u64);
    }

    pub fn load_u32(&self, uaddr: usize) -> u32 {
        let r = self.translate(uaddr, 4).expect("load_u32: unmapped address");
        self.phys.load(r.object, r.offset + (uaddr - r.start), 4) as u32
    }

    pub fn store_usize(&self, uaddr: usize, value: usize) {
        let len = size_of::<usize>();
        let r = self
            .translate(uaddr, len)
            .expect("store_usize: unmapped address");
        self.phys
            .store(r.object, r.offset + (uaddr - r.start), len, value as u64);
    }

    // ========== 内核访问路径 ==========

    /// 只读取已在内存中的页
    pub fn read_u32_resident(&self, uaddr: usize) -> Option<u32> {
        let r = self.translate(uaddr, 4)?;
        if !self.is_resident(uaddr) {
            return None;
        }
        Some(self.phys.load(r.object, r.offset + (uaddr - r.start), 4) as u32)
    }

    /// 读取 32 位字，必要时换入
    pub fn read_u32_faulting(&self, uaddr: usize) -> Option<u32> {
        let (object, offset) = self.access(uaddr, 4)?;
        Some(self.phys.load(object, offset, 4) as u32)
    }

    /// 读取机器字，必要时换入
    pub fn read_usize_faulting(&self, uaddr: usize) -> Option<usize> {
        let len = size_of::<usize>();
        let (object, offset) = self.access(uaddr, len)?;
        Some(self.phys.load(object, offset, len) as usize)
    }

    /// 比较并交换，返回旧值
    pub fn cmpxchg_u32(&self, uaddr: usize, expected: u32, new: u32) -> Option<u32> {
        let (object, offset) = self.access(uaddr, 4)?;
        Some(
            self.phys
                .update_u32(object, offset, |old| (old == expected).then_some(new)),
        )
    }

    /// 原子读-改-写，返回旧值
    pub fn update_u32(&self, uaddr: usize, f: impl FnOnce(u32) -> u32) -> Option<u32> {
        let (object, offset) = self.access(uaddr, 4)?;
        Some(self.phys.update_u32(object, offset, |old| Some(f(old))))
    }

    // ========== 页错误控制（按线程） ==========

    pub fn page_faults_disabled() -> bool {
        PAGEFAULT_DISABLED.with(|d| d.get() > 0)
    }

    pub fn disable_page_faults(&self) -> usize {
        PAGEFAULT_DISABLED.with(|d| {
            let saved = d.get();
            d.set(saved + 1);
            saved
        })
    }

    pub fn restore_page_faults(&self, saved: usize) {
        PAGEFAULT_DISABLED.with(|d| d.set(saved));
    }
}
