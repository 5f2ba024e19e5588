// Unit tests for the futex core.
//
// Blocking scenarios run on host threads (`std::thread::scope`) against the mocks in
// `test-support`; the trait impls for those mocks live in `crate::ops::test_mock`.

extern crate alloc;
extern crate std;
extern crate test_support;

use alloc::sync::Arc;
use core::time::Duration;
use std::time::Instant;

use test_support::mock::mm::{MockPhysMemory, MockUserSpace};
use test_support::mock::task::{MockTask, MockThreadTable};
use uapi::futex::*;

use crate::{FutexArgs, FutexKey, FutexManager, FutexTable};

mod atomic_op;
mod key;

/// 测试进程的 pid
const PID: u32 = 100;
/// 默认地址空间中私有映射的起点
const BASE: usize = 0x1000;
/// 默认私有映射的长度
const MAP_LEN: usize = 0x4000;

/// 一个进程（单地址空间）与一个 futex 管理器
struct Fixture {
    manager: FutexManager,
    phys: Arc<MockPhysMemory>,
    space: Arc<MockUserSpace>,
    threads: Arc<MockThreadTable>,
}

impl Fixture {
    fn new() -> Self {
        let phys = MockPhysMemory::new();
        let space = MockUserSpace::new(1, phys.clone());
        space.map_private(BASE, MAP_LEN);
        Self {
            manager: FutexManager::new(),
            phys,
            space,
            threads: MockThreadTable::new(),
        }
    }

    fn task(&self, tid: u32) -> MockTask {
        MockTask::new(tid, PID, self.space.clone(), self.threads.clone())
    }

    fn table(&self) -> &FutexTable {
        self.manager.table()
    }

    fn key(&self, uaddr: usize) -> FutexKey {
        FutexKey::Private {
            space: self.space.id(),
            uaddr,
        }
    }
}

fn wait_args(uaddr: usize, val: u32) -> FutexArgs {
    FutexArgs {
        uaddr,
        op: FUTEX_WAIT | FUTEX_PRIVATE_FLAG,
        val,
        ..Default::default()
    }
}

fn wake_args(uaddr: usize, count: u32) -> FutexArgs {
    FutexArgs {
        uaddr,
        op: FUTEX_WAKE | FUTEX_PRIVATE_FLAG,
        val: count,
        ..Default::default()
    }
}

fn cmp_requeue_args(uaddr: usize, uaddr2: usize, nr_wake: i32, nr_requeue: i32, cmpval: u32) -> FutexArgs {
    FutexArgs {
        uaddr,
        op: FUTEX_CMP_REQUEUE | FUTEX_PRIVATE_FLAG,
        val: nr_wake as u32,
        val2: nr_requeue as u32,
        uaddr2,
        val3: cmpval,
        ..Default::default()
    }
}

/// 轮询直到 key 上恰好有 `n` 个等待者
fn wait_for_waiters(table: &FutexTable, key: &FutexKey, n: usize) {
    let start = Instant::now();
    while table.waiter_count(key).unwrap_or(0) != n {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "timed out waiting for {} waiters on {:?}",
            n,
            key
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// 轮询直到条件成立
fn wait_until(mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(5), "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}
