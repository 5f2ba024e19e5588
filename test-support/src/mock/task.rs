//! 线程相关的 Mock 实现
//!
//! - [`MockBlocker`]：基于 `Condvar` 的 park/unpark 令牌，可以注入“信号打断”
//! - [`MockThreadTable`]：tid -> pid 的线程表
//! - [`MockTask`]：调用 futex 的线程上下文
//!
//! `futex` crate 在 `cfg(test)` 下为这些类型实现 `Blocker` / `FutexTask`。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::mm::MockUserSpace;

/// [`MockBlocker::park`] 的返回原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkResult {
    Unparked,
    TimedOut,
    Interrupted { restartable: bool },
}

#[derive(Default)]
struct BlockerState {
    token: bool,
    interrupt: Option<bool>,
    parked: bool,
}

/// Mock 阻塞令牌
#[derive(Default)]
pub struct MockBlocker {
    state: Mutex<BlockerState>,
    cond: Condvar,
}

impl MockBlocker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 等待令牌、打断或超时
    pub fn park(&self, timeout: Option<Duration>) -> ParkResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.token {
                state.token = false;
                return ParkResult::Unparked;
            }
            if let Some(restartable) = state.interrupt.take() {
                return ParkResult::Interrupted { restartable };
            }
            state.parked = true;
            state = match deadline {
                None => self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.parked = false;
                        return ParkResult::TimedOut;
                    }
                    self.cond.wait_timeout(state, deadline - now).unwrap().0
                }
            };
            state.parked = false;
        }
    }

    pub fn unpark(&self) {
        self.state.lock().unwrap().token = true;
        self.cond.notify_all();
    }

    /// 模拟向线程投递信号
    pub fn interrupt(&self, restartable: bool) {
        self.state.lock().unwrap().interrupt = Some(restartable);
        self.cond.notify_all();
    }

    /// 线程当前是否阻塞在令牌上
    pub fn is_parked(&self) -> bool {
        self.state.lock().unwrap().parked
    }
}

/// 查询线程失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectError {
    NoSuchThread,
    PermissionDenied,
}

/// Mock 线程表
#[derive(Default)]
pub struct MockThreadTable {
    threads: Mutex<HashMap<u32, u32>>,
}

impl MockThreadTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, tid: u32, pid: u32) {
        self.threads.lock().unwrap().insert(tid, pid);
    }

    pub fn pid_of(&self, tid: u32) -> Option<u32> {
        self.threads.lock().unwrap().get(&tid).copied()
    }
}

fn boot_instant() -> Instant {
    static BOOT: OnceLock<Instant> = OnceLock::new();
    *BOOT.get_or_init(Instant::now)
}

/// Mock 线程上下文
pub struct MockTask {
    pub tid: u32,
    pub pid: u32,
    pub space: Arc<MockUserSpace>,
    pub blocker: Arc<MockBlocker>,
    pub threads: Arc<MockThreadTable>,
    /// 可以查询其他进程的线程
    pub privileged: bool,
    yields: AtomicUsize,
}

impl MockTask {
    /// 创建线程并登记到线程表
    pub fn new(tid: u32, pid: u32, space: Arc<MockUserSpace>, threads: Arc<MockThreadTable>) -> Self {
        threads.insert(tid, pid);
        Self {
            tid,
            pid,
            space,
            blocker: MockBlocker::new(),
            threads,
            privileged: false,
            yields: AtomicUsize::new(0),
        }
    }

    /// 自启动以来的单调时间
    pub fn monotonic_now(&self) -> Duration {
        boot_instant().elapsed()
    }

    /// 墙上时间
    pub fn realtime_now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    pub fn relinquish(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
        std::thread::yield_now();
    }

    /// 主动让出处理器的次数
    pub fn yield_count(&self) -> usize {
        self.yields.load(Ordering::Relaxed)
    }

    /// 同进程的线程总能查询；其他进程的线程需要特权
    pub fn inspect(&self, tid: u32) -> Result<(), InspectError> {
        let pid = self.threads.pid_of(tid).ok_or(InspectError::NoSuchThread)?;
        if pid == self.pid || self.privileged {
            Ok(())
        } else {
            Err(InspectError::PermissionDenied)
        }
    }
}
