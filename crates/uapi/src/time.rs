//! 时间相关结构体

use core::time::Duration;

const NSEC_PER_SEC: i64 = 1_000_000_000;

/// 对应 Linux 的 `struct timespec`（LP64）
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSpec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl TimeSpec {
    pub const fn new(tv_sec: i64, tv_nsec: i64) -> Self {
        Self { tv_sec, tv_nsec }
    }

    /// 是否为合法的时间值（秒非负，纳秒位于 `[0, 1e9)`）
    pub fn is_valid(&self) -> bool {
        self.tv_sec >= 0 && (0..NSEC_PER_SEC).contains(&self.tv_nsec)
    }

    /// 转换为 [`Duration`]，非法值返回 `None`
    pub fn to_duration(&self) -> Option<Duration> {
        if !self.is_valid() {
            return None;
        }
        Some(Duration::new(self.tv_sec as u64, self.tv_nsec as u32))
    }

    pub fn from_duration(d: Duration) -> Self {
        Self {
            tv_sec: d.as_secs() as i64,
            tv_nsec: d.subsec_nanos() as i64,
        }
    }
}
