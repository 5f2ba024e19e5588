//! Linux errno 取值
//!
//! 仅收录 futex 相关路径会返回的错误码。

pub const EPERM: i32 = 1;
pub const ESRCH: i32 = 3;
pub const EINTR: i32 = 4;
pub const EAGAIN: i32 = 11;
pub const EWOULDBLOCK: i32 = EAGAIN;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;
pub const EEXIST: i32 = 17;
pub const EINVAL: i32 = 22;
pub const ENOSYS: i32 = 38;
pub const ETIMEDOUT: i32 = 110;

/// 内核内部使用：系统调用应被重新启动（不会泄漏到用户空间）
pub const ERESTARTSYS: i32 = 512;
