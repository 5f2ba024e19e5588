//! futex 错误类型
//!
//! 定义了 futex 子系统的错误分类，可通过 [`FutexError::to_errno()`] 转换为系统调用错误码。

use uapi::errno::*;

/// 用户内存访问失败（页错误无法解决或地址无效）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault;

/// futex 错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexError {
    /// 无效参数：bitset 为 0、地址未对齐、两个地址相同、计数为负等 (-EINVAL)
    InvalidArgument,
    /// 不创建模式下对象不存在 (-EINVAL)
    NotFound,
    /// 要求对象不存在时对象已存在 (-EINVAL)
    ///
    /// CMP_REQUEUE 的目标对象已存在时返回此错误，glibc 会回退为 FUTEX_WAKE。
    AlreadyExists,
    /// 睡眠前 futex 字的值与期望值不符 (-EAGAIN)
    WouldBlock,
    /// 持锁后 futex 字的值与期望值不符 (-EAGAIN)
    TryAgain,
    /// 等待超时 (-ETIMEDOUT)
    TimedOut,
    /// 等待被信号打断 (-EINTR)
    Interrupted,
    /// 等待被信号打断，系统调用应重新启动 (-ERESTARTSYS)
    Restart,
    /// 用户内存访问失败 (-EFAULT)
    Fault,
    /// 操作不支持 (-ENOSYS)
    NotSupported,
    /// 内存不足 (-ENOMEM)
    NoMemory,
    /// 权限不足 (-EPERM)
    PermissionDenied,
    /// 目标线程不存在 (-ESRCH)
    NoSuchThread,
}

impl FutexError {
    /// 转换为系统调用错误码（负数）
    pub fn to_errno(&self) -> isize {
        let errno = match self {
            FutexError::InvalidArgument | FutexError::NotFound | FutexError::AlreadyExists => {
                EINVAL
            }
            FutexError::WouldBlock => EWOULDBLOCK,
            FutexError::TryAgain => EAGAIN,
            FutexError::TimedOut => ETIMEDOUT,
            FutexError::Interrupted => EINTR,
            FutexError::Restart => ERESTARTSYS,
            FutexError::Fault => EFAULT,
            FutexError::NotSupported => ENOSYS,
            FutexError::NoMemory => ENOMEM,
            FutexError::PermissionDenied => EPERM,
            FutexError::NoSuchThread => ESRCH,
        };
        -(errno as isize)
    }
}

impl From<MemFault> for FutexError {
    fn from(_: MemFault) -> Self {
        FutexError::Fault
    }
}

impl From<alloc::collections::TryReserveError> for FutexError {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        FutexError::NoMemory
    }
}

impl From<hashbrown::TryReserveError> for FutexError {
    fn from(_: hashbrown::TryReserveError) -> Self {
        FutexError::NoMemory
    }
}

/// futex 操作的结果类型
pub type FutexResult<T> = Result<T, FutexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FutexError::InvalidArgument.to_errno(), -22);
        assert_eq!(FutexError::AlreadyExists.to_errno(), -22);
        assert_eq!(FutexError::WouldBlock.to_errno(), -11);
        assert_eq!(FutexError::TryAgain.to_errno(), -11);
        assert_eq!(FutexError::TimedOut.to_errno(), -110);
        assert_eq!(FutexError::Fault.to_errno(), -14);
        assert_eq!(FutexError::NotSupported.to_errno(), -38);
        assert_eq!(FutexError::Restart.to_errno(), -512);
        assert_eq!(FutexError::NoSuchThread.to_errno(), -3);
    }

    #[test]
    fn test_mem_fault_converts_to_fault() {
        let err: FutexError = MemFault.into();
        assert_eq!(err, FutexError::Fault);
    }
}
