//! futex 子系统配置常量

/// 遍历 robust list 时处理的最大节点数，防止用户态构造环形链表
pub const ROBUST_LIST_LIMIT: usize = 2048;

/// 睡眠超时的上限（秒），更长的超时会被截断
pub const MAX_TIMEOUT_SECS: u64 = (i32::MAX / 2) as u64;

/// robust list 头部结构体的大小，`set_robust_list` 只接受这一长度
pub const ROBUST_LIST_HEAD_SIZE: usize = uapi::futex::ROBUST_LIST_HEAD_SIZE;
