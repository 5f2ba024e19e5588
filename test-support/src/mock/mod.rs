//! Mock 实现模块

pub mod mm;
pub mod task;
