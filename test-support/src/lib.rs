//! 测试支持 crate
//!
//! 提供 futex 单元测试使用的 Mock 实现：用户地址空间、线程阻塞令牌、线程表与时钟。
//!
//! 这里不依赖 `futex` crate（避免循环依赖），
//! `futex` crate 在 `cfg(test)` 下为这些类型实现其 trait。

pub mod mock;
