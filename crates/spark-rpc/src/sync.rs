//! 原子类型的统一入口：常规构建使用 `std`，`--cfg loom` 下切换为 Loom 模型类型。

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicU8, Ordering};
#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicU8, Ordering};
