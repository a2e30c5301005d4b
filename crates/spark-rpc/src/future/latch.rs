use crate::sync::{AtomicU8, Ordering};

const PENDING: u8 = 0;
const COMPLETING: u8 = 1;
const SUCCEEDED: u8 = 2;
const FAILED: u8 = 3;

/// 终态闩的可观察状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatchState {
    Pending,
    /// 已有完成者胜出，正在写入终态。
    Completing,
    Succeeded,
    Failed,
}

impl LatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LatchState::Succeeded | LatchState::Failed)
    }
}

/// `CompletionLatch` 用一次比较交换裁决“谁来完成这次调用”。
///
/// # 契约说明（What）
/// - [`try_acquire`](Self::try_acquire) 仅对第一个调用者返回 `true`，之后恒为 `false`；
/// - 胜出者写完终态后调用 [`publish`](Self::publish)，以 `Release` 语义公开；
///   观察者以 `Acquire` 读取到终态后即可安全读取胜出者写入的数据；
/// - 状态只前进：`Pending → Completing → Succeeded | Failed`。
#[derive(Debug)]
pub struct CompletionLatch {
    state: AtomicU8,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
        }
    }

    /// 尝试成为唯一完成者。
    pub fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(PENDING, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 胜出者公开终态；未经 `try_acquire` 胜出的调用会被忽略。
    pub fn publish(&self, succeeded: bool) {
        let terminal = if succeeded { SUCCEEDED } else { FAILED };
        let _ = self.state.compare_exchange(
            COMPLETING,
            terminal,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn state(&self) -> LatchState {
        match self.state.load(Ordering::Acquire) {
            PENDING => LatchState::Pending,
            COMPLETING => LatchState::Completing,
            SUCCEEDED => LatchState::Succeeded,
            _ => LatchState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

impl Default for CompletionLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn only_first_acquire_wins() {
        let latch = CompletionLatch::new();
        assert!(latch.try_acquire());
        assert!(!latch.try_acquire());
        assert_eq!(latch.state(), LatchState::Completing);
        latch.publish(false);
        assert_eq!(latch.state(), LatchState::Failed);
        latch.publish(true);
        assert_eq!(latch.state(), LatchState::Failed, "终态不可回写");
    }

    #[test]
    fn publish_without_acquire_is_ignored() {
        let latch = CompletionLatch::new();
        latch.publish(true);
        assert_eq!(latch.state(), LatchState::Pending);
    }
}
