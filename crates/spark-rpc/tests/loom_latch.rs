//! `CompletionLatch` 的 Loom 模型检验：`RUSTFLAGS="--cfg loom" cargo test --test loom_latch`。
#![cfg(loom)]

use loom::{sync::Arc, thread};
use spark_rpc::future::{CompletionLatch, LatchState};

#[test]
fn exactly_one_completer_wins_under_all_interleavings() {
    loom::model(|| {
        let latch = Arc::new(CompletionLatch::new());
        let racers: Vec<_> = [true, false]
            .into_iter()
            .map(|succeeded| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || {
                    if latch.try_acquire() {
                        latch.publish(succeeded);
                        1usize
                    } else {
                        0
                    }
                })
            })
            .collect();
        let wins: usize = racers.into_iter().map(|racer| racer.join().unwrap()).sum();
        assert_eq!(wins, 1);
        assert!(matches!(
            latch.state(),
            LatchState::Succeeded | LatchState::Failed
        ));
    });
}

#[test]
fn observers_never_see_a_state_go_backwards() {
    loom::model(|| {
        let latch = Arc::new(CompletionLatch::new());
        let writer = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                if latch.try_acquire() {
                    latch.publish(true);
                }
            })
        };
        let first = latch.state();
        let second = latch.state();
        if first.is_terminal() {
            assert_eq!(first, second);
        }
        writer.join().unwrap();
        assert_eq!(latch.state(), LatchState::Succeeded);
    });
}
