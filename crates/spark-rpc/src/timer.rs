//! 超时看门狗使用的定时器。
//!
//! # 教案式说明
//! - **意图（Why）**：异步调用没有任何线程阻塞在 `get` 上，截止时间必须由独立的调度者裁决；
//!   同步调用也需要同一机制兜底，避免传输永不回调时调用方无限等待。
//! - **逻辑（How）**：[`ThreadTimer`] 以一个后台线程维护按到期时间排序的小顶堆，堆中只存
//!   `(deadline, seq)` 键，任务闭包按 `seq` 存放在独立的表中；条件变量在“新任务更早到期”或
//!   “关闭”时唤醒线程。取消立即从表中移除并释放闭包，堆内残留的键在出堆或压缩时丢弃。
//! - **契约（What）**：任务最多执行一次；取消后闭包捕获的资源随即释放；
//!   定时器析构时未到期任务被丢弃，不会执行。

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, HashMap},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RpcError};

/// 堆中残留键超过存活任务数的该倍数（且超过下限）时重建堆。
const COMPACT_RATIO: usize = 2;
const COMPACT_FLOOR: usize = 64;

/// 到期时执行的任务。
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// 可调度延迟任务的定时器。
pub trait Timer: Send + Sync + 'static {
    /// 在 `delay` 之后执行 `task`，返回可用于取消的句柄。
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// 已调度任务的句柄。
#[derive(Clone, Debug)]
pub struct TimerHandle {
    seq: u64,
    cancelled: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

impl TimerHandle {
    fn new(seq: u64, shared: Weak<Shared>) -> Self {
        Self {
            seq,
            cancelled: Arc::new(AtomicBool::new(false)),
            shared,
        }
    }

    /// 取消任务并释放其闭包；返回 `true` 表示本次调用撤下了一个尚未执行的任务。
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let task = {
            let mut queue = shared.queue.lock();
            let task = queue.tasks.remove(&self.seq);
            queue.compact();
            task
        };
        // 闭包可能持有最后一份 Future 引用，在锁外释放。
        task.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct Key {
    deadline: Instant,
    seq: u64,
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    // BinaryHeap 是大顶堆，反转比较得到最早到期者在堆顶；同一时刻按提交顺序执行。
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    keys: BinaryHeap<Key>,
    tasks: HashMap<u64, TimerTask>,
    shutdown: bool,
}

impl Queue {
    fn compact(&mut self) {
        let live = self.tasks.len();
        if self.keys.len() > COMPACT_FLOOR && self.keys.len() > live * COMPACT_RATIO {
            let tasks = &self.tasks;
            self.keys.retain(|key| tasks.contains_key(&key.seq));
        }
    }
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
    seq: AtomicU64,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

/// 单后台线程驱动的定时器。
pub struct ThreadTimer {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ThreadTimer {
    /// 启动后台线程，线程名为 `name`。
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
            seq: AtomicU64::new(0),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(name.into())
            .spawn(move || run(&worker_shared))
            .map_err(|err| RpcError::configuration("failed to start timer thread").with_cause(err))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// 进程级共享定时器，首次使用时启动。
    pub fn shared() -> Result<Arc<dyn Timer>> {
        static SHARED: OnceLock<Arc<ThreadTimer>> = OnceLock::new();
        if let Some(timer) = SHARED.get() {
            return Ok(Arc::clone(timer) as Arc<dyn Timer>);
        }
        let timer = Arc::new(ThreadTimer::start("spark-rpc-timer")?);
        let timer = SHARED.get_or_init(|| timer);
        Ok(Arc::clone(timer) as Arc<dyn Timer>)
    }

    /// 尚未到期且未被取消的任务数。
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }
}

impl Timer for ThreadTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        let handle = TimerHandle::new(seq, Arc::downgrade(&self.shared));
        let deadline = Instant::now().checked_add(delay).unwrap_or_else(|| {
            Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
        });
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            drop(queue);
            handle.cancelled.store(true, Ordering::Release);
            return handle;
        }
        let earliest = queue
            .keys
            .peek()
            .is_none_or(|head| deadline < head.deadline);
        queue.keys.push(Key { deadline, seq });
        queue.tasks.insert(seq, task);
        if earliest {
            self.shared.wakeup.notify_one();
        }
        handle
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        let discarded = {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.keys.clear();
            let discarded = std::mem::take(&mut queue.tasks);
            self.shared.wakeup.notify_all();
            discarded
        };
        drop(discarded);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl fmt::Debug for ThreadTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadTimer")
            .field("pending", &self.pending())
            .finish()
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }
        let now = Instant::now();
        match queue.keys.peek().copied() {
            None => shared.wakeup.wait(&mut queue),
            Some(head) if head.deadline > now => {
                let _ = shared.wakeup.wait_until(&mut queue, head.deadline);
            }
            Some(head) => {
                queue.keys.pop();
                // 已取消的任务只剩堆内的键。
                let Some(task) = queue.tasks.remove(&head.seq) else {
                    continue;
                };
                drop(queue);
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!("timer task panicked");
                }
                queue = shared.queue.lock();
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn tasks_fire_in_deadline_order() {
        let timer = ThreadTimer::start("timer-order").unwrap();
        let (tx, rx) = mpsc::channel();
        for (delay, tag) in [(40u64, "late"), (5, "early"), (20, "middle")] {
            let tx = tx.clone();
            timer.schedule(
                Duration::from_millis(delay),
                Box::new(move || {
                    let _ = tx.send(tag);
                }),
            );
        }
        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let timer = ThreadTimer::start("timer-cancel").unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = timer.schedule(
            Duration::from_millis(10),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        assert!(handle.cancel());
        assert!(!handle.cancel(), "重复取消返回 false");
        thread::sleep(Duration::from_millis(40));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn dropping_the_timer_discards_pending_tasks() {
        let fired = Arc::new(AtomicBool::new(false));
        {
            let timer = ThreadTimer::start("timer-drop").unwrap();
            let flag = Arc::clone(&fired);
            timer.schedule(
                Duration::from_millis(30),
                Box::new(move || flag.store(true, Ordering::SeqCst)),
            );
        }
        thread::sleep(Duration::from_millis(60));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_releases_the_task_immediately() {
        let timer = ThreadTimer::start("timer-release").unwrap();
        let payload = Arc::new(vec![0u8; 1024]);
        let handles: Vec<_> = (0..200)
            .map(|_| {
                let held = Arc::clone(&payload);
                timer.schedule(Duration::from_secs(60), Box::new(move || drop(held)))
            })
            .collect();
        assert_eq!(timer.pending(), 200);
        assert_eq!(Arc::strong_count(&payload), 201);

        assert!(handles.iter().all(TimerHandle::cancel));
        assert_eq!(timer.pending(), 0, "取消后不再计入待执行任务");
        assert_eq!(Arc::strong_count(&payload), 1, "取消必须立即释放闭包捕获的资源");
        assert!(timer.shared.queue.lock().keys.len() <= COMPACT_FLOOR, "残留键应被压缩");
    }

    #[test]
    fn cancel_after_firing_reports_false() {
        let timer = ThreadTimer::start("timer-fired").unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = timer.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
    }
}
