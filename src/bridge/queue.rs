// src/bridge/queue.rs
//! Thread → async hand-off.
//!
//! Producers are plain OS threads (recorder, scan worker, analyzer). The
//! consumer is a task on a tokio runtime. Messages go through the native
//! tokio channel while that runtime is alive and through a crossbeam queue
//! otherwise, so a producer never blocks and never fails.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam::channel::{self as cb, Select};
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};

/// Poll period of the degraded blocking receive.
const DEGRADED_POLL: Duration = Duration::from_millis(100);

/// Liveness of the runtime that owns the consumer side.
///
/// A sentinel task parks forever on the runtime holding an `Arc<()>`. When
/// the runtime shuts down it drops its tasks, and the `Weak` stops upgrading.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    sentinel: Weak<()>,
}

impl SchedulerHandle {
    /// Handle for the runtime the caller is running on, detached if none.
    pub fn current() -> Self {
        match Handle::try_current() {
            Ok(handle) => Self::attach(&handle),
            Err(_) => Self::detached(),
        }
    }

    pub fn attach(handle: &Handle) -> Self {
        let token = Arc::new(());
        let sentinel = Arc::downgrade(&token);
        handle.spawn(async move {
            let _token = token;
            std::future::pending::<()>().await;
        });
        Self { sentinel }
    }

    /// A handle that never reports a live scheduler.
    pub fn detached() -> Self {
        Self {
            sentinel: Weak::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.sentinel.strong_count() > 0
    }
}

/// Bounded two-tier queue. Per-producer FIFO, no ordering across producers.
pub struct MessageBridge<T> {
    native_tx: mpsc::Sender<T>,
    native_rx: AsyncMutex<mpsc::Receiver<T>>,
    fallback_tx: cb::Sender<T>,
    fallback_rx: cb::Receiver<T>,
    notify: Notify,
    scheduler: SchedulerHandle,
    dropped: AtomicU64,
}

impl<T: Send + 'static> MessageBridge<T> {
    pub fn new(capacity: usize, scheduler: SchedulerHandle) -> Self {
        let capacity = capacity.max(1);
        let (native_tx, native_rx) = mpsc::channel(capacity);
        let (fallback_tx, fallback_rx) = cb::bounded(capacity);
        Self {
            native_tx,
            native_rx: AsyncMutex::new(native_rx),
            fallback_tx,
            fallback_rx,
            notify: Notify::new(),
            scheduler,
            dropped: AtomicU64::new(0),
        }
    }

    /// Bound to the runtime of the calling task.
    pub fn for_current(capacity: usize) -> Self {
        Self::new(capacity, SchedulerHandle::current())
    }

    pub fn is_degraded(&self) -> bool {
        !self.scheduler.is_alive()
    }

    /// Messages discarded because a queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Messages waiting in the fallback tier.
    pub fn fallback_len(&self) -> usize {
        self.fallback_rx.len()
    }

    /// Callable from any thread. Never blocks, never fails; a full queue
    /// drops the message and counts it.
    pub fn put_from_thread(&self, msg: T) {
        let msg = if self.scheduler.is_alive() {
            match self.native_tx.try_send(msg) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.record_drop("native");
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(msg)) => msg,
            }
        } else {
            msg
        };

        match self.fallback_tx.try_send(msg) {
            Ok(()) => self.notify.notify_one(),
            Err(cb::TrySendError::Full(_)) => self.record_drop("fallback"),
            Err(cb::TrySendError::Disconnected(_)) => self.record_drop("fallback"),
        }
    }

    fn record_drop(&self, tier: &str) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!("bridge {} queue full, message dropped (total dropped: {})", tier, total);
    }

    /// Next message without waiting.
    pub fn try_get(&self) -> Option<T> {
        if let Ok(mut rx) = self.native_rx.try_lock() {
            if let Ok(msg) = rx.try_recv() {
                return Some(msg);
            }
        }
        self.fallback_rx.try_recv().ok()
    }

    /// Waits for the next message: native queue first, then fallback, then
    /// suspends on the native queue. Fallback puts wake the waiter too.
    ///
    /// The live path needs a tokio runtime (timer and channel wakeups). A
    /// degraded bridge can also be drained from a foreign executor; the
    /// blocking receive then runs inline.
    pub async fn get(&self) -> T {
        loop {
            if let Some(msg) = self.try_get() {
                return msg;
            }

            if self.is_degraded() {
                self.wait_fallback_blocking().await;
                continue;
            }

            let notified = self.notify.notified();
            let mut rx = self.native_rx.lock().await;
            if let Ok(msg) = rx.try_recv() {
                return msg;
            }
            if let Ok(msg) = self.fallback_rx.try_recv() {
                return msg;
            }
            tokio::select! {
                msg = rx.recv() => {
                    if let Some(msg) = msg {
                        return msg;
                    }
                }
                _ = notified => {}
                // Runtime-Check, falls der Scheduler wegstirbt
                _ = tokio::time::sleep(DEGRADED_POLL) => {}
            }
        }
    }

    /// Waits on the blocking pool until the fallback tier has a message.
    /// Only readiness is awaited so a cancelled `get` never loses one.
    /// Outside a tokio context the wait happens on the calling thread.
    async fn wait_fallback_blocking(&self) {
        let rx = self.fallback_rx.clone();
        let Ok(handle) = Handle::try_current() else {
            wait_ready(&rx);
            return;
        };
        let waited = handle.spawn_blocking(move || wait_ready(&rx)).await;
        if let Err(e) = waited {
            log::error!("degraded bridge wait failed: {}", e);
        }
    }

    /// Drains everything currently queued, native tier first.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(msg) = self.try_get() {
            out.push(msg);
        }
        out
    }
}

impl<T> Drop for MessageBridge<T> {
    fn drop(&mut self) {
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            log::info!("message bridge closed, {} messages were dropped", dropped);
        }
    }
}

fn wait_ready<T>(rx: &cb::Receiver<T>) {
    let mut select = Select::new();
    select.recv(rx);
    let _ = select.ready_timeout(DEGRADED_POLL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_handle_is_not_alive() {
        assert!(!SchedulerHandle::detached().is_alive());
        assert!(!SchedulerHandle::current().is_alive());
    }

    #[test]
    fn test_runtime_shutdown_is_observed() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = SchedulerHandle::attach(runtime.handle());
        assert!(handle.is_alive());
        drop(runtime);
        assert!(!handle.is_alive());
    }

    #[test]
    fn test_degraded_puts_use_fallback() {
        let bridge = MessageBridge::new(4, SchedulerHandle::detached());
        assert!(bridge.is_degraded());
        bridge.put_from_thread(1);
        bridge.put_from_thread(2);
        assert_eq!(bridge.fallback_len(), 2);
        assert_eq!(bridge.drain(), vec![1, 2]);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let bridge = MessageBridge::new(2, SchedulerHandle::detached());
        for i in 0..5 {
            bridge.put_from_thread(i);
        }
        assert_eq!(bridge.dropped_count(), 3);
        assert_eq!(bridge.drain(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_native_path_when_runtime_alive() {
        let bridge = Arc::new(MessageBridge::for_current(8));
        assert!(!bridge.is_degraded());

        let producer = bridge.clone();
        std::thread::spawn(move || {
            for i in 0..3 {
                producer.put_from_thread(i);
            }
        })
        .join()
        .unwrap();

        assert_eq!(bridge.fallback_len(), 0);
        assert_eq!(bridge.get().await, 0);
        assert_eq!(bridge.get().await, 1);
        assert_eq!(bridge.get().await, 2);
    }

    #[tokio::test]
    async fn test_get_wakes_on_later_put() {
        let bridge = Arc::new(MessageBridge::for_current(8));
        let producer = bridge.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.put_from_thread("late");
        });

        let msg = tokio::time::timeout(Duration::from_secs(5), bridge.get())
            .await
            .unwrap();
        assert_eq!(msg, "late");
    }

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        struct Unpark(std::thread::Thread);
        impl std::task::Wake for Unpark {
            fn wake(self: Arc<Self>) {
                self.0.unpark();
            }
        }
        let waker = std::task::Waker::from(Arc::new(Unpark(std::thread::current())));
        let mut cx = std::task::Context::from_waker(&waker);
        let mut fut = std::pin::pin!(fut);
        loop {
            if let std::task::Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
                return out;
            }
            std::thread::park_timeout(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_degraded_get_outside_runtime() {
        let bridge = Arc::new(MessageBridge::new(8, SchedulerHandle::detached()));
        let producer = bridge.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            producer.put_from_thread(7);
        });

        assert!(Handle::try_current().is_err());
        assert_eq!(block_on(bridge.get()), 7);
    }
}
