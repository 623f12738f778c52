use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

use crate::error::{Result, WebDavError};

/// Number of (bytes, time) samples kept for the rate estimate
pub const RATE_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    New,
    Active,
    Paused,
    Done,
    Error,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Done | TransferStatus::Error)
    }
}

/// Binary open/closed signal. Waiters block while it is closed and are all
/// released when it opens.
#[derive(Debug, Clone)]
pub struct PauseGate {
    state: std::sync::Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    /// A new gate starts open
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self {
            state: std::sync::Arc::new(tx),
        }
    }

    pub fn open(&self) {
        self.state.send_replace(true);
    }

    pub fn close(&self) {
        self.state.send_replace(false);
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves immediately if open, otherwise once the gate is opened
    pub async fn wait_open(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Debug)]
struct ProgressState {
    status: TransferStatus,
    total_length: Option<u64>,
    bytes_transferred: u64,
    last_update: Instant,
    window: VecDeque<(u64, Instant)>,
}

/// Backing task of a background transfer and, once awaited, its outcome
#[derive(Debug, Default)]
struct TaskSlot {
    handle: Option<JoinHandle<Result<u64>>>,
    abort: Option<AbortHandle>,
    outcome: Option<std::result::Result<u64, String>>,
}

/// Live state of one transfer.
///
/// Written by the transfer that owns it, readable from anywhere. Background
/// transfers keep their task handle here so callers can await or cancel it.
#[derive(Debug)]
pub struct TransferProgress {
    state: Mutex<ProgressState>,
    gate: PauseGate,
    backing_task: Mutex<TaskSlot>,
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TransferProgress {
    pub fn new(total_length: Option<u64>) -> Self {
        let now = Instant::now();
        let mut window = VecDeque::with_capacity(RATE_WINDOW + 1);
        window.push_back((0, now));

        Self {
            state: Mutex::new(ProgressState {
                status: TransferStatus::New,
                total_length,
                bytes_transferred: 0,
                last_update: now,
                window,
            }),
            gate: PauseGate::new(),
            backing_task: Mutex::new(TaskSlot::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records `n` more bytes moved
    pub fn add_bytes(&self, n: u64) {
        let now = Instant::now();
        let mut state = self.state();
        if !state.status.is_terminal() {
            state.status = TransferStatus::Active;
        }
        state.last_update = now;
        state.bytes_transferred += n;
        let transferred = state.bytes_transferred;
        state.window.push_back((transferred, now));
        while state.window.len() > RATE_WINDOW {
            state.window.pop_front();
        }
    }

    /// Bytes per second between the oldest and newest retained samples
    pub fn rate(&self) -> f64 {
        let state = self.state();
        let (Some(&(start_bytes, start_time)), Some(&(end_bytes, end_time))) =
            (state.window.front(), state.window.back())
        else {
            return 0.0;
        };

        let elapsed = end_time.duration_since(start_time);
        if elapsed.is_zero() {
            return 0.0;
        }
        (end_bytes - start_bytes) as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time left, when both the total length and a rate are known
    pub fn eta(&self) -> Option<Duration> {
        let rate = self.rate();
        let (total, done) = {
            let state = self.state();
            (state.total_length?, state.bytes_transferred)
        };
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(total.saturating_sub(done) as f64 / rate))
    }

    pub fn pause(&self) {
        {
            let mut state = self.state();
            if state.status.is_terminal() {
                return;
            }
            state.status = TransferStatus::Paused;
        }
        self.gate.close();
        info!("Transfer paused");
    }

    /// Reopens the gate; the status returns to Active on the next chunk
    pub fn resume(&self) {
        self.gate.open();
        info!("Transfer resumed");
    }

    pub fn is_paused(&self) -> bool {
        !self.gate.is_open()
    }

    pub fn status(&self) -> TransferStatus {
        self.state().status
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.state().bytes_transferred
    }

    pub fn total_length(&self) -> Option<u64> {
        self.state().total_length
    }

    pub fn last_update(&self) -> Instant {
        self.state().last_update
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    pub(crate) fn set_total_length(&self, total_length: Option<u64>) {
        self.state().total_length = total_length;
    }

    pub(crate) fn gate(&self) -> &PauseGate {
        &self.gate
    }

    /// Moves into Done or Error. Only the first call has an effect.
    pub(crate) fn finish(&self, success: bool) {
        let mut state = self.state();
        if state.status.is_terminal() {
            return;
        }
        state.status = if success {
            TransferStatus::Done
        } else {
            TransferStatus::Error
        };
        debug!(
            "Transfer finished as {:?} after {} bytes",
            state.status, state.bytes_transferred
        );
    }

    fn task(&self) -> MutexGuard<'_, TaskSlot> {
        self.backing_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn attach_task(&self, handle: JoinHandle<Result<u64>>) {
        let mut slot = self.task();
        slot.abort = Some(handle.abort_handle());
        slot.handle = Some(handle);
        slot.outcome = None;
    }

    /// Waits for the background transfer and returns the number of bytes moved.
    ///
    /// Once the transfer has been awaited, later calls return the same byte
    /// count, or `TaskFailed` with the message of the original error. Only one
    /// caller can wait at a time; a concurrent second call fails at once.
    pub async fn wait(&self) -> Result<u64> {
        let handle = {
            let mut slot = self.task();
            if let Some(outcome) = &slot.outcome {
                return outcome.clone().map_err(WebDavError::TaskFailed);
            }
            slot.handle.take()
        };
        let Some(handle) = handle else {
            return Err(WebDavError::TaskFailed(
                "no transfer task attached, or it is already being awaited".to_string(),
            ));
        };

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };
        self.task().outcome = Some(match &result {
            Ok(bytes) => Ok(*bytes),
            Err(e) => Err(e.to_string()),
        });
        result
    }

    /// Aborts the background transfer, if any, and marks it failed.
    ///
    /// Works while another caller is inside [`wait`](Self::wait).
    pub fn cancel(&self) {
        if let Some(abort) = self.task().abort.as_ref() {
            abort.abort();
        }
        self.finish(false);
        // Unblock a paused transfer so the abort is observed promptly
        self.gate.open();
        info!("Transfer cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_rate_is_zero_after_construction() {
        let progress = TransferProgress::new(Some(100));
        assert_eq!(progress.rate(), 0.0);
        assert_eq!(progress.status(), TransferStatus::New);
        assert_eq!(progress.bytes_transferred(), 0);
        assert!(progress.eta().is_none());
    }

    #[test]
    fn test_add_bytes_activates_and_accumulates() {
        let progress = TransferProgress::new(None);
        progress.add_bytes(10);
        progress.add_bytes(5);
        assert_eq!(progress.status(), TransferStatus::Active);
        assert_eq!(progress.bytes_transferred(), 15);
    }

    #[test]
    fn test_rate_uses_window_endpoints() {
        let progress = TransferProgress::new(None);
        std::thread::sleep(Duration::from_millis(20));
        progress.add_bytes(1000);
        std::thread::sleep(Duration::from_millis(20));
        progress.add_bytes(1000);

        let rate = progress.rate();
        assert!(rate > 0.0);
        // 2000 bytes in at least 40ms
        assert!(rate <= 2000.0 / 0.040);
    }

    #[test]
    fn test_window_is_bounded() {
        let progress = TransferProgress::new(None);
        for _ in 0..100 {
            progress.add_bytes(1);
        }
        let state = progress.state();
        assert_eq!(state.window.len(), RATE_WINDOW);
        // Oldest samples were evicted first
        assert_eq!(state.window.front().map(|s| s.0), Some(81));
        assert_eq!(state.window.back().map(|s| s.0), Some(100));
    }

    #[test]
    fn test_pause_resume_cycle() {
        let progress = TransferProgress::new(None);
        progress.add_bytes(1);
        progress.pause();
        assert!(progress.is_paused());
        assert_eq!(progress.status(), TransferStatus::Paused);

        progress.resume();
        assert!(!progress.is_paused());
        // Status only flips back on the next chunk
        assert_eq!(progress.status(), TransferStatus::Paused);
        progress.add_bytes(1);
        assert_eq!(progress.status(), TransferStatus::Active);
    }

    #[test]
    fn test_finish_is_terminal_once() {
        let progress = TransferProgress::new(None);
        progress.finish(true);
        progress.finish(false);
        progress.pause();
        progress.add_bytes(3);
        assert_eq!(progress.status(), TransferStatus::Done);
        assert!(!progress.is_paused());
    }

    #[test]
    fn test_eta_from_rate_and_remaining() {
        let progress = TransferProgress::new(Some(10_000));
        std::thread::sleep(Duration::from_millis(20));
        progress.add_bytes(1_000);
        let eta = progress.eta().expect("eta should be known");
        assert!(eta > Duration::ZERO);
    }

    #[test]
    fn test_gate_blocks_until_opened() {
        let gate = PauseGate::new();
        gate.close();

        let mut waiter = task::spawn(gate.wait_open());
        assert_pending!(waiter.poll());

        gate.open();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
    }

    #[test]
    fn test_open_gate_does_not_block() {
        let gate = PauseGate::new();
        let mut waiter = task::spawn(gate.wait_open());
        assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_single_writer() {
        let progress = Arc::new(TransferProgress::new(Some(1000)));
        let writer = {
            let progress = Arc::clone(&progress);
            tokio::spawn(async move {
                for _ in 0..1000 {
                    progress.add_bytes(1);
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut last = 0;
        while !writer.is_finished() {
            let seen = progress.bytes_transferred();
            assert!(seen >= last && seen <= 1000);
            last = seen;
            let _ = progress.rate();
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert_eq!(progress.bytes_transferred(), 1000);
    }

    #[tokio::test]
    async fn test_wait_without_task_is_an_error() {
        let progress = TransferProgress::new(None);
        assert!(matches!(progress.wait().await, Err(WebDavError::TaskFailed(_))));
    }

    #[tokio::test]
    async fn test_wait_twice_returns_same_outcome() {
        let progress = TransferProgress::new(None);
        progress.attach_task(tokio::spawn(async { Ok(42) }));

        assert_eq!(progress.wait().await.unwrap(), 42);
        assert_eq!(progress.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_wait_twice_after_failure_keeps_message() {
        let progress = TransferProgress::new(None);
        progress.attach_task(tokio::spawn(async {
            Err(WebDavError::ShortTransfer {
                expected: 10,
                actual: 4,
            })
        }));

        assert!(matches!(
            progress.wait().await,
            Err(WebDavError::ShortTransfer { expected: 10, actual: 4 })
        ));
        match progress.wait().await {
            Err(WebDavError::TaskFailed(message)) => assert!(message.contains("short transfer")),
            other => panic!("unexpected second outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_reaches_task_while_another_caller_waits() {
        let progress = Arc::new(TransferProgress::new(None));
        progress.attach_task(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(0)
        }));

        let waiter = {
            let progress = Arc::clone(&progress);
            tokio::spawn(async move { progress.wait().await })
        };
        tokio::task::yield_now().await;

        progress.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("cancel should end the wait")
            .unwrap();

        assert!(matches!(result, Err(WebDavError::TaskFailed(_))));
        assert_eq!(progress.status(), TransferStatus::Error);
    }

    #[tokio::test]
    async fn test_cancel_aborts_backing_task() {
        let progress = TransferProgress::new(None);
        progress.attach_task(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(0)
        }));
        progress.cancel();

        assert_eq!(progress.status(), TransferStatus::Error);
        assert!(matches!(progress.wait().await, Err(WebDavError::TaskFailed(_))));
    }
}
