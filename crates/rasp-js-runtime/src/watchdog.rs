//! Timeout Watchdog
//!
//! A single thread tracks the deadline of every armed dispatch. When a
//! deadline passes, the watchdog raises the isolate's interrupt request; the
//! QuickJS interrupt handler sees it and unwinds the running script. If the
//! script is still running after the grace period, the dispatch is declared
//! faulted and its isolate is discarded on release.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

// ─────────────────────────────────────────────────────────────────────────────
// Interrupt Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Per-isolate interrupt request, polled by the QuickJS interrupt handler.
///
/// Every run of script code gets a fresh epoch, and a request only
/// interrupts the epoch it was made for. A watchdog that fires just as a
/// dispatch completes can never interrupt the isolate's next dispatch.
#[derive(Debug)]
pub(crate) struct InterruptHandle {
    epoch: AtomicU64,
    target: AtomicU64,
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self {
            epoch: AtomicU64::new(1),
            target: AtomicU64::new(0),
        }
    }
}

impl InterruptHandle {
    /// Start a new epoch, clearing any outstanding request.
    pub(crate) fn begin(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn request(&self, epoch: u64) {
        self.target.store(epoch, Ordering::SeqCst);
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.target.load(Ordering::SeqCst) == self.epoch.load(Ordering::SeqCst)
    }

    fn current(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timer
// ─────────────────────────────────────────────────────────────────────────────

const RUNNING: u8 = 0;
const COMPLETED: u8 = 1;
const INTERRUPTED: u8 = 2;
const SETTLED: u8 = 3;
const FAULTED: u8 = 4;

/// How an armed dispatch ended relative to its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerOutcome {
    /// Finished before the deadline.
    Completed,
    /// The deadline passed and the script was interrupted.
    Interrupted,
    /// The script kept running past the grace period.
    Faulted,
}

/// Shared between the dispatching thread and the watchdog; the phase moves
/// by compare-and-swap so exactly one side decides the outcome.
struct DispatchTimer {
    phase: AtomicU8,
    handle: Arc<InterruptHandle>,
    epoch: u64,
}

impl DispatchTimer {
    fn interrupt(&self) -> bool {
        let won = self
            .phase
            .compare_exchange(RUNNING, INTERRUPTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.handle.request(self.epoch);
        }
        won
    }

    fn fault(&self) -> bool {
        self.phase
            .compare_exchange(INTERRUPTED, FAULTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn finish(&self) -> TimerOutcome {
        match self
            .phase
            .compare_exchange(RUNNING, COMPLETED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => TimerOutcome::Completed,
            Err(INTERRUPTED) => match self.phase.compare_exchange(
                INTERRUPTED,
                SETTLED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => TimerOutcome::Interrupted,
                Err(_) => TimerOutcome::Faulted,
            },
            Err(FAULTED) => TimerOutcome::Faulted,
            Err(_) => TimerOutcome::Completed,
        }
    }
}

/// A deadline armed for one run of script code.
///
/// Dropping it without calling [`ArmedTimer::finish`] cancels the deadline.
pub(crate) struct ArmedTimer {
    timer: Arc<DispatchTimer>,
    cancel: oneshot::Sender<()>,
}

impl ArmedTimer {
    pub(crate) fn finish(self) -> TimerOutcome {
        let outcome = self.timer.finish();
        drop(self.cancel);
        outcome
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Watchdog
// ─────────────────────────────────────────────────────────────────────────────

enum WatchCommand {
    Arm {
        timer: Arc<DispatchTimer>,
        deadline: Instant,
        cancel: oneshot::Receiver<()>,
    },
    Shutdown,
}

/// Handle to the watchdog thread.
pub(crate) struct Watchdog {
    commands: mpsc::UnboundedSender<WatchCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    /// Start the watchdog thread.
    pub(crate) fn spawn(grace: Duration) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (commands, command_rx) = mpsc::unbounded_channel();

        let thread = thread::Builder::new()
            .name("rasp-watchdog".to_string())
            .spawn(move || {
                runtime.block_on(run_watchdog(command_rx, grace));
            })?;

        Ok(Self {
            commands,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Arm a deadline `timeout` from now for the handle's current epoch.
    pub(crate) fn arm(&self, timeout: Duration, handle: &Arc<InterruptHandle>) -> ArmedTimer {
        let timer = Arc::new(DispatchTimer {
            phase: AtomicU8::new(RUNNING),
            handle: handle.clone(),
            epoch: handle.current(),
        });
        let (cancel, cancel_rx) = oneshot::channel();

        let command = WatchCommand::Arm {
            timer: timer.clone(),
            deadline: Instant::now() + timeout,
            cancel: cancel_rx,
        };
        if self.commands.send(command).is_err() {
            tracing::error!("Watchdog is not running, dispatch is unbounded");
        }

        ArmedTimer { timer, cancel }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let _ = self.commands.send(WatchCommand::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

async fn run_watchdog(mut command_rx: mpsc::UnboundedReceiver<WatchCommand>, grace: Duration) {
    tracing::debug!("Watchdog started");

    while let Some(command) = command_rx.recv().await {
        match command {
            WatchCommand::Arm {
                timer,
                deadline,
                cancel,
            } => {
                tokio::spawn(watch(timer, deadline, cancel, grace));
            }
            WatchCommand::Shutdown => break,
        }
    }

    tracing::debug!("Watchdog stopped");
}

async fn watch(
    timer: Arc<DispatchTimer>,
    deadline: Instant,
    mut cancel: oneshot::Receiver<()>,
    grace: Duration,
) {
    tokio::select! {
        _ = &mut cancel => return,
        _ = tokio::time::sleep_until(deadline.into()) => {}
    }

    if !timer.interrupt() {
        return;
    }
    tracing::debug!("Deadline passed, interrupting isolate");

    tokio::select! {
        _ = &mut cancel => {}
        _ = tokio::time::sleep(grace) => {
            if timer.fault() {
                tracing::error!("Interrupted script did not unwind within {:?}", grace);
            }
        }
    }
}
