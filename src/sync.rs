use core::{future::poll_fn, task::Poll};

use atomic_waker::AtomicWaker;
use portable_atomic::{AtomicBool, AtomicU8, Ordering};

/// How a blocking command was completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    /// The chip responded with the matching sequence number.
    Acknowledged,
    /// Commands are being ignored, because the controller is shutting down.
    Cancelled,
}

/// Signals the completion of the blocking command in flight.
pub struct CommandCompletion {
    state: AtomicU8,
    waker: AtomicWaker,
}
impl CommandCompletion {
    const PENDING: u8 = 0;
    const ACKNOWLEDGED: u8 = 1;
    const CANCELLED: u8 = 2;
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::PENDING),
            waker: AtomicWaker::new(),
        }
    }
    pub fn reset(&self) {
        self.state.store(Self::PENDING, Ordering::Release);
    }
    pub fn signal(&self, status: CommandStatus) {
        self.state.store(
            match status {
                CommandStatus::Acknowledged => Self::ACKNOWLEDGED,
                CommandStatus::Cancelled => Self::CANCELLED,
            },
            Ordering::Release,
        );
        self.waker.wake();
    }
    fn take(&self) -> Option<CommandStatus> {
        match self.state.swap(Self::PENDING, Ordering::AcqRel) {
            Self::ACKNOWLEDGED => Some(CommandStatus::Acknowledged),
            Self::CANCELLED => Some(CommandStatus::Cancelled),
            _ => None,
        }
    }
    /// Wait for the command to be completed.
    pub async fn wait(&self) -> CommandStatus {
        poll_fn(|cx| {
            if let Some(status) = self.take() {
                return Poll::Ready(status);
            }
            self.waker.register(cx.waker());
            // The signal may have arrived in between.
            match self.take() {
                Some(status) => Poll::Ready(status),
                None => Poll::Pending,
            }
        })
        .await
    }
}
impl Default for CommandCompletion {
    fn default() -> Self {
        Self::new()
    }
}

/// Wakes the scheduler.
///
/// Multiple triggers, that arrive before the scheduler runs, are coalesced into one wakeup.
pub struct Trigger {
    waker: AtomicWaker,
    pending: AtomicBool,
}
impl Trigger {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            pending: AtomicBool::new(false),
        }
    }
    pub fn put(&self) {
        self.pending.store(true, Ordering::Release);
        self.waker.wake();
    }
    /// Asynchronously wait for the next trigger.
    pub async fn next(&self) {
        poll_fn(|cx| {
            if self.pending.swap(false, Ordering::AcqRel) {
                return Poll::Ready(());
            }
            self.waker.register(cx.waker());
            if self.pending.swap(false, Ordering::AcqRel) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}
impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}
