//! The command channel.
//!
//! Commands share the transport with data frames, but bypass the queues. Only one command can
//! be in flight at a time, which is enforced by holding the command lock for the entire
//! lifecycle of the command, including the wait for the response.
//!
//! Every command is prefixed by a [CommandHeader]. Blocking commands carry a sequence number,
//! which the chip echoes back in its response. The receive path hands that sequence number to
//! [CommandChannel::complete], which wakes the waiting caller.
use alloc::vec::Vec;

use bitfield_struct::bitfield;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::with_timeout;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{
    aggregation::AggregationBuffer,
    config::CommandConfig,
    interface::Transport,
    sync::{CommandCompletion, CommandStatus},
    DefaultRawMutex, HciError, HciResult,
};

#[bitfield(u64)]
/// The header in front of every command.
pub struct CommandHeader {
    /// Length of header and payload.
    pub length: u16,
    /// The chip has to respond to this command.
    pub response_wanted: bool,
    #[bits(15)]
    pub __: u16,
    /// The sequence number, or zero for commands without a response.
    pub sequence: u32,
}
impl CommandHeader {
    pub const LEN: usize = 8;

    /// Parse the header from the start of a buffer.
    pub fn parse(buffer: &[u8]) -> Option<Self> {
        let bytes: [u8; Self::LEN] = buffer.get(..Self::LEN)?.try_into().ok()?;
        Some(Self::from_bits(u64::from_le_bytes(bytes)))
    }
}

/// State only accessed while holding the command lock.
struct CommandState {
    /// Low byte of the next sequence number.
    counter: u8,
    message: Vec<u8>,
    aggregate: AggregationBuffer,
}
impl CommandState {
    fn next_sequence(&mut self, salt: u32) -> u32 {
        let counter = self.counter;
        self.counter = match self.counter.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        ((salt & 0x00ff_ffff) << 8) | counter as u32
    }
    /// Assemble the command and return the bytes to be sent.
    fn assemble(
        &mut self,
        payload: &[u8],
        sequence: u32,
        response_wanted: bool,
        aggregate: bool,
    ) -> HciResult<&[u8]> {
        let length = CommandHeader::LEN + payload.len();
        if length > u16::MAX as usize {
            return Err(HciError::PayloadTooLarge);
        }
        let header = CommandHeader::new()
            .with_length(length as u16)
            .with_response_wanted(response_wanted)
            .with_sequence(sequence);
        self.message.clear();
        self.message
            .extend_from_slice(&header.into_bits().to_le_bytes());
        self.message.extend_from_slice(payload);

        self.aggregate.reset();
        if aggregate && self.aggregate.push(&self.message) {
            Ok(self.aggregate.finish())
        } else {
            Ok(&self.message)
        }
    }
}

/// Where and how a command is sent.
pub struct CommandRoute<'a, T> {
    /// The transport shared with the scheduler.
    pub transport: &'a Mutex<DefaultRawMutex, T>,
    pub priority_tag: u8,
    /// Wrap the command in aggregation framing.
    pub aggregate: bool,
}
impl<T> Clone for CommandRoute<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for CommandRoute<'_, T> {}

/// The serialized request/response channel to the chip.
pub struct CommandChannel {
    config: CommandConfig,
    lock: Mutex<DefaultRawMutex, CommandState>,
    /// The sequence number of the blocking command in flight, or zero.
    in_flight: AtomicU32,
    completion: CommandCompletion,
    ignore: AtomicBool,
    salt: AtomicU32,
    completed: AtomicU32,
    timed_out: AtomicU32,
}
impl CommandChannel {
    pub fn new(config: CommandConfig) -> Self {
        Self {
            lock: Mutex::new(CommandState {
                counter: 1,
                message: Vec::with_capacity(config.buffer_capacity),
                aggregate: AggregationBuffer::new(config.buffer_capacity),
            }),
            config,
            in_flight: AtomicU32::new(0),
            completion: CommandCompletion::new(),
            ignore: AtomicBool::new(false),
            salt: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            timed_out: AtomicU32::new(0),
        }
    }
    /// Send a command, waiting for the channel to become free first.
    ///
    /// The transport is only locked while the assembled command is handed to it, not while
    /// waiting for the response. If `blocking` is set, this waits until the chip acknowledged the
    /// command or the timeout elapsed, in which case [HciError::Timeout] is returned.
    pub async fn send<T: Transport>(
        &self,
        payload: &[u8],
        blocking: bool,
        route: CommandRoute<'_, T>,
    ) -> HciResult<()> {
        if self.is_ignoring() {
            return Err(HciError::NotRunning);
        }
        let state = self.lock.lock().await;
        self.transact(state, payload, blocking, route).await
    }
    /// Send a command, if no other command is in progress.
    ///
    /// Returns [HciError::Busy] if the channel is held by someone else.
    pub async fn try_send<T: Transport>(
        &self,
        payload: &[u8],
        blocking: bool,
        route: CommandRoute<'_, T>,
    ) -> HciResult<()> {
        if self.is_ignoring() {
            return Err(HciError::NotRunning);
        }
        let state = self.lock.try_lock().map_err(|_| HciError::Busy)?;
        self.transact(state, payload, blocking, route).await
    }
    async fn transact<T: Transport>(
        &self,
        mut state: MutexGuard<'_, DefaultRawMutex, CommandState>,
        payload: &[u8],
        blocking: bool,
        route: CommandRoute<'_, T>,
    ) -> HciResult<()> {
        let sequence = if blocking {
            let salt = self.salt.fetch_add(1, Ordering::Relaxed);
            let sequence = state.next_sequence(salt);
            self.completion.reset();
            self.in_flight.store(sequence, Ordering::SeqCst);
            // Teardown may have started, while we were waiting for the lock.
            if self.is_ignoring() {
                self.in_flight.store(0, Ordering::SeqCst);
                return Err(HciError::NotRunning);
            }
            sequence
        } else {
            0
        };
        let sent = match state.assemble(payload, sequence, blocking, route.aggregate) {
            Ok(bytes) => route
                .transport
                .lock()
                .await
                .send(bytes, route.priority_tag),
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            self.in_flight.store(0, Ordering::SeqCst);
            return Err(err);
        }
        if !blocking {
            return Ok(());
        }
        trace!("Waiting for response to command {:x}.", sequence);
        match with_timeout(self.config.timeout, self.completion.wait()).await {
            Ok(CommandStatus::Acknowledged) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(CommandStatus::Cancelled) => {
                debug!("Command {:x} cancelled by teardown.", sequence);
                Err(HciError::NotRunning)
            }
            Err(_) => {
                self.in_flight.store(0, Ordering::SeqCst);
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Command {:x} timed out after {} ms.",
                    sequence,
                    self.config.timeout.as_millis()
                );
                Err(HciError::Timeout)
            }
        }
    }
    /// Called by the receive path, when a command response arrived.
    ///
    /// Returns true, if the sequence number matched the command in flight.
    pub fn complete(&self, sequence: u32) -> bool {
        if sequence == 0
            || self
                .in_flight
                .compare_exchange(sequence, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            debug!("Ignoring response with unexpected sequence number {:x}.", sequence);
            return false;
        }
        self.completion.signal(CommandStatus::Acknowledged);
        true
    }
    /// Stop accepting commands and wake any caller waiting for a response.
    pub fn ignore_commands(&self) {
        self.ignore.store(true, Ordering::SeqCst);
        if self.in_flight.swap(0, Ordering::SeqCst) != 0 {
            self.completion.signal(CommandStatus::Cancelled);
        }
    }
    pub fn is_ignoring(&self) -> bool {
        self.ignore.load(Ordering::SeqCst)
    }
    /// The sequence number of the blocking command currently in flight.
    pub fn in_flight_sequence(&self) -> Option<u32> {
        match self.in_flight.load(Ordering::SeqCst) {
            0 => None,
            sequence => Some(sequence),
        }
    }
    /// Blocking commands acknowledged by the chip.
    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Relaxed)
    }
    /// Blocking commands, which weren't acknowledged in time.
    pub fn timed_out(&self) -> u32 {
        self.timed_out.load(Ordering::Relaxed)
    }
}
