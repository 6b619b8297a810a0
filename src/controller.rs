use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use embassy_futures::select::{select, Either};
use embassy_sync::{blocking_mutex, mutex::Mutex, signal::Signal};
use embassy_time::{with_timeout, Instant, Timer};
use portable_atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::{
    aggregation::AggregationBuffer,
    command::{CommandChannel, CommandRoute},
    config::{Capabilities, HciConfig, TriggerConfig},
    dispatch::{DispatchMode, Dispatcher},
    firmware::{FirmwareLoader, FirmwareReport},
    interface::{ChipRegisters, FirmwareSource, HciFrame, HciHooks, Transport},
    queue::TxQueues,
    resource::{Admission, AdmissionController, ResourceSnapshot},
    sync::Trigger,
    DefaultRawMutex, HciError, HciResult,
};

/// The state of the scheduling task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SchedulerState {
    /// Waiting for a trigger or the poll timeout.
    Idle,
    /// Sending admitted frames.
    Draining,
    /// The task exited and won't run again.
    Stopped,
}
impl SchedulerState {
    const fn into_bits(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Draining => 1,
            Self::Stopped => 2,
        }
    }
    const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Draining,
            2 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Counters for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HciStats {
    /// Frames currently waiting in all queues.
    pub queued: usize,
    /// Frames sent from all queues.
    pub sent: u64,
    /// Frames released without being sent.
    pub dropped: u32,
    /// Dispatch rounds cut short by the transport.
    pub transport_errors: u32,
    /// How often the scheduler backed off, because the chip stayed full.
    pub resource_full_trips: u32,
    pub commands_completed: u32,
    pub commands_timed_out: u32,
}

/// The host controller interface for one attached chip.
///
/// This is the handle returned by attach, through which all operations are performed.
/// The scheduling task is driven by awaiting [HciController::run], which the integrator has to
/// spawn on its executor.
///
/// The transport and the chip registers sit behind async mutexes, so bus I/O never runs inside a
/// critical section. Hooks are short bookkeeping callbacks and are locked for each call only.
///
/// NOTE: The hooks must not call back into the controller, since they are invoked with the
/// hook lock held.
pub struct HciController<T, C, H, F> {
    config: HciConfig,
    queues: TxQueues<F>,
    admission: AdmissionController,
    commands: CommandChannel,
    transport: Mutex<DefaultRawMutex, T>,
    /// Also serializes updates of the hardware queue mask.
    registers: Mutex<DefaultRawMutex, C>,
    hooks: blocking_mutex::Mutex<DefaultRawMutex, RefCell<H>>,
    hw_queue_mask: AtomicU32,
    trigger_config: blocking_mutex::Mutex<DefaultRawMutex, Cell<TriggerConfig>>,
    /// Taken by the scheduling task, when it starts.
    aggregation_buffer: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Option<AggregationBuffer>>>,
    trigger: Trigger,
    running: AtomicBool,
    stop_requested: AtomicBool,
    scheduler_claimed: AtomicBool,
    scheduler_state: AtomicU8,
    scheduler_exited: Signal<DefaultRawMutex, ()>,
    dropped: AtomicU32,
    transport_errors: AtomicU32,
    firmware: Option<FirmwareReport>,
}
impl<T: Transport, C: ChipRegisters, H: HciHooks<F>, F: HciFrame> HciController<T, C, H, F> {
    /// Attach to a chip, that is already running its firmware.
    ///
    /// Fails if the configuration is invalid or the transport is unavailable.
    pub fn attach(config: HciConfig, mut transport: T, registers: C, hooks: H) -> HciResult<Self> {
        config.validate()?;
        transport.probe().inspect_err(|err| {
            error!("Transport unavailable: {:?}", err);
        })?;
        let aggregation_buffer = config
            .capabilities
            .aggregation()
            .then(|| AggregationBuffer::new(config.aggregation_capacity));
        info!(
            "Attached HCI with {} queues. Aggregation: {}",
            config.queue_count,
            aggregation_buffer.is_some()
        );
        Ok(Self {
            queues: TxQueues::new(config.queue_count),
            admission: AdmissionController::new(config.resources),
            commands: CommandChannel::new(config.command),
            transport: Mutex::new(transport),
            registers: Mutex::new(registers),
            hooks: blocking_mutex::Mutex::new(RefCell::new(hooks)),
            hw_queue_mask: AtomicU32::new(0),
            trigger_config: blocking_mutex::Mutex::new(Cell::new(config.trigger)),
            aggregation_buffer: blocking_mutex::Mutex::new(RefCell::new(aggregation_buffer)),
            trigger: Trigger::new(),
            running: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            scheduler_claimed: AtomicBool::new(false),
            scheduler_state: AtomicU8::new(SchedulerState::Idle.into_bits()),
            scheduler_exited: Signal::new(),
            dropped: AtomicU32::new(0),
            transport_errors: AtomicU32::new(0),
            firmware: None,
            config,
        })
    }
    /// Download the firmware into the chip, then attach to it.
    ///
    /// If the firmware can't be loaded, [HciError::LoadFailed] is returned and no controller is
    /// created.
    pub async fn attach_with_firmware<S: FirmwareSource>(
        config: HciConfig,
        mut transport: T,
        mut registers: C,
        hooks: H,
        source: &mut S,
    ) -> HciResult<Self> {
        config.validate()?;
        transport.probe()?;
        let report = FirmwareLoader::new(&config.firmware, &config.registers)
            .load(&mut registers, source)
            .await?;
        let mut controller = Self::attach(config, transport, registers, hooks)?;
        controller.firmware = Some(report);
        Ok(controller)
    }
    /// Stop the scheduling task and release all queued frames.
    ///
    /// Commands waiting for a response are woken up. If the scheduling task doesn't acknowledge
    /// the stop request within the stop timeout, the queues are flushed anyways and
    /// [HciError::Timeout] is returned.
    pub async fn detach(&self) -> HciResult<()> {
        info!("Detaching HCI.");
        self.commands.ignore_commands();
        self.running.store(false, Ordering::SeqCst);
        self.stop_requested.store(true, Ordering::SeqCst);

        let mut result = Ok(());
        if self.scheduler_claimed.load(Ordering::SeqCst) {
            self.trigger.put();
            if with_timeout(self.config.stop_timeout, self.scheduler_exited.wait())
                .await
                .is_err()
            {
                warn!("Scheduler didn't acknowledge the stop request.");
                result = Err(HciError::Timeout);
            }
        }
        for (queue_id, frames) in self.queues.take_all_queues() {
            self.release_all(queue_id, frames.into_iter());
        }
        // If the scheduler never ran, the buffer is still here.
        self.aggregation_buffer
            .lock(|buffer| buffer.borrow_mut().take());
        result
    }
    /// Check if the controller accepts frames.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
    pub fn config(&self) -> &HciConfig {
        &self.config
    }
    pub fn capabilities(&self) -> Capabilities {
        self.config.capabilities
    }
    /// The result of the firmware download, if attach loaded firmware.
    pub fn firmware_report(&self) -> Option<FirmwareReport> {
        self.firmware
    }

    // Queues

    fn release_dropped(&self, frame: F) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.hooks
            .lock(|hooks| hooks.borrow_mut().on_frame_dropped(frame));
    }
    fn release_all(&self, queue_id: usize, frames: impl ExactSizeIterator<Item = F>) -> usize {
        let count = frames.len();
        if count != 0 {
            debug!("Flushing {} frames from queue {}.", count, queue_id);
        }
        for frame in frames {
            self.release_dropped(frame);
        }
        count
    }
    fn should_trigger(&self, queue_id: usize, frame_len: usize) -> bool {
        let trigger_config = self.trigger_config();
        !trigger_config.enabled
            || queue_id == self.config.control_queue()
            || frame_len >= trigger_config.min_frame_size
            || self.queues.total() >= trigger_config.queue_len_threshold
    }
    /// Hand a frame to the HCI layer for transmission.
    ///
    /// Returns the length of the queue after the frame was added. If the controller isn't
    /// running, the frame is released through [HciHooks::on_frame_dropped] and zero is returned.
    pub fn enqueue(&self, queue_id: usize, frame: F, at_head: bool) -> HciResult<usize> {
        self.queues.get(queue_id)?;
        if !self.is_running() {
            trace!("Dropping frame for queue {}, since we're stopped.", queue_id);
            self.release_dropped(frame);
            return Ok(0);
        }
        let frame_len = frame.as_ref().len();
        let length = self.queues.push(queue_id, frame, at_head)?;
        if self.should_trigger(queue_id, frame_len) {
            self.trigger.put();
        }
        Ok(length)
    }
    /// Release all frames in the queue through [HciHooks::on_frame_dropped].
    ///
    /// Returns the amount of frames released.
    pub fn flush_queue(&self, queue_id: usize) -> HciResult<usize> {
        let frames = self.queues.take_all(queue_id)?;
        Ok(self.release_all(queue_id, frames.into_iter()))
    }
    /// Stop the scheduler from sending frames from this queue.
    pub fn pause_queue(&self, queue_id: usize) -> HciResult<()> {
        self.queues.get(queue_id)?.set_paused(true);
        Ok(())
    }
    /// Allow the scheduler to send frames from this queue again.
    pub fn resume_queue(&self, queue_id: usize) -> HciResult<()> {
        self.queues.get(queue_id)?.set_paused(false);
        self.trigger.put();
        Ok(())
    }
    pub fn is_queue_paused(&self, queue_id: usize) -> HciResult<bool> {
        Ok(self.queues.get(queue_id)?.is_paused())
    }
    pub fn is_queue_empty(&self, queue_id: usize) -> HciResult<bool> {
        Ok(self.queues.get(queue_id)?.is_empty())
    }
    /// The amount of frames in the queue.
    pub fn queue_len(&self, queue_id: usize) -> HciResult<usize> {
        Ok(self.queues.get(queue_id)?.len())
    }
    /// The amount of frames in all queues.
    pub fn queue_length(&self) -> u32 {
        self.queues.total() as u32
    }
    /// The amount of frames sent from the queue.
    pub fn queue_sent_count(&self, queue_id: usize) -> HciResult<u64> {
        Ok(self.queues.get(queue_id)?.sent_count())
    }

    // Hardware queues

    async fn write_hw_queue_mask(&self, update: impl FnOnce(u32) -> u32) -> HciResult<u32> {
        let mut registers = self.registers.lock().await;
        let new_mask = update(self.hw_queue_mask.load(Ordering::Relaxed));
        registers.write(self.config.registers.hw_queue_halt, new_mask)?;
        self.hw_queue_mask.store(new_mask, Ordering::Relaxed);
        Ok(new_mask)
    }
    /// Halt the hardware queues set in the mask.
    pub async fn halt_hw_queues(&self, mask: u32) -> HciResult<()> {
        let new_mask = self.write_hw_queue_mask(|current| current | mask).await?;
        debug!("Halted hardware queues. Mask: {:x}", new_mask);
        Ok(())
    }
    /// Resume the hardware queues set in the mask.
    pub async fn resume_hw_queues(&self, mask: u32) -> HciResult<()> {
        let new_mask = self
            .write_hw_queue_mask(|current| current & !mask)
            .await?;
        debug!("Resumed hardware queues. Mask: {:x}", new_mask);
        self.trigger.put();
        Ok(())
    }
    /// The currently halted hardware queues.
    pub fn hw_queue_mask(&self) -> u32 {
        self.hw_queue_mask.load(Ordering::Relaxed)
    }

    // Trigger

    /// Replace the trigger configuration.
    pub fn set_trigger_config(&self, trigger_config: TriggerConfig) {
        self.trigger_config
            .lock(|current| current.set(trigger_config));
        // Let the scheduler pick up the new poll timeout.
        self.trigger.put();
    }
    pub fn trigger_config(&self) -> TriggerConfig {
        self.trigger_config.lock(|current| current.get())
    }

    // Commands

    fn command_route(&self) -> CommandRoute<'_, T> {
        CommandRoute {
            transport: &self.transport,
            priority_tag: self
                .config
                .command
                .priority_tag
                .unwrap_or(self.config.control_queue() as u8),
            aggregate: self.capabilities().aggregation(),
        }
    }
    /// Send a command to the chip.
    ///
    /// Commands are serialized, so this first waits for any other command to finish. If
    /// `blocking` is set, this waits for the chip to acknowledge the command and returns
    /// [HciError::Timeout] if it doesn't.
    pub async fn send_command(&self, payload: &[u8], blocking: bool) -> HciResult<()> {
        self.commands
            .send(payload, blocking, self.command_route())
            .await
    }
    /// Like [Self::send_command], but returns [HciError::Busy] instead of waiting for another
    /// command to finish.
    pub async fn try_send_command(&self, payload: &[u8], blocking: bool) -> HciResult<()> {
        self.commands
            .try_send(payload, blocking, self.command_route())
            .await
    }
    /// Called by the receive path, when a command response with this sequence number arrived.
    pub fn complete_command(&self, sequence: u32) -> bool {
        self.commands.complete(sequence)
    }
    /// Stop accepting commands and wake any waiting caller.
    pub fn ignore_commands(&self) {
        self.commands.ignore_commands();
    }
    /// The sequence number of the blocking command currently awaiting its response.
    pub fn command_in_flight(&self) -> Option<u32> {
        self.commands.in_flight_sequence()
    }

    // Scheduler

    pub fn scheduler_state(&self) -> SchedulerState {
        SchedulerState::from_bits(self.scheduler_state.load(Ordering::Relaxed))
    }
    fn set_scheduler_state(&self, state: SchedulerState) {
        self.scheduler_state
            .store(state.into_bits(), Ordering::Relaxed);
    }
    /// Check if the scheduler is backing off, because the chip ran out of TX resources.
    pub fn is_resource_full(&self) -> bool {
        self.admission.is_resource_full()
    }
    fn flow_control_update(&self, resource_full: bool) {
        self.hooks
            .lock(|hooks| hooks.borrow_mut().on_flow_control_update(resource_full));
    }
    async fn read_snapshot(&self) -> HciResult<ResourceSnapshot> {
        // Lock order is transport, then registers.
        let transport = self.transport.lock().await;
        let mut registers = self.registers.lock().await;
        ResourceSnapshot::read(self.admission.config(), &mut *registers, &*transport)
    }
    /// Decide how many frames from the queue may be sent right now.
    pub async fn admit(&self, queue_id: usize) -> Admission {
        if !self.is_running() {
            return Admission::NotRunning;
        }
        let Ok(queue) = self.queues.get(queue_id) else {
            return Admission::Error(HciError::InvalidQueue);
        };
        let snapshot = match self.read_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => return Admission::Error(err),
        };
        let was_full = self.admission.is_resource_full();
        let admission = self.admission.evaluate(snapshot, queue);
        if !was_full && self.admission.is_resource_full() {
            self.flow_control_update(true);
        }
        admission
    }
    /// Run one scheduling round and return the amount of frames sent.
    async fn schedule_round(&self, dispatcher: &mut Dispatcher<F>) -> usize {
        let mut round_total = 0;
        for queue_id in self.queues.by_priority() {
            let Ok(queue) = self.queues.get(queue_id) else {
                continue;
            };
            if !queue.is_schedulable() {
                continue;
            }
            if self.admission.is_resource_full() {
                break;
            }
            match self.admit(queue_id).await {
                Admission::Admitted(0) => {
                    trace!("Nothing admitted from queue {}.", queue_id);
                    break;
                }
                Admission::Admitted(admitted) => {
                    let mut transport = self.transport.lock().await;
                    let outcome = dispatcher.dispatch(
                        &self.queues,
                        queue_id,
                        admitted,
                        &mut *transport,
                        &mut LockedHooks(&self.hooks),
                    );
                    drop(transport);
                    round_total += outcome.sent;
                    if outcome.error.is_some() {
                        self.transport_errors.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
                Admission::NoResource | Admission::NotRunning => break,
                Admission::Error(err) => {
                    warn!("Reading TX resources failed: {:?}", err);
                    break;
                }
            }
        }
        round_total
    }
    /// The scheduling task.
    ///
    /// This has to be awaited exactly once, for example by spawning it on the executor. It
    /// returns once [Self::detach] was called. Further calls return immediately.
    pub async fn run(&self) {
        if self.scheduler_claimed.swap(true, Ordering::SeqCst) {
            warn!("The scheduler is already running.");
            return;
        }
        let mode = match self
            .aggregation_buffer
            .lock(|buffer| buffer.borrow_mut().take())
        {
            Some(buffer) => DispatchMode::Aggregated(buffer),
            None => DispatchMode::Direct,
        };
        let mut dispatcher = Dispatcher::new(mode);
        debug!("Scheduler started.");

        // Fixed when the breaker trips, so that triggers can't push it out.
        let mut backoff_deadline = None;
        while !self.stop_requested.load(Ordering::SeqCst) {
            self.set_scheduler_state(SchedulerState::Idle);
            let deadline = if self.admission.is_resource_full() {
                *backoff_deadline.get_or_insert_with(|| {
                    Instant::now() + self.admission.config().resource_full_backoff
                })
            } else {
                backoff_deadline = None;
                Instant::now() + self.trigger_config().poll_timeout
            };
            if let Either::First(()) = select(self.trigger.next(), Timer::at(deadline)).await {
                trace!("Scheduler triggered.");
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            if self.admission.is_resource_full() {
                if Instant::now() < deadline {
                    continue;
                }
                // Optimistically assume, that the chip freed some resources in the meantime.
                backoff_deadline = None;
                if self.admission.clear_resource_full() {
                    self.flow_control_update(false);
                }
            }
            self.set_scheduler_state(SchedulerState::Draining);
            let start_time = Instant::now();
            let sent = self.schedule_round(&mut dispatcher).await;
            if sent != 0 {
                trace!(
                    "Sent {} frames in {} us.",
                    sent,
                    start_time.elapsed().as_micros()
                );
                // There may be more, so we go again right away.
                if self.queues.total() != 0 {
                    self.trigger.put();
                }
            }
        }
        // Dropping the dispatcher releases the aggregation buffer.
        drop(dispatcher);
        self.set_scheduler_state(SchedulerState::Stopped);
        debug!("Scheduler stopped.");
        self.scheduler_exited.signal(());
    }
    /// Counters for diagnostics.
    pub fn stats(&self) -> HciStats {
        HciStats {
            queued: self.queues.total(),
            sent: self
                .queues
                .by_priority()
                .filter_map(|queue_id| self.queues.get(queue_id).ok())
                .map(|queue| queue.sent_count())
                .sum(),
            dropped: self.dropped.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            resource_full_trips: self.admission.trips(),
            commands_completed: self.commands.completed(),
            commands_timed_out: self.commands.timed_out(),
        }
    }
}

/// Hands the hooks to the dispatcher, locking them for each call only.
struct LockedHooks<'a, H>(&'a blocking_mutex::Mutex<DefaultRawMutex, RefCell<H>>);
impl<F, H: HciHooks<F>> HciHooks<F> for LockedHooks<'_, H> {
    fn on_tx_descriptor_attach(&mut self, frame: &mut F, queue_id: usize) {
        self.0
            .lock(|hooks| hooks.borrow_mut().on_tx_descriptor_attach(frame, queue_id));
    }
    fn on_tx_complete_batch(&mut self, frames: &mut Vec<F>) {
        self.0
            .lock(|hooks| hooks.borrow_mut().on_tx_complete_batch(frames));
    }
    fn on_frame_dropped(&mut self, frame: F) {
        self.0.lock(|hooks| hooks.borrow_mut().on_frame_dropped(frame));
    }
    fn on_flow_control_update(&mut self, resource_full: bool) {
        self.0
            .lock(|hooks| hooks.borrow_mut().on_flow_control_update(resource_full));
    }
}
