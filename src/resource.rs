//! Admission control against the chip's TX buffer and descriptor capacity.
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{
    config::ResourceConfig,
    interface::{ChipRegisters, Transport, TxUsage},
    queue::SoftwareQueue,
    HciError, HciResult,
};

/// Free TX resources on the chip.
///
/// This is recomputed from the hardware counters for every scheduling attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResourceSnapshot {
    /// Free pages of TX buffer memory.
    pub free_pages: i32,
    /// Free TX descriptor IDs.
    pub free_slots: i32,
}
impl ResourceSnapshot {
    /// Compute the snapshot from the usage counters and the amount of pending requests.
    pub fn compute(config: &ResourceConfig, usage: TxUsage, pending_requests: u32) -> Self {
        let free = |capacity: u32, used: u32, reserved: u32, per_pending: u32| {
            let free = capacity as i64
                - used as i64
                - reserved as i64
                - per_pending as i64 * pending_requests as i64;
            free.clamp(i32::MIN as i64, i32::MAX as i64) as i32
        };
        Self {
            free_pages: free(
                config.capacity_pages,
                usage.used_pages,
                config.reserved_pages_for_commands,
                config.pages_per_pending_command,
            ),
            free_slots: free(
                config.capacity_slots,
                usage.used_ids,
                config.reserved_slots_for_commands,
                config.slots_per_pending_command,
            ),
        }
    }
    /// Read the counters from the chip and compute the snapshot.
    pub fn read(
        config: &ResourceConfig,
        registers: &mut impl ChipRegisters,
        transport: &impl Transport,
    ) -> HciResult<Self> {
        let usage = registers.tx_usage_counters()?;
        Ok(Self::compute(
            config,
            usage,
            transport.pending_request_count(),
        ))
    }
    /// Check if there are any pages and slots left.
    pub const fn has_resources(&self) -> bool {
        self.free_pages > 0 && self.free_slots > 0
    }
}

/// The result of an admission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Admission {
    /// This many frames from the head of the queue may be sent.
    ///
    /// Zero means, that the first frame doesn't fit right now.
    Admitted(usize),
    /// The chip has no free pages or slots.
    NoResource,
    /// The controller is stopping.
    NotRunning,
    /// The counters couldn't be read.
    Error(HciError),
}

/// Decides, how many frames may be sent, and backs off if the chip stays full.
pub struct AdmissionController {
    config: ResourceConfig,
    streak: AtomicU32,
    resource_full: AtomicBool,
    trips: AtomicU32,
}
impl AdmissionController {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            config,
            streak: AtomicU32::new(0),
            resource_full: AtomicBool::new(false),
            trips: AtomicU32::new(0),
        }
    }
    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }
    /// The amount of pages a frame of this length occupies on the chip.
    pub fn frame_pages(&self, frame_len: usize) -> usize {
        (frame_len + self.config.per_frame_reservation).div_ceil(self.config.page_size)
    }
    /// Count how many frames, starting from the first, fit into the snapshot.
    pub fn admit_count(
        &self,
        snapshot: ResourceSnapshot,
        frame_lengths: impl IntoIterator<Item = usize>,
    ) -> usize {
        if !snapshot.has_resources() {
            return 0;
        }
        let (free_pages, free_slots) = (snapshot.free_pages as usize, snapshot.free_slots as usize);
        let mut pages = 0;
        let mut admitted = 0;
        for frame_len in frame_lengths {
            pages += self.frame_pages(frame_len);
            if pages > free_pages || admitted + 1 > free_slots {
                break;
            }
            admitted += 1;
        }
        admitted
    }
    /// Decide how many frames of the queue may be sent, without removing them.
    pub fn evaluate<F: AsRef<[u8]>>(
        &self,
        snapshot: ResourceSnapshot,
        queue: &SoftwareQueue<F>,
    ) -> Admission {
        if !snapshot.has_resources() {
            self.record_failure();
            return Admission::NoResource;
        }
        let admitted = queue.inspect(|frames| {
            self.admit_count(snapshot, frames.iter().map(|frame| frame.as_ref().len()))
        });
        if admitted != 0 {
            self.streak.store(0, Ordering::Relaxed);
        }
        Admission::Admitted(admitted)
    }
    /// Count a failed admission.
    ///
    /// Returns true, if this caused the controller to enter the resource full state.
    pub fn record_failure(&self) -> bool {
        let streak = self.streak.fetch_add(1, Ordering::Relaxed) + 1;
        if streak > self.config.resource_full_threshold
            && !self.resource_full.swap(true, Ordering::Relaxed)
        {
            self.trips.fetch_add(1, Ordering::Relaxed);
            debug!("TX resources exhausted after {} attempts, backing off.", streak);
            return true;
        }
        false
    }
    pub fn is_resource_full(&self) -> bool {
        self.resource_full.load(Ordering::Relaxed)
    }
    /// Leave the resource full state.
    ///
    /// Returns true, if the state was set before.
    pub fn clear_resource_full(&self) -> bool {
        let was_full = self.resource_full.swap(false, Ordering::Relaxed);
        if was_full {
            self.streak.store(0, Ordering::Relaxed);
            trace!("Leaving resource full state.");
        }
        was_full
    }
    /// Consecutive failed admissions.
    pub fn streak(&self) -> u32 {
        self.streak.load(Ordering::Relaxed)
    }
    /// How often the resource full state was entered.
    pub fn trips(&self) -> u32 {
        self.trips.load(Ordering::Relaxed)
    }
}
