use embassy_time::Duration;
use macro_bits::{bit, check_bit};

use crate::{aggregation::AggregationBuffer, HciError, HciResult};

/// The maximum amount of software queues.
///
/// This is limited by the width of the hardware queue mask.
pub const MAX_QUEUE_COUNT: usize = 32;

/// Features supported by the attached chip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capabilities(u32);
impl Capabilities {
    /// The chip accepts multiple frames packed into one transport transaction.
    pub const AGGREGATION: Self = Self(bit!(0));

    pub const fn empty() -> Self {
        Self(0)
    }
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
    pub const fn bits(&self) -> u32 {
        self.0
    }
    pub const fn contains(&self, other: Self) -> bool {
        check_bit!(self.0, other.0)
    }
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
    /// Check if aggregation is enabled.
    pub const fn aggregation(&self) -> bool {
        self.contains(Self::AGGREGATION)
    }
}

/// Controls, when an enqueue wakes the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerConfig {
    /// If this is false, every enqueue wakes the scheduler.
    ///
    /// Otherwise only enqueues matching one of the thresholds below do, and everything else is
    /// picked up once [Self::poll_timeout] elapses.
    pub enabled: bool,
    /// Total amount of queued frames, at which the scheduler gets woken.
    pub queue_len_threshold: usize,
    /// Frames at least this long wake the scheduler immediately.
    pub min_frame_size: usize,
    /// How long the scheduler sleeps, if it isn't triggered.
    pub poll_timeout: Duration,
}
impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_len_threshold: 8,
            min_frame_size: 1024,
            poll_timeout: Duration::from_millis(10),
        }
    }
}

/// Parameters of the chip's TX buffer accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceConfig {
    /// Size of one TX buffer page on the chip.
    pub page_size: usize,
    /// Bytes the chip reserves in front of every frame, for its descriptor.
    pub per_frame_reservation: usize,
    /// Total pages of TX buffer memory.
    pub capacity_pages: u32,
    /// Total TX descriptor IDs.
    pub capacity_slots: u32,
    pub reserved_pages_for_commands: u32,
    pub reserved_slots_for_commands: u32,
    /// Pages kept free for every request, the transport still has pending.
    pub pages_per_pending_command: u32,
    /// Slots kept free for every request, the transport still has pending.
    pub slots_per_pending_command: u32,
    /// Consecutive failed admissions, after which the scheduler backs off.
    pub resource_full_threshold: u32,
    /// How long the scheduler stops polling the hardware, once it backed off.
    pub resource_full_backoff: Duration,
}
impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            page_size: 256,
            per_frame_reservation: 64,
            capacity_pages: 160,
            capacity_slots: 64,
            reserved_pages_for_commands: 8,
            reserved_slots_for_commands: 2,
            pages_per_pending_command: 4,
            slots_per_pending_command: 1,
            resource_full_threshold: 100,
            resource_full_backoff: Duration::from_millis(50),
        }
    }
}

/// Parameters for the command channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandConfig {
    /// How long a blocking command waits for the acknowledgement.
    pub timeout: Duration,
    /// The priority tag passed to the transport for commands.
    ///
    /// If this is `None`, the tag of the highest queue is used.
    pub priority_tag: Option<u8>,
    /// Capacity of the buffer, in which commands get assembled.
    pub buffer_capacity: usize,
}
impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            priority_tag: None,
            buffer_capacity: 1536,
        }
    }
}

/// Addresses of the registers used by the HCI layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterMap {
    /// Bit mask of halted hardware queues.
    pub hw_queue_halt: u32,
    /// Holds the chip's CPU in reset, while non-zero.
    pub cpu_reset: u32,
    /// Amount of firmware blocks downloaded.
    pub fw_block_count: u32,
    /// Checksum computed by the chip over the downloaded blocks.
    pub fw_checksum: u32,
    /// The host writes the complement of the checksum here, to acknowledge it.
    pub fw_checksum_ack: u32,
}
impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            hw_queue_halt: 0x0000_4100,
            cpu_reset: 0x0000_4000,
            fw_block_count: 0x0000_4004,
            fw_checksum: 0x0000_4008,
            fw_checksum_ack: 0x0000_400c,
        }
    }
}

/// Parameters for firmware download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FirmwareConfig {
    /// Name of the image, passed to [FirmwareSource::open](crate::FirmwareSource::open).
    pub name: &'static str,
    /// Size of one download block in bytes.
    pub block_size: usize,
    /// Used to pad the last block, if the image isn't block aligned.
    pub fill_byte: u8,
    /// Chip address of the first block.
    pub download_base: u32,
    /// Offset into the image, at which blocks are written to [Self::remap_base] instead.
    pub remap_threshold: u32,
    pub remap_base: u32,
    /// How long to wait after releasing the CPU from reset, before reading the checksum.
    pub settle_time: Duration,
    /// How often the download is attempted in total.
    pub attempts: u8,
}
impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            name: "fmacfw.bin",
            block_size: 512,
            fill_byte: 0xff,
            download_base: 0x0010_0000,
            remap_threshold: 0x0004_0000,
            remap_base: 0x0020_0000,
            settle_time: Duration::from_millis(20),
            attempts: 3,
        }
    }
}
impl FirmwareConfig {
    /// Returns the chip address for the block starting at `offset` in the image.
    pub const fn block_address(&self, offset: u32) -> u32 {
        if offset >= self.remap_threshold {
            self.remap_base + (offset - self.remap_threshold)
        } else {
            self.download_base + offset
        }
    }
}

/// Configuration of the HCI layer, passed to attach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HciConfig {
    /// The amount of software queues. The highest one is used for control traffic.
    pub queue_count: usize,
    pub capabilities: Capabilities,
    pub trigger: TriggerConfig,
    pub resources: ResourceConfig,
    /// Capacity of the aggregation buffer in bytes.
    pub aggregation_capacity: usize,
    pub command: CommandConfig,
    pub registers: RegisterMap,
    pub firmware: FirmwareConfig,
    /// How long detach waits for the scheduler to acknowledge the stop request.
    pub stop_timeout: Duration,
}
impl Default for HciConfig {
    fn default() -> Self {
        Self {
            queue_count: 5,
            capabilities: Capabilities::empty(),
            trigger: TriggerConfig::default(),
            resources: ResourceConfig::default(),
            aggregation_capacity: 2048,
            command: CommandConfig::default(),
            registers: RegisterMap::default(),
            firmware: FirmwareConfig::default(),
            stop_timeout: Duration::from_secs(1),
        }
    }
}
impl HciConfig {
    /// Check the configuration for consistency.
    pub fn validate(&self) -> HciResult<()> {
        let min_buffer = AggregationBuffer::HEADER_LEN + AggregationBuffer::TRAILER_LEN;
        let valid = (1..=MAX_QUEUE_COUNT).contains(&self.queue_count)
            && self.resources.page_size != 0
            && self.aggregation_capacity > min_buffer
            && self.command.buffer_capacity > min_buffer
            && self.firmware.block_size != 0
            && self.firmware.block_size % 4 == 0
            && self.firmware.attempts != 0;
        if valid {
            Ok(())
        } else {
            Err(HciError::InvalidConfig)
        }
    }
    /// The ID of the queue reserved for control and management traffic.
    pub const fn control_queue(&self) -> usize {
        self.queue_count - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(HciConfig::default().validate(), Ok(()));
    }
    #[test]
    fn rejects_bad_config() {
        let config = HciConfig {
            queue_count: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(HciError::InvalidConfig));

        let mut config = HciConfig::default();
        config.firmware.block_size = 510;
        assert_eq!(config.validate(), Err(HciError::InvalidConfig));

        let config = HciConfig {
            aggregation_capacity: 12,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(HciError::InvalidConfig));
    }
    #[test]
    fn firmware_addresses_are_remapped() {
        let config = FirmwareConfig {
            download_base: 0x1000,
            remap_threshold: 0x800,
            remap_base: 0x9000,
            ..Default::default()
        };
        assert_eq!(config.block_address(0), 0x1000);
        assert_eq!(config.block_address(0x600), 0x1600);
        assert_eq!(config.block_address(0x800), 0x9000);
        assert_eq!(config.block_address(0xa00), 0x9200);
    }
    #[test]
    fn capabilities() {
        assert!(!Capabilities::empty().aggregation());
        let caps = Capabilities::empty().with(Capabilities::AGGREGATION);
        assert!(caps.aggregation());
        assert_eq!(Capabilities::from_bits(caps.bits()), caps);
    }
}
