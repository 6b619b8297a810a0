//! Firmware download.
//!
//! ## Sequence
//! 1. The chip's CPU is put into reset, so the download always starts from the boot ROM.
//! 2. The image is written to chip memory block by block. The last block is padded with the fill
//!    byte. Blocks past the remap threshold are written to the second memory window.
//! 3. The number of blocks is written to the chip, so it can compute the checksum over the same
//!    data, and the CPU is released from reset.
//! 4. After the settle time, the checksum computed by the chip is compared to ours. If they
//!    match, the complement of the checksum is written back as acknowledgement.
//!
//! If anything goes wrong, the whole sequence is repeated until the configured number of
//! attempts is used up.
use alloc::{vec, vec::Vec};

use embassy_time::{Instant, Timer};

use crate::{
    config::{FirmwareConfig, RegisterMap},
    interface::{ChipRegisters, FirmwareSource},
    HciError, HciResult,
};

/// Written to the reset register, to hold the CPU in reset.
const CPU_RESET_ASSERT: u32 = 1;
/// Written to the reset register, to let the CPU run.
const CPU_RESET_RELEASE: u32 = 0;

/// A firmware image, which is embedded into the host binary.
pub struct EmbeddedImage<'a> {
    image: &'a [u8],
}
impl<'a> EmbeddedImage<'a> {
    pub const fn new(image: &'a [u8]) -> Self {
        Self { image }
    }
}
impl FirmwareSource for EmbeddedImage<'_> {
    /// The read offset into the image.
    type Handle = usize;

    fn open(&mut self, _name: &str) -> HciResult<Self::Handle> {
        if self.image.is_empty() {
            Err(HciError::ImageUnavailable)
        } else {
            Ok(0)
        }
    }
    fn read_block(&mut self, handle: &mut Self::Handle, buffer: &mut [u8]) -> HciResult<usize> {
        let rest = self.image.get(*handle..).unwrap_or_default();
        let len = rest.len().min(buffer.len());
        buffer[..len].copy_from_slice(&rest[..len]);
        *handle += len;
        Ok(len)
    }
    fn close(&mut self, _handle: Self::Handle) {}
}

/// The running checksum over the downloaded blocks.
///
/// The chip computes the same sum over the blocks it received.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FirmwareChecksum {
    sum: u32,
}
impl FirmwareChecksum {
    pub const fn new() -> Self {
        Self { sum: 0 }
    }
    /// Add the little-endian 32-bit words of the block to the sum.
    pub fn add_block(&mut self, block: &[u8]) {
        for word in block.chunks(4) {
            let mut bytes = [0u8; 4];
            bytes[..word.len()].copy_from_slice(word);
            self.add_word(u32::from_le_bytes(bytes));
        }
    }
    pub fn add_word(&mut self, word: u32) {
        self.sum = self.sum.wrapping_add(word);
    }
    /// The raw 32-bit sum.
    pub const fn sum(&self) -> u32 {
        self.sum
    }
    /// Fold the sum to eight bits, with end-around carry, and shift it into the second byte.
    pub const fn finalize(&self) -> u32 {
        let [a, b, c, d] = self.sum.to_le_bytes();
        let mut folded = a as u32 + b as u32 + c as u32 + d as u32;
        while folded > 0xff {
            folded = (folded & 0xff) + (folded >> 8);
        }
        folded << 8
    }
}

/// Summary of a successful download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FirmwareReport {
    /// Number of blocks written.
    pub blocks: u32,
    /// The checksum both sides agreed upon.
    pub checksum: u32,
    /// The attempt, that succeeded.
    pub attempts: u8,
}

/// The states of a download attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoaderState {
    Reset,
    DownloadBlocks,
    VerifyChecksum,
    Success,
    RetryOrFail,
}

/// Downloads firmware into the chip and verifies it.
pub struct FirmwareLoader<'a> {
    config: &'a FirmwareConfig,
    registers: &'a RegisterMap,
    state: LoaderState,
}
impl<'a> FirmwareLoader<'a> {
    pub fn new(config: &'a FirmwareConfig, registers: &'a RegisterMap) -> Self {
        Self {
            config,
            registers,
            state: LoaderState::Reset,
        }
    }
    /// The state the loader is currently in, or ended in.
    pub fn state(&self) -> LoaderState {
        self.state
    }
    fn enter(&mut self, state: LoaderState) {
        trace!("Firmware loader: {:?} -> {:?}", self.state, state);
        self.state = state;
    }
    /// Download the image and verify the checksum.
    ///
    /// Returns [HciError::LoadFailed] once all attempts failed.
    pub async fn load<C: ChipRegisters, S: FirmwareSource>(
        &mut self,
        chip: &mut C,
        source: &mut S,
    ) -> HciResult<FirmwareReport> {
        let start_time = Instant::now();
        for attempt in 1..=self.config.attempts {
            match self.attempt(chip, source).await {
                Ok((blocks, checksum)) => {
                    self.enter(LoaderState::Success);
                    info!(
                        "Firmware {} loaded. {} blocks, checksum {:x}, attempt {}. Took {} ms",
                        self.config.name,
                        blocks,
                        checksum,
                        attempt,
                        start_time.elapsed().as_millis()
                    );
                    return Ok(FirmwareReport {
                        blocks,
                        checksum,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    self.enter(LoaderState::RetryOrFail);
                    warn!(
                        "Firmware download attempt {} of {} failed: {:?}",
                        attempt, self.config.attempts, err
                    );
                }
            }
        }
        error!("Giving up on loading firmware {}.", self.config.name);
        Err(HciError::LoadFailed)
    }
    async fn attempt<C: ChipRegisters, S: FirmwareSource>(
        &mut self,
        chip: &mut C,
        source: &mut S,
    ) -> HciResult<(u32, u32)> {
        self.enter(LoaderState::Reset);
        chip.write(self.registers.cpu_reset, CPU_RESET_ASSERT)?;

        self.enter(LoaderState::DownloadBlocks);
        let mut handle = source.open(self.config.name)?;
        let downloaded = self.download(chip, source, &mut handle);
        source.close(handle);
        let (blocks, checksum) = downloaded?;
        let checksum = checksum.finalize();
        chip.write(self.registers.fw_block_count, blocks)?;
        chip.write(self.registers.cpu_reset, CPU_RESET_RELEASE)?;
        Timer::after(self.config.settle_time).await;

        self.enter(LoaderState::VerifyChecksum);
        let reported = chip.read(self.registers.fw_checksum)?;
        if reported != checksum {
            debug!(
                "Checksum mismatch. Host: {:x} Chip: {:x}",
                checksum, reported
            );
            return Err(HciError::ChecksumMismatch);
        }
        chip.write(self.registers.fw_checksum_ack, !checksum)?;
        Ok((blocks, checksum))
    }
    /// Fill the block from the source, returning the amount of image bytes in it.
    fn read_block<S: FirmwareSource>(
        source: &mut S,
        handle: &mut S::Handle,
        block: &mut [u8],
    ) -> HciResult<usize> {
        let mut filled = 0;
        while filled < block.len() {
            match source.read_block(handle, &mut block[filled..])? {
                0 => break,
                read => filled += read,
            }
        }
        Ok(filled)
    }
    fn download<C: ChipRegisters, S: FirmwareSource>(
        &self,
        chip: &mut C,
        source: &mut S,
        handle: &mut S::Handle,
    ) -> HciResult<(u32, FirmwareChecksum)> {
        let block_size = self.config.block_size;
        let mut block = vec![0u8; block_size];
        let mut words: Vec<u32> = vec![0; block_size / 4];
        let mut checksum = FirmwareChecksum::new();
        let mut blocks = 0u32;
        loop {
            block.fill(self.config.fill_byte);
            if Self::read_block(source, handle, &mut block)? == 0 {
                break;
            }
            for (word, bytes) in words.iter_mut().zip(block.chunks_exact(4)) {
                *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                checksum.add_word(*word);
            }
            let address = self.config.block_address(blocks * block_size as u32);
            trace!("Writing firmware block {} to {:x}.", blocks, address);
            chip.write_burst(address, &words)?;
            blocks += 1;
        }
        if blocks == 0 {
            return Err(HciError::ImageUnavailable);
        }
        Ok((blocks, checksum))
    }
}
