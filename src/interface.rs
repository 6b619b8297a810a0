//! The traits, which the surrounding system has to implement.
//!
//! The HCI layer never touches the bus directly. Everything is routed through these
//! collaborators, which makes it possible to run the same scheduler against SDIO, USB or SPI
//! attached chips, as well as against a model of the chip in tests.
use alloc::vec::Vec;

use crate::HciResult;

/// The physical link to the chip.
pub trait Transport {
    /// Check, that the link to the chip is usable.
    ///
    /// This is called once during attach. The default implementation assumes, that the link is
    /// always available.
    fn probe(&mut self) -> HciResult<()> {
        Ok(())
    }
    /// Send a buffer to the chip.
    ///
    /// This is synchronous, but may block briefly.
    fn send(&mut self, buffer: &[u8], priority_tag: u8) -> HciResult<()>;
    /// The amount of requests, which were sent but are still awaiting a response from the chip.
    fn pending_request_count(&self) -> u32;
}

/// Current usage of the chip's TX buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxUsage {
    /// Pages of TX buffer memory in use.
    pub used_pages: u32,
    /// TX descriptor IDs in use.
    pub used_ids: u32,
}

/// Register access on the chip.
pub trait ChipRegisters {
    fn read(&mut self, addr: u32) -> HciResult<u32>;
    fn write(&mut self, addr: u32, value: u32) -> HciResult<()>;
    /// Read consecutive 32-bit words starting at `addr`.
    fn read_burst(&mut self, addr: u32, words: &mut [u32]) -> HciResult<()> {
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.read(addr + (i as u32) * 4)?;
        }
        Ok(())
    }
    /// Write consecutive 32-bit words starting at `addr`.
    fn write_burst(&mut self, addr: u32, words: &[u32]) -> HciResult<()> {
        for (i, word) in words.iter().enumerate() {
            self.write(addr + (i as u32) * 4, *word)?;
        }
        Ok(())
    }
    /// Read the TX usage counters.
    fn tx_usage_counters(&mut self) -> HciResult<TxUsage>;
}

/// What kind of frame this is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameKind {
    /// A regular frame.
    #[default]
    Data,
    /// A control plane throughput test frame.
    ///
    /// These skip the descriptor attachment hook and are freed right after being sent, instead
    /// of being handed to [HciHooks::on_tx_complete_batch].
    ThroughputTest,
}

/// A frame owned by the MAC layer, which can be handed to the HCI layer for transmission.
///
/// Freeing the frame is done by dropping it.
pub trait HciFrame: AsRef<[u8]> {
    /// The kind of the frame.
    fn kind(&self) -> FrameKind {
        FrameKind::Data
    }
}

/// Hooks into the MAC layer, which get called when frame ownership moves back to it.
pub trait HciHooks<F> {
    /// Stamp chip specific metadata onto the frame, right before it is sent.
    fn on_tx_descriptor_attach(&mut self, _frame: &mut F, _queue_id: usize) {}
    /// Frames, which were sent successfully.
    ///
    /// Frames left in the list after this returns are freed.
    fn on_tx_complete_batch(&mut self, _frames: &mut Vec<F>) {}
    /// A frame, that was never sent, because it was flushed or enqueued while stopped.
    fn on_frame_dropped(&mut self, _frame: F) {}
    /// The scheduler entered or left the resource full backoff state.
    fn on_flow_control_update(&mut self, _resource_full: bool) {}
}

/// Source of a firmware image.
pub trait FirmwareSource {
    type Handle;
    fn open(&mut self, name: &str) -> HciResult<Self::Handle>;
    /// Read up to `buffer.len()` bytes into the buffer.
    ///
    /// Returns the amount of bytes read, with zero indicating the end of the image.
    fn read_block(&mut self, handle: &mut Self::Handle, buffer: &mut [u8]) -> HciResult<usize>;
    fn close(&mut self, handle: Self::Handle);
}
