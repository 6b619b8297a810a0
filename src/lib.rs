//! # `wifi-hci`
//! This is a host controller interface (HCI) layer for FullMAC Wi-Fi chips, which are attached
//! to the host over a bus like SDIO or USB. It sits between the network stack and the bus
//! transport and is completely chip-agnostic. Everything chip specific is passed in through the
//! traits in [interface].
//! ## Overview
//! This chapter will give a short overview of how frames and commands flow through the HCI.
//!
//! ### Transmit (TX)
//! Producers hand frames to [HciController::enqueue], which appends them to one of several
//! software queues. A higher queue ID means a higher priority and the highest queue is reserved
//! for control traffic. Depending on the [TriggerConfig], enqueuing a frame wakes up the
//! scheduling task, which is driven by awaiting [HciController::run].
//!
//! The scheduling task walks the queues from the highest to the lowest priority. For each queue,
//! it reads how many TX pages and TX IDs are used on the chip and admits only as many frames, as
//! the chip has room for. Admitted frames are either sent one by one, or packed into an
//! aggregation buffer and sent in a single bus transaction, if the chip supports it. Frames are
//! handed back to the integrator in batches through [HciHooks::on_tx_complete_batch].
//!
//! If the chip stays full for too long, the scheduler backs off for a while and reports this
//! through [HciHooks::on_flow_control_update].
//!
//! ### Commands
//! Commands are small control messages, which are sent with a header carrying their length and
//! a sequence number. Only one command is in flight at any time. A blocking command waits until
//! the receive path calls [HciController::complete_command] with the matching sequence number.
//!
//! ### Firmware
//! Before the chip can be used, it may need firmware. [HciController::attach_with_firmware]
//! downloads the image block by block into chip memory and verifies it with a checksum, which
//! the chip computes over the same data.

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub(crate) mod fmt;

pub mod aggregation;
pub mod command;
pub mod config;
mod controller;
pub mod dispatch;
mod error;
pub mod firmware;
pub mod interface;
pub mod queue;
pub mod resource;
mod sync;

pub use config::{
    Capabilities, CommandConfig, FirmwareConfig, HciConfig, RegisterMap, ResourceConfig,
    TriggerConfig,
};
pub use controller::{HciController, HciStats, SchedulerState};
pub use error::{HciError, HciResult};
pub use firmware::{EmbeddedImage, FirmwareReport};
pub use interface::{
    ChipRegisters, FirmwareSource, FrameKind, HciFrame, HciHooks, Transport, TxUsage,
};
pub use resource::Admission;

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
