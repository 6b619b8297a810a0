#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{mpsc, Arc, Mutex},
    thread,
};

use embassy_time::{Duration, Instant, Timer};
use wifi_hci::{
    ChipRegisters, FrameKind, HciConfig, HciController, HciError, HciFrame, HciHooks, HciResult,
    Transport, TriggerConfig, TxUsage,
};

/// A frame tagged with the queue it was enqueued to and its position in that queue.
#[derive(Debug, PartialEq, Eq)]
pub struct TestFrame {
    pub queue_id: usize,
    pub index: u32,
    pub kind: FrameKind,
    payload: Vec<u8>,
}
impl TestFrame {
    pub fn new(queue_id: usize, index: u32, len: usize) -> Self {
        let mut payload = vec![queue_id as u8; len.max(5)];
        payload[1..5].copy_from_slice(&index.to_le_bytes());
        Self {
            queue_id,
            index,
            kind: FrameKind::Data,
            payload,
        }
    }
    pub fn throughput_test(queue_id: usize, index: u32, len: usize) -> Self {
        Self {
            kind: FrameKind::ThroughputTest,
            ..Self::new(queue_id, index, len)
        }
    }
}
impl AsRef<[u8]> for TestFrame {
    fn as_ref(&self) -> &[u8] {
        &self.payload
    }
}
impl HciFrame for TestFrame {
    fn kind(&self) -> FrameKind {
        self.kind
    }
}
/// Recover the tag of a frame from its bytes on the wire.
pub fn frame_tag(bytes: &[u8]) -> (usize, u32) {
    (
        bytes[0] as usize,
        u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
    )
}

/// A model of the chip, shared between the transport and the register interface.
#[derive(Debug, Default)]
pub struct ChipModel {
    /// Every buffer handed to the transport, with its priority tag.
    pub sent: Vec<(Vec<u8>, u8)>,
    pub used_pages: u32,
    pub used_ids: u32,
    pub pending_requests: u32,
    /// Fail this many sends, before sending works again.
    pub failing_sends: usize,
    pub probe_fails: bool,
    pub registers: BTreeMap<u32, u32>,
    /// Words written to chip memory since the last CPU reset, in write order.
    pub downloaded: Vec<u32>,
    pub cpu_in_reset: bool,
    /// Flip a bit in the downloaded image for this many attempts.
    pub corrupt_attempts: u32,
    pub reset_count: u32,
    /// Check on every bus access, whether another thread can enter a critical section.
    pub watch_critical_section: bool,
    /// The outcome of each check, in access order.
    pub bus_access_preemptible: Vec<bool>,
}
impl ChipModel {
    fn record_bus_access(&mut self) {
        if self.watch_critical_section {
            self.bus_access_preemptible
                .push(critical_section_is_free());
        }
    }
}
/// Check if another thread can enter a critical section within 100 ms.
fn critical_section_is_free() -> bool {
    let (done, entered) = mpsc::channel();
    thread::spawn(move || {
        critical_section::with(|_| ());
        let _ = done.send(());
    });
    entered
        .recv_timeout(std::time::Duration::from_millis(100))
        .is_ok()
}
pub type SharedChip = Arc<Mutex<ChipModel>>;

pub struct MockTransport(pub SharedChip);
impl Transport for MockTransport {
    fn probe(&mut self) -> HciResult<()> {
        if self.0.lock().unwrap().probe_fails {
            Err(HciError::TransportError)
        } else {
            Ok(())
        }
    }
    fn send(&mut self, buffer: &[u8], priority_tag: u8) -> HciResult<()> {
        let mut chip = self.0.lock().unwrap();
        chip.record_bus_access();
        if chip.failing_sends != 0 {
            chip.failing_sends -= 1;
            return Err(HciError::TransportError);
        }
        chip.sent.push((buffer.to_vec(), priority_tag));
        Ok(())
    }
    fn pending_request_count(&self) -> u32 {
        self.0.lock().unwrap().pending_requests
    }
}

/// Register addresses must match [wifi_hci::RegisterMap::default].
pub struct MockRegisters(pub SharedChip);
impl MockRegisters {
    const CPU_RESET: u32 = 0x4000;
    const FW_BLOCK_COUNT: u32 = 0x4004;
    const FW_CHECKSUM: u32 = 0x4008;
    const MEMORY_START: u32 = 0x0010_0000;
}
/// What the chip computes over the downloaded words.
pub fn chip_checksum(words: &[u32]) -> u32 {
    let sum = words.iter().fold(0u32, |sum, word| sum.wrapping_add(*word));
    let mut folded = sum.to_le_bytes().iter().map(|byte| *byte as u32).sum::<u32>();
    while folded > 0xff {
        folded = (folded & 0xff) + (folded >> 8);
    }
    folded << 8
}
impl ChipRegisters for MockRegisters {
    fn read(&mut self, addr: u32) -> HciResult<u32> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .registers
            .get(&addr)
            .copied()
            .unwrap_or_default())
    }
    fn write(&mut self, addr: u32, value: u32) -> HciResult<()> {
        let mut chip = self.0.lock().unwrap();
        chip.record_bus_access();
        match addr {
            Self::CPU_RESET if value == 1 => {
                chip.cpu_in_reset = true;
                chip.reset_count += 1;
                chip.downloaded.clear();
                chip.registers.remove(&Self::FW_CHECKSUM);
            }
            Self::CPU_RESET => {
                chip.cpu_in_reset = false;
                if chip.corrupt_attempts != 0 {
                    chip.corrupt_attempts -= 1;
                    if let Some(word) = chip.downloaded.first_mut() {
                        *word ^= 1;
                    }
                }
                let checksum = chip_checksum(&chip.downloaded);
                chip.registers.insert(Self::FW_CHECKSUM, checksum);
            }
            addr if addr >= Self::MEMORY_START => {
                assert!(chip.cpu_in_reset, "Firmware written while CPU was running.");
                chip.downloaded.push(value);
            }
            _ => {}
        }
        chip.registers.insert(addr, value);
        Ok(())
    }
    fn tx_usage_counters(&mut self) -> HciResult<TxUsage> {
        let mut chip = self.0.lock().unwrap();
        chip.record_bus_access();
        Ok(TxUsage {
            used_pages: chip.used_pages,
            used_ids: chip.used_ids,
        })
    }
}

/// Everything the hooks observed.
#[derive(Debug, Default)]
pub struct HookLog {
    pub attached: Vec<(usize, u32)>,
    pub completed: Vec<(usize, u32)>,
    pub dropped: Vec<(usize, u32)>,
    pub flow_control: Vec<bool>,
}
pub type SharedLog = Arc<Mutex<HookLog>>;

pub struct RecordingHooks(pub SharedLog);
impl HciHooks<TestFrame> for RecordingHooks {
    fn on_tx_descriptor_attach(&mut self, frame: &mut TestFrame, queue_id: usize) {
        assert_eq!(frame.queue_id, queue_id);
        self.0
            .lock()
            .unwrap()
            .attached
            .push((frame.queue_id, frame.index));
    }
    fn on_tx_complete_batch(&mut self, frames: &mut Vec<TestFrame>) {
        let mut log = self.0.lock().unwrap();
        for frame in frames.drain(..) {
            log.completed.push((frame.queue_id, frame.index));
        }
    }
    fn on_frame_dropped(&mut self, frame: TestFrame) {
        self.0
            .lock()
            .unwrap()
            .dropped
            .push((frame.queue_id, frame.index));
    }
    fn on_flow_control_update(&mut self, resource_full: bool) {
        self.0.lock().unwrap().flow_control.push(resource_full);
    }
}

pub type TestController = HciController<MockTransport, MockRegisters, RecordingHooks, TestFrame>;

pub struct Harness {
    pub chip: SharedChip,
    pub log: SharedLog,
    pub controller: TestController,
}
impl Harness {
    pub fn new(config: HciConfig) -> Self {
        Self::with_chip(config, ChipModel::default())
    }
    pub fn with_chip(config: HciConfig, chip: ChipModel) -> Self {
        let chip = Arc::new(Mutex::new(chip));
        let log = SharedLog::default();
        let controller = HciController::attach(
            config,
            MockTransport(chip.clone()),
            MockRegisters(chip.clone()),
            RecordingHooks(log.clone()),
        )
        .unwrap();
        Self {
            chip,
            log,
            controller,
        }
    }
    pub fn sent(&self) -> Vec<(Vec<u8>, u8)> {
        self.chip.lock().unwrap().sent.clone()
    }
    pub fn completed(&self) -> Vec<(usize, u32)> {
        self.log.lock().unwrap().completed.clone()
    }
    pub fn dropped(&self) -> Vec<(usize, u32)> {
        self.log.lock().unwrap().dropped.clone()
    }
    pub fn flow_control(&self) -> Vec<bool> {
        self.log.lock().unwrap().flow_control.clone()
    }
}

/// A config with short timeouts, so tests finish quickly.
pub fn test_config() -> HciConfig {
    let mut config = HciConfig::default();
    config.trigger = TriggerConfig {
        poll_timeout: Duration::from_millis(2),
        ..TriggerConfig::default()
    };
    config.resources.resource_full_backoff = Duration::from_millis(5);
    config.firmware.settle_time = Duration::from_millis(1);
    config.stop_timeout = Duration::from_millis(500);
    config
}

/// Poll the condition until it holds, panicking after a second.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(Instant::now() < deadline, "Condition wasn't met in time.");
        Timer::after_millis(1).await;
    }
}
