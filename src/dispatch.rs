use alloc::vec::Vec;

use crate::{
    aggregation::AggregationBuffer,
    interface::{FrameKind, HciFrame, HciHooks, Transport},
    queue::TxQueues,
    HciError,
};

/// How frames are handed to the transport.
pub enum DispatchMode {
    /// Every frame is sent on its own.
    Direct,
    /// Frames are packed into the buffer and sent together.
    Aggregated(AggregationBuffer),
}

/// The result of dispatching the admitted frames of one queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Frames handed to the transport successfully.
    pub sent: usize,
    /// Transport transactions issued.
    pub transactions: usize,
    /// The transport failed and the remaining frames were left in the queue.
    pub error: Option<HciError>,
}

/// Give the hook a chance to stamp metadata onto the frame.
fn prepare<F: HciFrame>(frame: &mut F, queue_id: usize, hooks: &mut impl HciHooks<F>) {
    if frame.kind() != FrameKind::ThroughputTest {
        hooks.on_tx_descriptor_attach(frame, queue_id);
    }
}
/// Move the frames, whose transaction completed, to the completed list.
///
/// Throughput test frames are freed right away.
fn complete<F: HciFrame>(in_flight: &mut Vec<F>, completed: &mut Vec<F>) {
    for frame in in_flight.drain(..) {
        if frame.kind() != FrameKind::ThroughputTest {
            completed.push(frame);
        }
    }
}

/// Takes admitted frames out of a queue and sends them.
///
/// This is owned by the scheduler, so the aggregation buffer and the scratch lists are never
/// touched by anyone else.
pub struct Dispatcher<F> {
    mode: DispatchMode,
    /// Frames taken out of the queue, whose transaction hasn't completed yet.
    in_flight: Vec<F>,
    /// Frames sent successfully, waiting to be handed to the completion hook.
    completed: Vec<F>,
}
impl<F: HciFrame> Dispatcher<F> {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            in_flight: Vec::new(),
            completed: Vec::new(),
        }
    }
    pub fn is_aggregating(&self) -> bool {
        matches!(self.mode, DispatchMode::Aggregated(_))
    }
    /// Send up to `admitted` frames from the queue.
    ///
    /// If the transport fails, all frames, that weren't sent, are put back at the head of the
    /// queue in their original order.
    pub fn dispatch(
        &mut self,
        queues: &TxQueues<F>,
        queue_id: usize,
        admitted: usize,
        transport: &mut impl Transport,
        hooks: &mut impl HciHooks<F>,
    ) -> DispatchOutcome {
        let outcome = if self.is_aggregating() {
            self.dispatch_aggregated(queues, queue_id, admitted, transport, hooks)
        } else {
            self.dispatch_direct(queues, queue_id, admitted, transport, hooks)
        };
        if let Some(error) = outcome.error {
            queues.requeue(queue_id, &mut self.in_flight);
            warn!(
                "TX on queue {} failed: {:?}. Sent {} of {} admitted frames.",
                queue_id, error, outcome.sent, admitted
            );
        }
        if let Ok(queue) = queues.get(queue_id) {
            queue.record_sent(outcome.sent);
        }
        if !self.completed.is_empty() {
            hooks.on_tx_complete_batch(&mut self.completed);
            self.completed.clear();
        }
        outcome
    }
    fn dispatch_direct(
        &mut self,
        queues: &TxQueues<F>,
        queue_id: usize,
        admitted: usize,
        transport: &mut impl Transport,
        hooks: &mut impl HciHooks<F>,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for _ in 0..admitted {
            let Some(mut frame) = queues.pop(queue_id) else {
                break;
            };
            prepare(&mut frame, queue_id, hooks);
            let result = transport.send(frame.as_ref(), queue_id as u8);
            self.in_flight.push(frame);
            outcome.transactions += 1;
            if let Err(error) = result {
                outcome.error = Some(error);
                break;
            }
            outcome.sent += 1;
            complete(&mut self.in_flight, &mut self.completed);
        }
        outcome
    }
    fn dispatch_aggregated(
        &mut self,
        queues: &TxQueues<F>,
        queue_id: usize,
        admitted: usize,
        transport: &mut impl Transport,
        hooks: &mut impl HciHooks<F>,
    ) -> DispatchOutcome {
        let DispatchMode::Aggregated(ref mut buffer) = self.mode else {
            return DispatchOutcome::default();
        };
        let mut outcome = DispatchOutcome::default();
        let mut remaining = admitted;
        while remaining != 0 {
            buffer.reset();
            while remaining != 0 {
                // Frames, that don't fit anymore, stay queued for the next aggregate. An empty
                // buffer takes anything, so oversized frames still make progress.
                let Some(mut frame) = queues.pop_if(queue_id, |frame| {
                    buffer.frame_count() == 0 || buffer.fits(frame.as_ref().len())
                }) else {
                    break;
                };
                remaining -= 1;
                prepare(&mut frame, queue_id, hooks);
                if !buffer.push(frame.as_ref()) {
                    // Larger than the whole aggregation buffer, so it goes out on its own.
                    self.in_flight.push(frame);
                    break;
                }
                self.in_flight.push(frame);
            }
            let frame_count = self.in_flight.len();
            if frame_count == 0 {
                break;
            }
            let result = if buffer.frame_count() == 0 {
                self.in_flight
                    .last()
                    .map_or(Ok(()), |frame| transport.send(frame.as_ref(), queue_id as u8))
            } else {
                transport.send(buffer.finish(), queue_id as u8)
            };
            buffer.reset();
            outcome.transactions += 1;
            if let Err(error) = result {
                outcome.error = Some(error);
                break;
            }
            trace!("Sent {} frames from queue {} in one transaction.", frame_count, queue_id);
            outcome.sent += frame_count;
            complete(&mut self.in_flight, &mut self.completed);
        }
        outcome
    }
}
