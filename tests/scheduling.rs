mod common;

use common::*;
use embassy_futures::{block_on, join::join};
use embassy_time::{Duration, Instant, Timer};
use wifi_hci::{aggregation::AggregateFrames, Capabilities, TriggerConfig};

#[test]
fn frames_leave_each_queue_in_fifo_order() {
    let harness = Harness::new(test_config());
    let controller = &harness.controller;
    block_on(join(controller.run(), async {
        for index in 0..8 {
            // The scheduler doesn't get polled, until we yield.
            assert_eq!(
                controller.enqueue(1, TestFrame::new(1, index, 64), false),
                Ok(index as usize + 1)
            );
        }
        wait_until(|| harness.completed().len() == 8).await;
        controller.detach().await.unwrap();
    }));
    let expected = (0..8).map(|index| (1, index)).collect::<Vec<_>>();
    assert_eq!(harness.completed(), expected);
    let on_wire = harness
        .sent()
        .iter()
        .map(|(bytes, _)| frame_tag(bytes))
        .collect::<Vec<_>>();
    assert_eq!(on_wire, expected);
    assert!(harness.dropped().is_empty());
}

#[test]
fn head_insertion_jumps_the_queue() {
    let harness = Harness::new(test_config());
    let controller = &harness.controller;
    controller.pause_queue(0).unwrap();
    controller
        .enqueue(0, TestFrame::new(0, 0, 32), false)
        .unwrap();
    controller
        .enqueue(0, TestFrame::new(0, 1, 32), false)
        .unwrap();
    assert_eq!(controller.enqueue(0, TestFrame::new(0, 2, 32), true), Ok(3));
    block_on(join(controller.run(), async {
        controller.resume_queue(0).unwrap();
        wait_until(|| harness.completed().len() == 3).await;
        controller.detach().await.unwrap();
    }));
    assert_eq!(harness.completed(), vec![(0, 2), (0, 0), (0, 1)]);
}

#[test]
fn higher_priority_queues_drain_first() {
    let harness = Harness::new(test_config());
    let controller = &harness.controller;
    for index in 0..3 {
        controller
            .enqueue(0, TestFrame::new(0, index, 100), false)
            .unwrap();
    }
    for index in 0..3 {
        controller
            .enqueue(3, TestFrame::new(3, index, 100), false)
            .unwrap();
    }
    block_on(join(controller.run(), async {
        wait_until(|| harness.completed().len() == 6).await;
        controller.detach().await.unwrap();
    }));
    let queue_order = harness
        .sent()
        .iter()
        .map(|(bytes, _)| frame_tag(bytes).0)
        .collect::<Vec<_>>();
    assert_eq!(queue_order, vec![3, 3, 3, 0, 0, 0]);
    assert_eq!(controller.queue_sent_count(3), Ok(3));
    assert_eq!(controller.queue_sent_count(0), Ok(3));
}

#[test]
fn paused_queue_is_skipped_until_resumed() {
    let harness = Harness::new(test_config());
    let controller = &harness.controller;
    controller.pause_queue(4).unwrap();
    assert_eq!(controller.is_queue_paused(4), Ok(true));
    block_on(join(controller.run(), async {
        controller
            .enqueue(4, TestFrame::new(4, 0, 16), false)
            .unwrap();
        controller
            .enqueue(2, TestFrame::new(2, 0, 16), false)
            .unwrap();
        wait_until(|| harness.completed().len() == 1).await;
        Timer::after_millis(10).await;
        assert_eq!(harness.completed(), vec![(2, 0)]);
        assert_eq!(controller.queue_len(4), Ok(1));

        controller.resume_queue(4).unwrap();
        wait_until(|| harness.completed().len() == 2).await;
        controller.detach().await.unwrap();
    }));
    assert_eq!(harness.completed(), vec![(2, 0), (4, 0)]);
}

#[test]
fn admission_limits_frames_to_free_pages() {
    let mut config = test_config();
    // Two pages left after the command reservation.
    config.resources.capacity_pages = 10;
    let harness = Harness::new(config);
    let controller = &harness.controller;
    for index in 0..3 {
        controller
            .enqueue(0, TestFrame::new(0, index, 200), false)
            .unwrap();
    }
    // Each frame needs two pages, so only one fits.
    assert_eq!(
        block_on(controller.admit(0)),
        wifi_hci::Admission::Admitted(1)
    );
    assert_eq!(controller.queue_len(0), Ok(3));
}

#[test]
fn aggregated_frames_share_a_transaction() {
    let mut config = test_config();
    config.capabilities = Capabilities::AGGREGATION;
    let harness = Harness::new(config);
    let controller = &harness.controller;
    for index in 0..4 {
        controller
            .enqueue(1, TestFrame::new(1, index, 101), false)
            .unwrap();
    }
    block_on(join(controller.run(), async {
        wait_until(|| harness.completed().len() == 4).await;
        controller.detach().await.unwrap();
    }));
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    let frames = AggregateFrames::new(&sent[0].0)
        .map(|frame| frame_tag(frame.unwrap()))
        .collect::<Vec<_>>();
    assert_eq!(frames, vec![(1, 0), (1, 1), (1, 2), (1, 3)]);
    assert_eq!(sent[0].0.len() % 4, 0);
}

#[test]
fn transport_failure_requeues_in_order() {
    let harness = Harness::with_chip(
        test_config(),
        ChipModel {
            failing_sends: 1,
            ..Default::default()
        },
    );
    let controller = &harness.controller;
    for index in 0..3 {
        controller
            .enqueue(2, TestFrame::new(2, index, 48), false)
            .unwrap();
    }
    block_on(join(controller.run(), async {
        wait_until(|| harness.completed().len() == 3).await;
        controller.detach().await.unwrap();
    }));
    assert_eq!(harness.completed(), vec![(2, 0), (2, 1), (2, 2)]);
    assert_eq!(controller.stats().transport_errors, 1);
    assert!(harness.dropped().is_empty());
}

#[test]
fn throughput_test_frames_are_freed_after_sending() {
    let harness = Harness::new(test_config());
    let controller = &harness.controller;
    controller
        .enqueue(0, TestFrame::throughput_test(0, 0, 64), false)
        .unwrap();
    controller
        .enqueue(0, TestFrame::new(0, 1, 64), false)
        .unwrap();
    block_on(join(controller.run(), async {
        wait_until(|| harness.sent().len() == 2 && harness.completed().len() == 1).await;
        controller.detach().await.unwrap();
    }));
    assert_eq!(harness.completed(), vec![(0, 1)]);
    assert_eq!(harness.log.lock().unwrap().attached, vec![(0, 1)]);
    assert!(harness.dropped().is_empty());
}

#[test]
fn exhausted_chip_triggers_backoff() {
    let mut config = test_config();
    config.resources.resource_full_threshold = 2;
    let harness = Harness::with_chip(
        config,
        ChipModel {
            used_pages: 160,
            ..Default::default()
        },
    );
    let controller = &harness.controller;
    controller
        .enqueue(0, TestFrame::new(0, 0, 64), false)
        .unwrap();
    block_on(join(controller.run(), async {
        wait_until(|| controller.is_resource_full()).await;
        assert_eq!(harness.flow_control().first(), Some(&true));
        assert!(harness.sent().is_empty());

        harness.chip.lock().unwrap().used_pages = 0;
        wait_until(|| harness.completed().len() == 1).await;
        controller.detach().await.unwrap();
    }));
    assert!(controller.stats().resource_full_trips >= 1);
    assert!(harness.flow_control().contains(&false));
}

#[test]
fn backoff_ends_while_frames_keep_arriving() {
    let mut config = test_config();
    config.resources.resource_full_threshold = 2;
    let backoff = config.resources.resource_full_backoff;
    let harness = Harness::with_chip(
        config,
        ChipModel {
            used_pages: 160,
            ..Default::default()
        },
    );
    let controller = &harness.controller;
    controller
        .enqueue(0, TestFrame::new(0, 0, 64), false)
        .unwrap();
    block_on(join(controller.run(), async {
        wait_until(|| controller.is_resource_full()).await;
        harness.chip.lock().unwrap().used_pages = 0;

        // Every enqueue triggers the scheduler, which must not extend the backoff.
        let freed_at = Instant::now();
        let mut index = 1;
        while harness.completed().is_empty() {
            assert!(
                freed_at.elapsed() < backoff * 10,
                "Still backing off after {} ms.",
                freed_at.elapsed().as_millis()
            );
            controller
                .enqueue(0, TestFrame::new(0, index, 64), false)
                .unwrap();
            index += 1;
            Timer::after_millis(1).await;
        }
        controller.detach().await.unwrap();
    }));
    assert_eq!(harness.completed().first(), Some(&(0, 0)));
    assert!(harness.flow_control().contains(&false));
}

#[test]
fn trigger_thresholds_defer_the_scheduler() {
    let mut config = test_config();
    config.trigger = TriggerConfig {
        enabled: true,
        queue_len_threshold: 3,
        min_frame_size: 1000,
        poll_timeout: Duration::from_secs(10),
    };
    let harness = Harness::new(config);
    let controller = &harness.controller;
    block_on(join(controller.run(), async {
        controller
            .enqueue(0, TestFrame::new(0, 0, 16), false)
            .unwrap();
        controller
            .enqueue(0, TestFrame::new(0, 1, 16), false)
            .unwrap();
        Timer::after_millis(20).await;
        assert!(harness.sent().is_empty());

        // Reaching the queue length threshold wakes the scheduler.
        controller
            .enqueue(0, TestFrame::new(0, 2, 16), false)
            .unwrap();
        wait_until(|| harness.completed().len() == 3).await;

        // As does a large frame.
        controller
            .enqueue(0, TestFrame::new(0, 3, 1200), false)
            .unwrap();
        wait_until(|| harness.completed().len() == 4).await;

        // And anything on the control queue.
        controller
            .enqueue(4, TestFrame::new(4, 0, 16), false)
            .unwrap();
        wait_until(|| harness.completed().len() == 5).await;
        controller.detach().await.unwrap();
    }));
}
