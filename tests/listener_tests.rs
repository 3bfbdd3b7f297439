//! Integration tests for the synchronized frame listener

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use kinect_sync::capture::FrameListener;
use kinect_sync::{Error, Frame, FrameType, FrameTypeMask, PixelFormat, SyncMultiFrameListener};
use kinect_sync::ListenerConfig;

fn frame(kind: FrameType, sequence: u64) -> Frame {
    let format = match kind {
        FrameType::Color => PixelFormat::Bgrx,
        FrameType::Ir | FrameType::Depth => PixelFormat::Float,
    };
    Frame::zeroed(kind, 4, 2, format).unwrap().with_sequence(sequence, Duration::from_micros(sequence))
}

#[test]
fn test_wait_times_out_without_ingest() {
    let listener = SyncMultiFrameListener::with_config(FrameType::Color | FrameType::Depth, &ListenerConfig::default());

    let started = Instant::now();
    let outcome = listener.wait_for_new_frame(Duration::from_millis(50)).unwrap();
    let elapsed = started.elapsed();

    assert!(outcome.is_none());
    assert!(elapsed >= Duration::from_millis(50), "returned early after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "blocked for {elapsed:?}");
}

#[test]
fn test_wait_into_reports_timeout_error() {
    let listener = SyncMultiFrameListener::with_config(FrameType::Depth.into(), &ListenerConfig::default());
    let converter = kinect_sync::FrameConverter::default();
    let mut buffers = kinect_sync::CaptureBuffers::from_parts(None, None, None);
    let err = listener
        .wait_for_new_frame_into(&converter, &mut buffers, Duration::from_millis(10))
        .unwrap_err();
    assert!(err.is_timeout());
}

#[test]
fn test_stop_wakes_blocked_consumer() {
    let listener = SyncMultiFrameListener::with_config(FrameType::Depth.into(), &ListenerConfig::default());

    thread::scope(|scope| {
        let consumer = scope.spawn(|| {
            let started = Instant::now();
            let outcome = listener.wait_for_new_frame(Duration::from_secs(30));
            (outcome.map(|set| set.is_some()), started.elapsed())
        });

        thread::sleep(Duration::from_millis(50));
        listener.stop();

        let (outcome, elapsed) = consumer.join().unwrap();
        assert!(matches!(outcome, Err(Error::Stopped)));
        assert!(elapsed < Duration::from_secs(5));
    });
}

#[test]
fn test_released_frames_reject_reads() {
    let listener = SyncMultiFrameListener::with_config(FrameType::Color | FrameType::Depth, &ListenerConfig::default());
    listener.on_new_frame(frame(FrameType::Color, 1));
    listener.on_new_frame(frame(FrameType::Depth, 1));

    let set = listener.wait_for_new_frame(Duration::ZERO).unwrap().unwrap();
    let kept: Vec<Frame> = set.iter().cloned().collect();
    assert!(kept.iter().all(|frame| frame.data().is_ok()));

    listener.release(set);
    for frame in &kept {
        assert!(matches!(
            frame.data(),
            Err(Error::ContractViolation(kinect_sync::Violation::Released(_)))
        ));
    }
}

/// One producer thread per category, one consumer, default bounds,
/// overwrite-on-stale policy: every cycle is either delivered exactly once
/// or counted as dropped, however far one producer runs ahead.
fn stress(mask: FrameTypeMask, cycles: u64) {
    let listener = SyncMultiFrameListener::with_config(mask, &ListenerConfig::default());
    let producers_done = AtomicBool::new(false);

    let delivered = thread::scope(|scope| {
        let consumer = scope.spawn(|| {
            let mut sequences = Vec::new();
            loop {
                match listener.wait_for_new_frame(Duration::from_millis(20)).unwrap() {
                    Some(set) => {
                        assert!(set.is_complete(mask));
                        assert!(set.iter().all(|frame| frame.sequence() == set.sequence()));
                        sequences.push(set.sequence());
                        listener.release(set);
                    }
                    None if producers_done.load(Ordering::Acquire) && !listener.has_new_frame() => break,
                    None => {}
                }
            }
            sequences
        });

        let producers: Vec<_> = mask
            .iter()
            .map(|kind| {
                let listener = &listener;
                scope.spawn(move || {
                    for sequence in 1..=cycles {
                        listener.on_new_frame(frame(kind, sequence));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        producers_done.store(true, Ordering::Release);

        consumer.join().unwrap()
    });

    assert!(
        delivered.windows(2).all(|pair| pair[0] < pair[1]),
        "sets must arrive in increasing cycle order without duplicates"
    );
    let stats = listener.stats();
    assert_eq!(stats.frames_received, cycles * mask.len() as u64);
    assert_eq!(stats.frames_rejected, 0);
    assert_eq!(stats.sets_evicted, 0);
    assert_eq!(stats.sets_completed, cycles);
    assert_eq!(stats.sets_delivered, delivered.len() as u64);
    assert_eq!(delivered.len() as u64 + stats.sets_dropped, cycles);
    assert_eq!(delivered.last().copied(), Some(cycles));
}

#[test]
fn test_concurrent_color_and_depth_producers() {
    stress(FrameType::Color | FrameType::Depth, 1000);
}

#[test]
fn test_concurrent_producers_for_every_category() {
    stress(FrameTypeMask::ALL, 1000);
}

#[test]
fn test_producer_far_ahead_loses_no_cycles() {
    let mask = FrameTypeMask::ALL;
    let cycles = 200;
    let listener = SyncMultiFrameListener::with_config(mask, &ListenerConfig::default());

    thread::scope(|scope| {
        // Depth runs the whole way before the other streams start
        let depth = scope.spawn(|| {
            for sequence in 1..=cycles {
                listener.on_new_frame(frame(FrameType::Depth, sequence));
            }
        });
        thread::sleep(Duration::from_millis(20));
        for kind in [FrameType::Color, FrameType::Ir] {
            let listener = &listener;
            scope.spawn(move || {
                for sequence in 1..=cycles {
                    listener.on_new_frame(frame(kind, sequence));
                }
            });
        }
        depth.join().unwrap();
    });

    let stats = listener.stats();
    assert_eq!(stats.sets_evicted, 0);
    assert_eq!(stats.frames_rejected, 0);
    assert_eq!(stats.sets_completed, cycles);
    assert_eq!(stats.sets_dropped, cycles - 1);
    let set = listener.wait_for_new_frame(Duration::ZERO).unwrap().unwrap();
    assert_eq!(set.sequence(), cycles);
    listener.release(set);
}
