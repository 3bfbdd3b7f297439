//! Integration tests for capture sessions over the synthetic driver

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kinect_sync::capture::synthetic::{color_value, depth_value};
use kinect_sync::capture::{Driver, PacketPipeline, SyntheticDriver};
use kinect_sync::{
    CaptureConfig, CaptureSession, ColorOrder, Error, FrameConverter, FrameType, FrameTypeMask,
    ListenerConfig, SyncMultiFrameListener, Violation,
};

fn small_config(fps: u32, pool_size: usize) -> CaptureConfig {
    CaptureConfig {
        fps,
        pool_size,
        color_width: 8,
        color_height: 4,
        depth_width: 4,
        depth_height: 4,
        ..CaptureConfig::default()
    }
}

fn listener(mask: FrameTypeMask) -> Arc<SyncMultiFrameListener> {
    Arc::new(SyncMultiFrameListener::with_config(mask, &ListenerConfig::default()))
}

#[test]
fn test_frames_carry_device_pixels() {
    let config = small_config(0, 8);
    let driver = SyntheticDriver::new(1, config.clone()).with_frame_limit(5);
    let mut session = CaptureSession::open(&driver, config).unwrap();
    let mask = FrameType::Color | FrameType::Depth;
    let listener = listener(mask);
    session.set_listener(mask, Arc::clone(&listener)).unwrap();
    session.start().unwrap();

    let converter = FrameConverter::new(ColorOrder::Native);
    let mut last = 0;
    while last < 5 {
        let set = listener
            .wait_for_new_frame(Duration::from_secs(5))
            .unwrap()
            .expect("synthetic device delivers every cycle");
        assert!(set.sequence() > last);
        last = set.sequence();

        let depth = converter.to_array(set.depth().unwrap()).unwrap();
        let depth = depth.as_float().unwrap();
        for (pixel, value) in depth.as_slice().iter().enumerate() {
            assert_eq!(*value, depth_value(pixel, last));
        }

        let color = converter.to_array(set.color().unwrap()).unwrap();
        let color = color.as_color().unwrap();
        assert_eq!(color.pixel(3, 5).unwrap(), &color_value(5, 3, last)[..]);

        listener.release(set);
    }

    session.stop().unwrap();
    session.close().unwrap();
}

#[test]
fn test_optimized_loop_fills_preallocated_buffers() {
    let config = small_config(0, 4);
    let driver = SyntheticDriver::new(1, config.clone()).with_frame_limit(3);
    let mut session = CaptureSession::open(&driver, config).unwrap();
    let listener = listener(FrameTypeMask::ALL);
    session.set_listener(FrameTypeMask::ALL, Arc::clone(&listener)).unwrap();

    let converter = FrameConverter::new(ColorOrder::Rgb);
    let mut buffers = session.buffers(&converter);
    assert_eq!(buffers.mask(), FrameTypeMask::ALL);
    session.start().unwrap();

    let mut sequence = 0;
    while sequence < 3 {
        let info = listener
            .wait_for_new_frame_into(&converter, &mut buffers, Duration::from_secs(5))
            .unwrap();
        sequence = info.sequence;
        assert!(info.meta(FrameType::Ir).is_some());

        let [b, g, r, _] = color_value(0, 0, sequence);
        assert_eq!(buffers.color().unwrap().pixel(0, 0).unwrap(), &[r, g, b][..]);
        assert_eq!(buffers.depth().unwrap().get(0, 1, 0), Some(depth_value(1, sequence)));
    }
    session.stop().unwrap();

    // Every slot went back to the driver
    for kind in FrameType::ALL {
        let stats = driver.pool_stats(0, kind).unwrap();
        assert_eq!(stats.available, stats.capacity, "{kind} slots still held");
    }
}

#[test]
fn test_unreleased_sets_stall_capture_until_released() {
    let config = small_config(200, 2);
    let driver = SyntheticDriver::new(1, config.clone());
    let mut session = CaptureSession::open(&driver, config).unwrap();
    let mask = FrameType::Color | FrameType::Depth;
    let listener = listener(mask);
    session.set_listener(mask, Arc::clone(&listener)).unwrap();
    session.start().unwrap();

    let first = listener.wait_for_new_frame(Duration::from_secs(5)).unwrap().unwrap();
    let second = listener.wait_for_new_frame(Duration::from_secs(5)).unwrap().unwrap();

    // Both pool slots of each stream are pinned by the consumer
    let deadline = Instant::now() + Duration::from_secs(5);
    while driver.undelivered(0) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(driver.undelivered(0) > 0);
    assert!(!listener.has_new_frame());

    let latest = second.sequence();
    listener.release(first);
    listener.release(second);

    let resumed = listener.wait_for_new_frame(Duration::from_secs(5)).unwrap().unwrap();
    assert!(resumed.sequence() > latest);
    listener.release(resumed);
    session.stop().unwrap();
}

#[test]
fn test_stop_unblocks_waiting_consumer() {
    let config = small_config(0, 4);
    let driver = SyntheticDriver::new(1, config.clone()).with_frame_limit(0);
    let mut session = CaptureSession::open(&driver, config).unwrap();
    let mask = FrameType::Depth.into();
    let listener = listener(mask);
    session.set_listener(mask, Arc::clone(&listener)).unwrap();
    session.start().unwrap();

    let consumer = {
        let listener = Arc::clone(&listener);
        thread::spawn(move || listener.wait_for_new_frame(Duration::from_secs(30)).map(|set| set.is_some()))
    };
    thread::sleep(Duration::from_millis(50));
    session.stop().unwrap();

    assert!(matches!(consumer.join().unwrap(), Err(Error::Stopped)));

    // A restarted session accepts frames again
    session.start().unwrap();
    assert!(!listener.is_stopped());
    session.stop().unwrap();
}

#[test]
fn test_listener_needs_routed_streams() {
    let config = small_config(0, 2);
    let driver = SyntheticDriver::new(1, config.clone());
    let mut session = CaptureSession::open(&driver, config).unwrap();

    let err = session
        .set_listener(FrameType::Color.into(), listener(FrameType::Color | FrameType::Ir))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ContractViolation(Violation::UnroutedStream(missing)) if missing == FrameType::Ir.into()
    ));

    // Routing depth routes ir as well
    session
        .set_listener(FrameType::Color | FrameType::Depth, listener(FrameTypeMask::ALL))
        .unwrap();
}

#[test]
fn test_open_failures_are_device_failures() {
    let config = CaptureConfig {
        device_index: 2,
        ..small_config(0, 2)
    };
    let driver = SyntheticDriver::new(1, config.clone());
    assert!(matches!(CaptureSession::open(&driver, config), Err(Error::DeviceFailure(_))));

    assert!(matches!(
        CaptureSession::open_default(&SyntheticDriver::new(0, small_config(0, 2)), small_config(0, 2)),
        Err(Error::DeviceFailure(_))
    ));

    let empty = SyntheticDriver::new(0, small_config(0, 2));
    assert_eq!(empty.enumerate_devices(), 0);
    assert!(empty.open_default_device(PacketPipeline::OpenCl { device: None }).is_err());
}

#[test]
fn test_open_default_ignores_configured_index() {
    let config = CaptureConfig {
        device_index: 5,
        pipeline: PacketPipeline::OpenCl { device: Some(1) },
        ..small_config(0, 2)
    };
    let driver = SyntheticDriver::new(2, config.clone());
    let session = CaptureSession::open_default(&driver, config).unwrap();

    assert_eq!(Some(session.serial_number().to_owned()), driver.device_serial_number(0));
    assert_eq!(session.config().device_index, 0);
    assert_eq!(session.config().pipeline.device(), Some(1));
    session.close().unwrap();
}
