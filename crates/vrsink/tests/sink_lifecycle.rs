use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use vrsink::gpu::{GpuApi, GpuDevice, GpuError, HeadlessDeviceFactory, HeadlessProbe};
use vrsink::{
    DisplayInfo, ErrorKind, FrameConsumer, FrameMeta, FramePool, Fraction, GeometryProvider,
    MouseAction, MultiviewFlags, MultiviewMode, NavigationEvent, PixelFormat, Rect, Sample, Sink,
    SinkError, State, StateChange, StateMachine, VideoFrame, ViewRole, WindowEvent,
};

fn headless_sink() -> (Sink, HeadlessProbe) {
    let factory = HeadlessDeviceFactory::new();
    let probe = factory.probe();
    (Sink::new(Arc::new(factory)), probe)
}

fn solid(width: u32, height: u32, pts_ms: u64, rgba: [u8; 4]) -> VideoFrame {
    let pixels = rgba.repeat(width as usize * height as usize);
    VideoFrame::from_pixels(width, height, pixels, FrameMeta::at(Duration::from_millis(pts_ms)))
        .unwrap()
}

/// Waits until every task queued on the sink's GPU thread has run.
fn flush(sink: &Sink) {
    sink.window()
        .expect("sink has a window")
        .send_message(|_| ())
        .unwrap();
}

#[test]
fn letterboxes_into_a_resized_window() {
    let (sink, probe) = headless_sink();
    sink.set_state(State::Playing).unwrap();
    sink.set_caps(&DisplayInfo::rgba(160, 90)).unwrap();
    assert_eq!(sink.video_size(), (160, 90));

    let frame = solid(160, 90, 0, [255, 0, 0, 255]);
    sink.render(&frame).unwrap();

    let window = sink.window().unwrap();
    window
        .dispatch(WindowEvent::Resized {
            width: 800,
            height: 600,
        })
        .unwrap();
    window.dispatch(WindowEvent::Exposed).unwrap();
    flush(&sink);

    let stats = probe.snapshot();
    assert_eq!(stats.last_viewport, Some(Rect::new(0, 75, 800, 450)));
    assert_eq!(sink.display_rect(), Rect::new(0, 75, 800, 450));
    assert_eq!(sink.window_size(), Some((800, 600)));
    assert_eq!(stats.last_drawn_texture, frame.texture());
    assert!(stats.presents >= 2);
    assert_eq!(stats.invalid_draws, 0);

    drop(frame);
    sink.set_state(State::Null).unwrap();
    let stats = probe.snapshot();
    assert_eq!(stats.devices_alive, 0);
    assert_eq!(stats.leaked_objects, 0);
}

#[test]
fn stretches_when_aspect_is_not_forced() {
    let (sink, probe) = headless_sink();
    sink.set_force_aspect_ratio(false);
    sink.set_state(State::Playing).unwrap();
    sink.set_caps(&DisplayInfo::rgba(160, 90)).unwrap();

    let frame = solid(160, 90, 0, [0, 255, 0, 255]);
    sink.render(&frame).unwrap();
    let window = sink.window().unwrap();
    window
        .dispatch(WindowEvent::Resized {
            width: 800,
            height: 600,
        })
        .unwrap();
    window.dispatch(WindowEvent::Exposed).unwrap();
    flush(&sink);

    assert_eq!(probe.snapshot().last_viewport, Some(Rect::new(0, 0, 800, 600)));
    drop(frame);
}

#[test]
fn teardown_releases_everything_and_setup_recovers() {
    let (sink, probe) = headless_sink();
    sink.set_state(State::Playing).unwrap();
    sink.set_caps(&DisplayInfo::rgba(32, 18)).unwrap();
    for pts in 0..5 {
        let frame = solid(32, 18, pts * 40, [pts as u8, 0, 0, 255]);
        sink.render(&frame).unwrap();
    }
    flush(&sink);
    let draws_before = probe.snapshot().draws;
    assert!(draws_before >= 1);

    sink.set_state(State::Ready).unwrap();
    assert!(sink.context().is_none());
    let stats = probe.snapshot();
    assert_eq!(stats.devices_alive, 0);
    assert_eq!(stats.live_objects(), 0);
    assert_eq!(stats.leaked_objects, 0);

    sink.set_state(State::Playing).unwrap();
    let frame = solid(32, 18, 1000, [0, 0, 255, 255]);
    sink.render(&frame).unwrap();
    flush(&sink);
    let stats = probe.snapshot();
    assert_eq!(stats.devices_created, 2);
    assert!(stats.draws > draws_before);
    assert_eq!(stats.last_drawn_texture, frame.texture());

    drop(frame);
    sink.set_state(State::Null).unwrap();
    assert_eq!(probe.snapshot().leaked_objects, 0);
}

#[test]
fn closing_the_window_terminates_the_stream() {
    let (sink, _probe) = headless_sink();
    sink.set_state(State::Playing).unwrap();
    sink.set_caps(&DisplayInfo::rgba(16, 16)).unwrap();
    let first = solid(16, 16, 0, [1, 2, 3, 255]);
    sink.render(&first).unwrap();

    sink.window()
        .unwrap()
        .dispatch(WindowEvent::CloseRequested)
        .unwrap();
    flush(&sink);

    let second = solid(16, 16, 40, [1, 2, 3, 255]);
    let err = sink.render(&second).unwrap_err();
    assert!(matches!(err, SinkError::Terminated(_)));
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(err.is_fatal());
    assert_eq!(err.to_string(), "Output window was closed");
    assert_eq!(
        sink.context().and_then(|context| context.error()).as_deref(),
        Some("Output window was closed")
    );

    // Pausing again re-arms the sink.
    drop((first, second));
    sink.set_state(State::Ready).unwrap();
    sink.set_state(State::Playing).unwrap();
    let third = solid(16, 16, 80, [1, 2, 3, 255]);
    sink.render(&third).unwrap();
    drop(third);
}

#[test]
fn client_draw_sees_every_view_of_a_frame_by_frame_pair() {
    let (sink, probe) = headless_sink();
    let calls = Arc::new(AtomicUsize::new(0));
    let roles = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let calls = Arc::clone(&calls);
        let roles = Arc::clone(&roles);
        sink.set_client_draw_handler(Some(Arc::new(move |_device: &mut dyn GpuDevice, sample: &Sample| {
            calls.fetch_add(1, Ordering::SeqCst);
            roles.lock().unwrap().push(sample.frame.role());
            true
        })));
    }
    sink.set_output_multiview_mode(MultiviewMode::FrameByFrame);
    sink.set_state(State::Playing).unwrap();
    sink.set_caps(
        &DisplayInfo::rgba(8, 4).with_multiview(MultiviewMode::FrameByFrame, MultiviewFlags::empty()),
    )
    .unwrap();

    let left = VideoFrame::from_pixels(
        8,
        4,
        vec![10; 8 * 4 * 4],
        FrameMeta::at(Duration::ZERO).with_role(ViewRole::Left),
    )
    .unwrap();
    let right = VideoFrame::from_pixels(
        8,
        4,
        vec![20; 8 * 4 * 4],
        FrameMeta::at(Duration::ZERO).with_role(ViewRole::Right),
    )
    .unwrap();
    sink.render(&left).unwrap();
    sink.render(&right).unwrap();
    flush(&sink);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*roles.lock().unwrap(), vec![ViewRole::Left, ViewRole::Right]);
    assert_eq!(probe.snapshot().draws, 0);
    assert_eq!(
        sink.output_format().map(|info| info.multiview_mode),
        Some(MultiviewMode::FrameByFrame)
    );

    drop((left, right));
    sink.set_state(State::Null).unwrap();
    assert_eq!(probe.snapshot().leaked_objects, 0);
}

#[test]
fn default_quad_draws_only_the_primary_view() {
    let (sink, probe) = headless_sink();
    sink.set_output_multiview_mode(MultiviewMode::FrameByFrame);
    sink.set_state(State::Playing).unwrap();
    sink.set_caps(
        &DisplayInfo::rgba(8, 4).with_multiview(MultiviewMode::FrameByFrame, MultiviewFlags::empty()),
    )
    .unwrap();

    let left = VideoFrame::from_pixels(
        8,
        4,
        vec![10; 8 * 4 * 4],
        FrameMeta::at(Duration::ZERO).with_role(ViewRole::Left),
    )
    .unwrap();
    let right = VideoFrame::from_pixels(
        8,
        4,
        vec![20; 8 * 4 * 4],
        FrameMeta::at(Duration::ZERO).with_role(ViewRole::Right),
    )
    .unwrap();
    sink.render(&left).unwrap();
    sink.render(&right).unwrap();
    flush(&sink);

    let stats = probe.snapshot();
    assert!(stats.draws >= 1);
    assert_eq!(stats.last_drawn_texture, left.texture());
    assert_ne!(stats.last_drawn_texture, right.texture());

    drop((left, right));
    sink.set_state(State::Null).unwrap();
}

type Reentry = (String, Result<(), SinkError>);

#[test]
fn released_frames_may_prepare_again_from_either_thread() {
    let (sink, probe) = headless_sink();
    let sink = Arc::new(sink);
    sink.set_state(State::Playing).unwrap();
    let info = DisplayInfo::rgba(8, 8);
    sink.set_caps(&info).unwrap();
    let pool = FramePool::new(info, 2, 0).unwrap();

    // Each release re-enters `prepare`, which releases the frame it replaces.
    let gpu_budget = Arc::new(AtomicUsize::new(4));
    let producer_budget = Arc::new(AtomicUsize::new(4));
    let reentries: Arc<Mutex<Vec<Reentry>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let weak = Arc::downgrade(&sink);
        let hook_pool = pool.clone();
        let reentries = Arc::clone(&reentries);
        pool.set_reclaim_hook(Some(move || {
            let name = thread::current().name().unwrap_or_default().to_string();
            let budget = if name.starts_with("vrsink-gl") {
                &gpu_budget
            } else {
                &producer_budget
            };
            if budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_err()
            {
                return;
            }
            let Some(sink) = weak.upgrade() else {
                return;
            };
            let Ok(frame) = hook_pool.acquire(FrameMeta::default(), |pixels| pixels.fill(0x55))
            else {
                return;
            };
            let result = sink.prepare(&frame);
            reentries.lock().unwrap().push((name, result));
        }));
    }

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let producer = {
        let sink = Arc::clone(&sink);
        let pool = pool.clone();
        thread::Builder::new()
            .name("producer".to_string())
            .spawn(move || {
                for index in 0..10u64 {
                    let pts = Duration::from_millis(index * 80);
                    let pending = pool
                        .acquire(FrameMeta::at(pts), |pixels| pixels.fill(index as u8))
                        .unwrap();
                    sink.prepare(&pending).unwrap();
                    drop(pending);
                    // Displaces `pending` before it was ever drawn.
                    let shown = pool
                        .acquire(FrameMeta::at(pts + Duration::from_millis(40)), |pixels| {
                            pixels.fill(!(index as u8))
                        })
                        .unwrap();
                    sink.render(&shown).unwrap();
                    drop(shown);
                    // The queued draw drops the previously stored frame on the GPU thread.
                    sink.window().unwrap().send_message(|_| ()).unwrap();
                }
                done_tx.send(()).unwrap();
            })
            .unwrap()
    };

    done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("sink deadlocked while a released frame re-entered prepare");
    producer.join().unwrap();
    flush(&sink);

    let reentries = std::mem::take(&mut *reentries.lock().unwrap());
    assert!(reentries
        .iter()
        .any(|(name, result)| name == "producer" && result.is_ok()));
    let on_gpu: Vec<_> = reentries
        .iter()
        .filter(|(name, _)| name.starts_with("vrsink-gl"))
        .collect();
    assert!(!on_gpu.is_empty());
    // The GPU thread cannot wait on itself, so its upload is refused instead of blocking.
    assert!(on_gpu
        .iter()
        .all(|(_, result)| matches!(result, Err(SinkError::Upload(GpuError::Reentrant)))));
    assert!(probe.snapshot().draws >= 10);

    pool.set_reclaim_hook(None::<fn()>);
    drop(pool);
    sink.set_state(State::Null).unwrap();
    assert_eq!(probe.snapshot().devices_alive, 0);
}

#[test]
fn navigation_maps_pointer_into_video_coordinates() {
    let (sink, _probe) = headless_sink();
    let (tx, rx) = crossbeam_channel::unbounded();
    sink.set_navigation_handler(Some(Arc::new(move |event: NavigationEvent| {
        let _ = tx.send(event);
    })));
    sink.set_state(State::Playing).unwrap();
    sink.set_caps(&DisplayInfo::rgba(160, 90)).unwrap();
    let frame = solid(160, 90, 0, [0, 0, 0, 255]);
    sink.render(&frame).unwrap();

    let window = sink.window().unwrap();
    window
        .dispatch(WindowEvent::Resized {
            width: 800,
            height: 600,
        })
        .unwrap();
    window
        .dispatch(WindowEvent::Mouse {
            action: MouseAction::Press,
            button: 1,
            x: 400.0,
            y: 300.0,
        })
        .unwrap();
    flush(&sink);

    let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(
        event,
        NavigationEvent::Mouse {
            action: MouseAction::Press,
            button: 1,
            x: 80.0,
            y: 45.0,
        }
    );

    sink.set_handle_events(false);
    window
        .dispatch(WindowEvent::Mouse {
            action: MouseAction::Release,
            button: 1,
            x: 0.0,
            y: 0.0,
        })
        .unwrap();
    flush(&sink);
    assert!(rx.try_recv().is_err());
    drop(frame);
}

#[test]
fn state_changes_must_follow_the_ladder() {
    let (sink, _probe) = headless_sink();
    let err = sink.change_state(StateChange::ReadyToPaused).unwrap_err();
    assert!(matches!(
        err,
        SinkError::InvalidStateChange {
            from: State::Null,
            to: State::Paused
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);

    sink.set_state(State::Playing).unwrap();
    assert_eq!(sink.current_state(), State::Playing);
    sink.set_state(State::Null).unwrap();
    assert_eq!(sink.current_state(), State::Null);
}

#[test]
fn prepare_before_negotiation_is_refused() {
    let (sink, _probe) = headless_sink();
    let frame = solid(4, 4, 0, [0; 4]);
    assert!(matches!(sink.prepare(&frame), Err(SinkError::NotNegotiated)));
}

#[test]
fn unsupported_formats_and_settings_are_rejected() {
    let (sink, _probe) = headless_sink();
    sink.set_state(State::Ready).unwrap();
    let err = sink
        .set_caps(&DisplayInfo::new(PixelFormat::I420, 64, 64))
        .unwrap_err();
    assert!(matches!(err, SinkError::UnsupportedFormat(PixelFormat::I420)));
    assert_eq!(err.kind(), ErrorKind::Configuration);

    assert!(sink.set_pixel_aspect_ratio(Fraction::new(1, 0)).is_err());
    assert!(sink.set_render_rectangle(Rect::new(0, 0, 0, 10)).is_err());
    assert!(sink.set_render_rectangle(Rect::new(10, 10, 320, 240)).is_ok());
}

#[test]
fn setup_without_a_supported_api_fails() {
    let factory = HeadlessDeviceFactory::new().with_api(GpuApi::VULKAN);
    let sink = Sink::new(Arc::new(factory));
    let err = sink.set_state(State::Ready).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert_eq!(sink.current_state(), State::Null);
}

#[test]
fn allocation_proposal_reports_fence_support() {
    let factory = HeadlessDeviceFactory::new().with_fences(false);
    let sink = Sink::new(Arc::new(factory));
    sink.set_state(State::Paused).unwrap();
    let info = DisplayInfo::rgba(64, 32);
    let proposal = sink.propose_allocation(&info, true).unwrap();
    assert!(!proposal.sync_meta);
    assert_eq!(proposal.min_buffers, 2);
    let pool = proposal.pool.unwrap();
    assert_eq!(pool.available(), 2);
    assert!(sink.propose_allocation(&info, false).unwrap().pool.is_none());
}

#[test]
fn frame_times_fall_back_to_the_framerate() {
    let (sink, _probe) = headless_sink();
    sink.set_state(State::Paused).unwrap();
    sink.set_caps(&DisplayInfo::rgba(8, 8).with_fps(Fraction::new(25, 1)))
        .unwrap();

    let frame = solid(8, 8, 1000, [0; 4]);
    assert_eq!(
        sink.frame_times(&frame),
        Some((Duration::from_secs(1), Some(Duration::from_millis(1040))))
    );

    let timed = VideoFrame::from_pixels(
        8,
        8,
        vec![0; 256],
        FrameMeta::at(Duration::from_secs(2)).with_duration(Duration::from_millis(10)),
    )
    .unwrap();
    assert_eq!(
        sink.frame_times(&timed),
        Some((Duration::from_secs(2), Some(Duration::from_millis(2010))))
    );
}

#[test]
fn side_by_side_input_is_converted_for_mono_output() {
    let (sink, probe) = headless_sink();
    sink.set_state(State::Playing).unwrap();
    sink.set_caps(
        &DisplayInfo::rgba(64, 16).with_multiview(MultiviewMode::SideBySide, MultiviewFlags::empty()),
    )
    .unwrap();
    assert_eq!(
        sink.output_format().map(|info| (info.width, info.height, info.multiview_mode)),
        Some((32, 16, MultiviewMode::Mono))
    );

    let frame = solid(64, 16, 0, [9, 9, 9, 255]);
    sink.render(&frame).unwrap();
    flush(&sink);
    let stats = probe.snapshot();
    assert!(stats.conversions >= 1);
    assert_ne!(stats.last_drawn_texture, frame.texture());

    sink.drain();
    drop(frame);
    sink.set_state(State::Null).unwrap();
    assert_eq!(probe.snapshot().leaked_objects, 0);
}
