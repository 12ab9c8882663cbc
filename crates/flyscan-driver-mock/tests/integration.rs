//! Integration tests for the mock endstation.
//!
//! These tests wire the rotation axis, trigger unit and camera together
//! through a trigger line and run a short sweep end to end.

use flyscan_core::capabilities::*;
use flyscan_core::limits::EncoderGeometry;
use flyscan_core::trigger::{CameraTriggerSetup, PcompDirection, PcompSetup};
use flyscan_driver_mock::*;

struct Endstation {
    axis: MockRotaryAxis,
    panda: MockPanda,
    kinetix: MockKinetix,
}

fn endstation(mode: MockMode) -> Endstation {
    let axis = MockRotaryAxis::builder()
        .initial_position(-1.0)
        .mode(mode)
        .build();
    let line = TriggerLine::new("panda_out");
    let panda = MockPanda::builder(axis.subscribe_position(), line.clone())
        .mode(mode)
        .build();
    let kinetix = MockKinetix::builder(line).mode(mode).build();
    Endstation {
        axis,
        panda,
        kinetix,
    }
}

/// 18 deg sweep, 91 images, 40 counts per pulse.
async fn arm(station: &Endstation) {
    let flyer = station.panda.flyer();
    let pcap = station.panda.detector();
    let camera = station.kinetix.flyer();
    let detector = station.kinetix.detector();

    flyer
        .configure_pcomp(PcompSetup {
            start: EncoderGeometry::default().encoder_counts(0.0) as i64,
            step: 40,
            pulses: 91,
            direction: PcompDirection::Negative,
        })
        .await
        .unwrap();

    flyer.stage().await.unwrap();
    pcap.stage().await.unwrap();
    camera.stage().await.unwrap();
    detector.stage().await.unwrap();

    flyer.prepare(91).await.unwrap();
    pcap.prepare(flyer.trigger_info().unwrap()).await.unwrap();
    camera
        .prepare(CameraTriggerSetup {
            num_images: 91,
            exposure_time: Some(0.001),
            software_trigger: false,
        })
        .await
        .unwrap();
    detector.prepare(camera.trigger_info().unwrap()).await.unwrap();
}

async fn sweep(station: &Endstation) {
    let flyer = station.panda.flyer();
    let pcap = station.panda.detector();
    let camera = station.kinetix.flyer();
    let detector = station.kinetix.detector();

    pcap.kickoff().await.unwrap();
    detector.kickoff().await.unwrap();
    camera.kickoff().await.unwrap();
    flyer.kickoff().await.unwrap();
    station.axis.move_abs(19.0).await.unwrap();

    flyer.complete().await.unwrap();
    pcap.complete().await.unwrap();
    camera.complete().await.unwrap();
    detector.complete().await.unwrap();
    station.axis.wait_settled().await.unwrap();
}

#[tokio::test]
async fn test_instant_sweep_captures_every_frame() {
    let station = endstation(MockMode::Instant);
    arm(&station).await;
    sweep(&station).await;

    assert_eq!(station.panda.flyer().pulses_fired(), 91);
    assert_eq!(station.panda.detector().captured_frames(), 91);
    assert_eq!(station.kinetix.detector().captured_frames(), 91);
}

#[tokio::test(start_paused = true)]
async fn test_realistic_sweep_streams_frames_during_motion() {
    let station = endstation(MockMode::Realistic);
    station.axis.set_velocity(30.0).await.unwrap();
    arm(&station).await;

    let detector = station.kinetix.detector();
    sweep(&station).await;

    let data = detector.collect().await.unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].start, 0);
    assert_eq!(data[0].stop, 91);
    assert_eq!(station.axis.current_position(), 19.0);
}

#[tokio::test(start_paused = true)]
async fn test_partial_collect_while_axis_moves() {
    let station = endstation(MockMode::Realistic);
    station.axis.set_velocity(10.0).await.unwrap();
    arm(&station).await;

    let pcap = station.panda.detector();
    pcap.kickoff().await.unwrap();
    station.panda.flyer().kickoff().await.unwrap();
    station.axis.move_abs(19.0).await.unwrap();

    // One second in, the axis is near 9 deg: roughly half the frames.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    let first = pcap.collect().await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(first[0].stop > 10 && first[0].stop < 91, "{:?}", first);

    station.panda.flyer().complete().await.unwrap();
    pcap.complete().await.unwrap();
    let rest = pcap.collect().await.unwrap();
    assert_eq!(rest[0].start, first[0].stop);
    assert_eq!(rest[0].stop, 91);
}

#[tokio::test]
async fn test_unstaged_devices_reject_kickoff() {
    let station = endstation(MockMode::Instant);
    assert!(station.panda.flyer().kickoff().await.is_err());
    assert!(station.kinetix.detector().kickoff().await.is_err());
}
