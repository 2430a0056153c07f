//! Statistics unit driven through one trial without the rest of the rig.
#![cfg(feature = "storage_csv")]

use closed_loop_rig::barrier::{AckCollector, StartBarrier};
use closed_loop_rig::bus::{command_queue, upstream_queue};
use closed_loop_rig::config::RigConfig;
use closed_loop_rig::control::{MockPinDevice, StatisticsUnit, StatsHandles};
use closed_loop_rig::frame::{frame_channel, FrameShape};
use closed_loop_rig::maps::{MapSet, MultiStreamSync, PROGRESS_HEIGHT};
use closed_loop_rig::messages::{
    Command, Coordinate, Envelope, StatsCommand, TargetParams, TrialParameters, UnitName,
};
use std::time::Duration;
use tokio::sync::mpsc;

async fn next_from_statistics(
    inbox: &mut mpsc::UnboundedReceiver<Envelope>,
    wanted: fn(&Command) -> bool,
) -> Command {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let envelope = inbox.recv().await.expect("upstream closed");
            if envelope.origin == Some(UnitName::Statistics) && wanted(&envelope.command) {
                return envelope.command;
            }
        }
    })
    .await
    .expect("statistics unit did not report in time")
}

#[tokio::test]
async fn test_trial_counts_entries_and_fires_stimulus() {
    let channels = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let mut config = RigConfig::default();
    config.application.output_dir = output.path().to_path_buf();
    config.bus.poll_timeout = Duration::from_millis(50);
    config.bus.unit_idle = Duration::from_millis(5);

    let spin = config.frames.spin_interval;
    let (rows, cols) = (config.frames.rows, config.frames.cols);
    let [heatmap, path, gradient] = MapSet::shapes(&config.maps, rows, cols);
    let (heatmap_out, _heatmap_in) = frame_channel(&channels.path().join("h"), heatmap, spin).unwrap();
    let (path_out, _path_in) = frame_channel(&channels.path().join("p"), path, spin).unwrap();
    let (gradient_out, _gradient_in) = frame_channel(&channels.path().join("g"), gradient, spin).unwrap();
    let (progress_out, _progress_in) = frame_channel(
        &channels.path().join("bar"),
        FrameShape::rgb(PROGRESS_HEIGHT, cols),
        spin,
    )
    .unwrap();

    let (upstream, mut inbox) = upstream_queue();
    let (commands, commands_rx) = command_queue(UnitName::Statistics);
    let barrier = StartBarrier::new();
    let (participant, ack) = barrier.participant(UnitName::Statistics);
    let mut acks = AckCollector::new(vec![ack]);
    let (coordinates, coordinates_rx) = mpsc::unbounded_channel();
    let device = MockPinDevice::connected();

    let unit = StatisticsUnit::new(
        &config,
        StatsHandles {
            commands: commands_rx,
            coordinates: coordinates_rx,
            maps: MultiStreamSync::new(vec![heatmap_out, path_out, gradient_out]),
            progress: progress_out,
            upstream: upstream.with_origin(Some(UnitName::Statistics)),
            barrier: participant,
            device: Box::new(device.clone()),
        },
    )
    .unwrap();
    let task = tokio::spawn(unit.run());

    commands
        .send(StatsCommand::DrawTarget(Some(TargetParams {
            center: (100, 100),
            normalized_center: (100.0 / 640.0, 100.0 / 480.0),
            radius: 20,
        })))
        .unwrap();
    let generation = barrier.arm();
    commands
        .send(StatsCommand::Start(TrialParameters::new("mouse1", 1.0)))
        .unwrap();
    acks.collect(generation, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    barrier.release();

    for coordinate in [
        Coordinate::detected(100, 100),
        Coordinate::MISSING,
        Coordinate::detected(100, 100),
    ] {
        coordinates.send(coordinate).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    next_from_statistics(&mut inbox, |c| matches!(c, Command::Saving)).await;
    next_from_statistics(&mut inbox, |c| matches!(c, Command::Finished)).await;
    assert!(device.pulses(config.stimulus.stimulus_pin) >= 1);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(output.path().join("mouse1_Coords.csv"))
        .unwrap();
    let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    let last = rows.last().unwrap();
    assert_eq!(&last[4], "2", "entry count in {last:?}");
    assert!(last[8].parse::<u32>().unwrap() >= 1, "stim count in {last:?}");
    assert!(output.path().join("mouse1_Heatmap.png").exists());
    assert!(output.path().join("mouse1_Path.png").exists());

    commands.send(StatsCommand::Exit).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_unit_stops_when_its_queue_closes() {
    let channels = tempfile::tempdir().unwrap();
    let config = RigConfig::default();
    let spin = config.frames.spin_interval;
    let (rows, cols) = (config.frames.rows, config.frames.cols);
    let shapes = MapSet::shapes(&config.maps, rows, cols);
    let maps = shapes
        .iter()
        .enumerate()
        .map(|(i, shape)| frame_channel(&channels.path().join(i.to_string()), *shape, spin).unwrap().0)
        .collect();
    let (progress, _progress_in) = frame_channel(
        &channels.path().join("bar"),
        FrameShape::rgb(PROGRESS_HEIGHT, cols),
        spin,
    )
    .unwrap();

    let (upstream, _inbox) = upstream_queue();
    let (commands, commands_rx) = command_queue(UnitName::Statistics);
    let barrier = StartBarrier::new();
    let (participant, _ack) = barrier.participant(UnitName::Statistics);
    let (_coordinates, coordinates_rx) = mpsc::unbounded_channel();

    let unit = StatisticsUnit::new(
        &config,
        StatsHandles {
            commands: commands_rx,
            coordinates: coordinates_rx,
            maps: MultiStreamSync::new(maps),
            progress,
            upstream: upstream.with_origin(Some(UnitName::Statistics)),
            barrier: participant,
            device: Box::new(MockPinDevice::connected()),
        },
    )
    .unwrap();
    let task = tokio::spawn(unit.run());
    drop(commands);

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
