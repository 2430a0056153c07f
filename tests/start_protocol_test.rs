//! Trial start and save reporting through the router and the start barrier.

use closed_loop_rig::barrier::{AckCollector, BarrierParticipant, BarrierState, StartBarrier};
use closed_loop_rig::bus::{
    command_queue, upstream_queue, CommandReceiver, PollCadence, Router, RouterSettings, UnitQueues,
    Upstream,
};
use closed_loop_rig::config::BusConfig;
use closed_loop_rig::messages::{Command, RecorderCommand, StatsCommand, TrialParameters, UnitName};
use std::time::Duration;
use tokio::task::JoinHandle;

async fn recv_within<T>(rx: &mut CommandReceiver<T>, timeout: Duration) -> Option<T> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

struct Harness {
    control: Upstream,
    gui: CommandReceiver<Command>,
    statistics: CommandReceiver<StatsCommand>,
    raw: CommandReceiver<RecorderCommand>,
    processed: CommandReceiver<RecorderCommand>,
    /// Never acknowledges; only watches the barrier
    observer: BarrierParticipant,
    participants: Vec<BarrierParticipant>,
    router: JoinHandle<closed_loop_rig::error::AppResult<()>>,
    _output: tempfile::TempDir,
}

fn harness(ack_timeout: Option<Duration>) -> Harness {
    let output = tempfile::tempdir().unwrap();
    let (control, inbox) = upstream_queue();
    let (camera_tx, _camera_rx) = command_queue(UnitName::Camera);
    let (tracker_tx, _tracker_rx) = command_queue(UnitName::Tracker);
    let (stats_tx, statistics) = command_queue(UnitName::Statistics);
    let (raw_tx, raw) = command_queue(UnitName::RawRecorder);
    let (processed_tx, processed) = command_queue(UnitName::ProcessedRecorder);
    let (gui_tx, gui) = command_queue(UnitName::Gui);

    let barrier = StartBarrier::new();
    let mut participants = Vec::new();
    let mut acks = Vec::new();
    for unit in UnitName::TRIAL_PARTICIPANTS {
        let (participant, ack) = barrier.participant(unit);
        participants.push(participant);
        acks.push(ack);
    }

    let (observer, _unused) = barrier.participant(UnitName::Camera);

    let bus = BusConfig {
        poll_timeout: Duration::from_millis(20),
        unit_idle: Duration::from_millis(2),
        router_idle: Duration::from_millis(1),
    };
    let router = Router::new(
        inbox,
        UnitQueues {
            camera: camera_tx,
            tracker: tracker_tx,
            statistics: stats_tx,
            raw_recorder: raw_tx,
            processed_recorder: processed_tx,
            gui: gui_tx,
        },
        barrier,
        AckCollector::new(acks),
        RouterSettings {
            cadence: PollCadence::router(&bus),
            ack_timeout,
            output_dir: output.path().to_path_buf(),
        },
    );

    Harness {
        control,
        gui,
        statistics,
        raw,
        processed,
        observer,
        participants,
        router: tokio::spawn(router.run()),
        _output: output,
    }
}

#[tokio::test]
async fn test_all_participants_start_on_release() {
    let mut h = harness(Some(Duration::from_secs(5)));
    h.control
        .send(Command::Start(TrialParameters::new("t1", 10.0)))
        .unwrap();

    assert!(matches!(
        recv_within(&mut h.statistics, Duration::from_secs(2)).await,
        Some(StatsCommand::Start(p)) if p.name == "t1"
    ));
    assert!(matches!(
        recv_within(&mut h.raw, Duration::from_secs(2)).await,
        Some(RecorderCommand::Start(_))
    ));
    assert!(matches!(
        recv_within(&mut h.processed, Duration::from_secs(2)).await,
        Some(RecorderCommand::Start(_))
    ));

    let waiters: Vec<_> = h
        .participants
        .drain(..)
        .map(|mut participant| tokio::spawn(async move { participant.acknowledge_and_wait().await }))
        .collect();
    let mut released = Vec::new();
    for waiter in waiters {
        released.push(waiter.await.unwrap().unwrap());
    }
    assert_eq!(h.observer.phase().state, BarrierState::Released);
    assert!(matches!(
        recv_within(&mut h.gui, Duration::from_secs(2)).await,
        Some(Command::Started)
    ));

    h.control.send(Command::Exit).unwrap();
    h.router.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_missing_ack_times_out_and_stops_participants() {
    let mut h = harness(Some(Duration::from_millis(200)));
    h.control
        .send(Command::Start(TrialParameters::new("t2", 10.0)))
        .unwrap();

    assert!(matches!(
        recv_within(&mut h.statistics, Duration::from_secs(2)).await,
        Some(StatsCommand::Start(_))
    ));
    // only statistics acknowledges
    let mut statistics = h.participants.remove(0);
    let waiter = tokio::spawn(async move { statistics.acknowledge_and_wait().await });

    assert!(matches!(
        recv_within(&mut h.gui, Duration::from_secs(2)).await,
        Some(Command::Error { destination: UnitName::Gui, .. })
    ));
    assert!(waiter.await.unwrap().is_err());
    assert_eq!(h.observer.phase().state, BarrierState::Idle);

    let mut saw_stop = false;
    while let Some(command) = recv_within(&mut h.raw, Duration::from_millis(200)).await {
        saw_stop |= matches!(command, RecorderCommand::Stop);
    }
    assert!(saw_stop);

    h.control.send(Command::Exit).unwrap();
    h.router.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_saving_and_finished_fold_into_one_notification() {
    let mut h = harness(None);
    let from = |unit| h.control.with_origin(Some(unit));

    for unit in UnitName::TRIAL_PARTICIPANTS {
        from(unit).send(Command::Saving).unwrap();
    }
    assert!(matches!(
        recv_within(&mut h.gui, Duration::from_secs(2)).await,
        Some(Command::Saving)
    ));

    from(UnitName::Statistics).send(Command::Finished).unwrap();
    from(UnitName::RawRecorder).send(Command::Finished).unwrap();
    assert!(recv_within(&mut h.gui, Duration::from_millis(200)).await.is_none());
    from(UnitName::ProcessedRecorder).send(Command::Finished).unwrap();
    assert!(matches!(
        recv_within(&mut h.gui, Duration::from_secs(2)).await,
        Some(Command::Finished)
    ));

    h.control.send(Command::Exit).unwrap();
    h.router.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_errors_for_gui_are_forwarded() {
    let mut h = harness(None);
    h.control
        .with_origin(Some(UnitName::Camera))
        .send(Command::Error {
            destination: UnitName::Gui,
            reason: "recording missing".to_string(),
        })
        .unwrap();
    match recv_within(&mut h.gui, Duration::from_secs(2)).await {
        Some(Command::Error { reason, .. }) => assert_eq!(reason, "recording missing"),
        other => panic!("unexpected notification {other:?}"),
    }
    drop(h.control);
    h.router.await.unwrap().unwrap();
}
