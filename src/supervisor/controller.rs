//! Lifecycle controller - edge-triggered start/stop of the publish pipeline
//!
//! Every poll combines two inputs, "the capture board sees a signal" and "the
//! sink process is running", into one availability level. Only changes of
//! that level act on the pipeline:
//! - Unavailable -> Available starts a pipeline (from `Idle` only)
//! - Available -> Unavailable stops it (from `Streaming` only)
//!
//! Steady levels never re-issue start or stop, so a flapping or failing query
//! cannot cause restart storms. A failed query counts as Unavailable.

use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::devices::{InputState, SignalReading, SignalSource, SinkProbe};
use crate::streaming::{PipelineControl, StatsReporter, StopOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Streaming,
}

/// What one poll cycle did to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionAction {
    None,
    Start,
    Stop,
}

pub struct LifecycleController<S: SignalSource, R: SinkProbe, P: PipelineControl> {
    signal: S,
    probe: R,
    pipeline: P,
    reporter: Option<StatsReporter>,
    poll_interval: Duration,
    state: LifecycleState,
    previous: InputState,
}

impl<S: SignalSource, R: SinkProbe, P: PipelineControl> LifecycleController<S, R, P> {
    pub fn new(signal: S, probe: R, pipeline: P, poll_interval: Duration) -> Self {
        Self {
            signal,
            probe,
            pipeline,
            reporter: None,
            poll_interval,
            state: LifecycleState::Idle,
            previous: InputState::Unavailable,
        }
    }

    /// Report bitrate telemetry while streaming
    pub fn with_reporter(mut self, reporter: StatsReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    /// Run one poll cycle
    pub fn tick(&mut self) -> TransitionAction {
        self.reconcile();

        let reading = match self.signal.read() {
            Ok(reading) => reading,
            Err(e) => {
                log::warn!("Signal query failed, treating input as unavailable: {}", e);
                SignalReading::unavailable()
            }
        };
        let sink_ready = self.probe.is_sink_ready();
        let input = InputState::classify(&reading, sink_ready);

        if input.is_available() {
            log::debug!("Input detected: {}", reading);
        } else {
            log::debug!(
                "NO INPUT (signal: {}, sink ready: {})",
                reading.resolution_label(),
                sink_ready
            );
        }

        let action = match (self.previous, input, self.state) {
            (InputState::Unavailable, InputState::Available, LifecycleState::Idle) => {
                self.begin_streaming(&reading)
            }
            (InputState::Available, InputState::Unavailable, LifecycleState::Streaming) => {
                self.end_streaming()
            }
            _ => TransitionAction::None,
        };

        self.previous = input;
        action
    }

    /// Poll until `shutdown` fires, then stop any running pipeline
    pub fn run(&mut self, shutdown: &Receiver<()>) {
        log::info!("Supervisor running, polling every {:?}", self.poll_interval);

        loop {
            self.tick();

            crossbeam_channel::select! {
                recv(shutdown) -> _ => break,
                default(self.poll_interval) => {}
            }
        }

        log::info!("Supervisor shutting down");
        if self.state == LifecycleState::Streaming {
            self.end_streaming();
        }
    }

    /// Drop back to Idle if the pipeline we started never came up or died.
    /// `previous` is left alone, so the next start needs a fresh rising edge.
    fn reconcile(&mut self) {
        if self.state != LifecycleState::Streaming {
            return;
        }

        if let Some(reason) = self.pipeline.take_failure() {
            log::error!(
                "Pipeline is not running ({}); waiting for the next signal edge",
                reason
            );
            if let Some(reporter) = self.reporter.as_mut() {
                reporter.stop();
            }
            self.state = LifecycleState::Idle;
        }
    }

    fn begin_streaming(&mut self, reading: &SignalReading) -> TransitionAction {
        log::info!("Signal acquired: {} - starting pipeline", reading);

        match self.pipeline.start(reading) {
            Ok(()) => {
                self.state = LifecycleState::Streaming;
                if let (Some(reporter), Some(source)) =
                    (self.reporter.as_mut(), self.pipeline.stats_source())
                {
                    reporter.start(source);
                }
            }
            Err(e) => {
                log::error!("Failed to start pipeline: {}", e);
            }
        }

        TransitionAction::Start
    }

    fn end_streaming(&mut self) -> TransitionAction {
        log::info!("Signal or sink lost - stopping pipeline");

        if let Some(reporter) = self.reporter.as_mut() {
            reporter.stop();
        }

        match self.pipeline.stop() {
            StopOutcome::Graceful | StopOutcome::NotRunning => {}
            StopOutcome::Abandoned => {
                log::warn!("Pipeline stop was forced; continuing with a fresh worker next time");
            }
        }

        self.state = LifecycleState::Idle;
        TransitionAction::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::QueryError;
    use crate::streaming::{StatsSink, StatsSource, StreamStats, WorkerError};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Replays a list of signal results, then repeats the last one
    struct ScriptedSignal(VecDeque<Result<SignalReading, QueryError>>);

    impl ScriptedSignal {
        fn levels(levels: &[bool]) -> Self {
            Self(
                levels
                    .iter()
                    .map(|&up| {
                        Ok(if up {
                            SignalReading::available(1920, 1080, 60.0)
                        } else {
                            SignalReading::unavailable()
                        })
                    })
                    .collect(),
            )
        }
    }

    impl SignalSource for ScriptedSignal {
        fn read(&mut self) -> Result<SignalReading, QueryError> {
            if self.0.len() > 1 {
                self.0.pop_front().unwrap()
            } else {
                match self.0.front() {
                    Some(Ok(reading)) => Ok(*reading),
                    _ => Ok(SignalReading::unavailable()),
                }
            }
        }
    }

    struct ScriptedSink(Mutex<VecDeque<bool>>);

    impl ScriptedSink {
        fn always() -> Self {
            Self(Mutex::new(VecDeque::from([true])))
        }

        fn levels(levels: &[bool]) -> Self {
            Self(Mutex::new(levels.iter().copied().collect()))
        }
    }

    impl SinkProbe for ScriptedSink {
        fn is_sink_ready(&self) -> bool {
            let mut levels = self.0.lock();
            if levels.len() > 1 {
                levels.pop_front().unwrap_or(false)
            } else {
                levels.front().copied().unwrap_or(false)
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Start,
        Stop,
    }

    /// Records calls and checks that starts and stops strictly alternate
    #[derive(Default)]
    struct RecordingPipeline {
        calls: Vec<Call>,
        running: bool,
        fail_next_start: bool,
        pending_failure: Option<String>,
        stop_outcome: Option<StopOutcome>,
    }

    impl PipelineControl for RecordingPipeline {
        fn start(&mut self, _reading: &SignalReading) -> Result<(), WorkerError> {
            assert!(!self.running, "start issued while a pipeline is running");
            self.calls.push(Call::Start);
            if std::mem::take(&mut self.fail_next_start) {
                self.pending_failure = Some("Failed to create mpph265enc".into());
            }
            self.running = true;
            Ok(())
        }

        fn stop(&mut self) -> StopOutcome {
            assert!(self.running, "stop issued with no pipeline running");
            self.calls.push(Call::Stop);
            self.running = false;
            self.stop_outcome.unwrap_or(StopOutcome::Graceful)
        }

        fn take_failure(&mut self) -> Option<String> {
            let reason = self.pending_failure.take()?;
            self.running = false;
            Some(reason)
        }

        fn stats_source(&self) -> Option<Box<dyn StatsSource>> {
            Some(Box::new(FixedStats))
        }
    }

    struct FixedStats;

    impl StatsSource for FixedStats {
        fn poll_stats(&self) -> Result<Vec<StreamStats>, WorkerError> {
            Ok(vec![StreamStats::no_session("audio"), StreamStats::bitrate("video", 42)])
        }
    }

    fn controller(
        signal: ScriptedSignal,
        sink: ScriptedSink,
    ) -> LifecycleController<ScriptedSignal, ScriptedSink, RecordingPipeline> {
        LifecycleController::new(
            signal,
            sink,
            RecordingPipeline::default(),
            Duration::from_millis(10),
        )
    }

    fn run_ticks(
        ctrl: &mut LifecycleController<ScriptedSignal, ScriptedSink, RecordingPipeline>,
        n: usize,
    ) -> Vec<TransitionAction> {
        (0..n).map(|_| ctrl.tick()).collect()
    }

    #[test]
    fn reference_sequence_acts_only_on_edges() {
        let levels = [false, false, true, true, false, true];
        let mut ctrl = controller(ScriptedSignal::levels(&levels), ScriptedSink::always());

        let actions = run_ticks(&mut ctrl, levels.len());

        use TransitionAction::{None as N, Start, Stop};
        assert_eq!(actions, vec![N, N, Start, N, Stop, Start]);
        assert_eq!(ctrl.state(), LifecycleState::Streaming);
    }

    #[test]
    fn start_and_stop_counts_match_edges() {
        // Deterministic pseudo-random level sequences
        let mut seed: u64 = 0x5eed;
        for _ in 0..50 {
            let signal: Vec<bool> = (0..40)
                .map(|_| {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    (seed >> 33) % 3 != 0
                })
                .collect();
            let sink: Vec<bool> = (0..40)
                .map(|_| {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    (seed >> 33) % 4 != 0
                })
                .collect();

            let combined: Vec<bool> = signal.iter().zip(&sink).map(|(a, b)| *a && *b).collect();
            let mut previous = false;
            let (mut rising, mut falling) = (0, 0);
            for &level in &combined {
                if level && !previous {
                    rising += 1;
                }
                if !level && previous {
                    falling += 1;
                }
                previous = level;
            }

            let mut ctrl = controller(ScriptedSignal::levels(&signal), ScriptedSink::levels(&sink));
            run_ticks(&mut ctrl, combined.len());

            let calls = &ctrl.pipeline().calls;
            assert_eq!(calls.iter().filter(|c| **c == Call::Start).count(), rising);
            assert_eq!(calls.iter().filter(|c| **c == Call::Stop).count(), falling);
        }
    }

    #[test]
    fn steady_levels_never_repeat_actions() {
        let mut ctrl = controller(ScriptedSignal::levels(&[true]), ScriptedSink::always());
        let actions = run_ticks(&mut ctrl, 10);
        assert_eq!(actions[0], TransitionAction::Start);
        assert!(actions[1..].iter().all(|a| *a == TransitionAction::None));

        let mut ctrl = controller(ScriptedSignal::levels(&[false]), ScriptedSink::always());
        assert!(run_ticks(&mut ctrl, 10).iter().all(|a| *a == TransitionAction::None));
        assert!(ctrl.pipeline().calls.is_empty());
    }

    #[test]
    fn sink_loss_stops_pipeline() {
        let mut ctrl = controller(
            ScriptedSignal::levels(&[true]),
            ScriptedSink::levels(&[true, true, false, false]),
        );
        let actions = run_ticks(&mut ctrl, 4);
        assert_eq!(
            actions,
            vec![
                TransitionAction::Start,
                TransitionAction::None,
                TransitionAction::Stop,
                TransitionAction::None
            ]
        );
    }

    #[test]
    fn query_errors_count_as_unavailable() {
        let signal = ScriptedSignal(VecDeque::from([
            Ok(SignalReading::available(1920, 1080, 60.0)),
            Err(QueryError::Timeout(Duration::from_millis(1500))),
            Err(QueryError::Parse("missing 'Active height:'".into())),
            Ok(SignalReading::available(1920, 1080, 60.0)),
        ]));
        let mut ctrl = controller(signal, ScriptedSink::always());

        let actions = run_ticks(&mut ctrl, 4);
        assert_eq!(
            actions,
            vec![
                TransitionAction::Start,
                TransitionAction::Stop,
                TransitionAction::None,
                TransitionAction::Start
            ]
        );
    }

    #[test]
    fn failed_start_waits_for_next_rising_edge() {
        let mut ctrl = controller(
            ScriptedSignal::levels(&[true, true, true, false, true]),
            ScriptedSink::always(),
        );
        ctrl.pipeline.fail_next_start = true;

        assert_eq!(ctrl.tick(), TransitionAction::Start);
        // Build failure is picked up on the next cycle; still Available, no retry
        assert_eq!(ctrl.tick(), TransitionAction::None);
        assert_eq!(ctrl.state(), LifecycleState::Idle);
        assert_eq!(ctrl.tick(), TransitionAction::None);
        // Falling edge from Idle issues no stop
        assert_eq!(ctrl.tick(), TransitionAction::None);
        // Next rising edge retries
        assert_eq!(ctrl.tick(), TransitionAction::Start);
        assert_eq!(ctrl.pipeline().calls, vec![Call::Start, Call::Start]);
        assert_eq!(ctrl.state(), LifecycleState::Streaming);
    }

    #[test]
    fn forced_stop_still_allows_restart() {
        let mut ctrl = controller(
            ScriptedSignal::levels(&[true, false, true]),
            ScriptedSink::always(),
        );
        ctrl.pipeline.stop_outcome = Some(StopOutcome::Abandoned);

        let actions = run_ticks(&mut ctrl, 3);
        assert_eq!(
            actions,
            vec![TransitionAction::Start, TransitionAction::Stop, TransitionAction::Start]
        );
        assert_eq!(ctrl.state(), LifecycleState::Streaming);
    }

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<StreamStats>>>);

    impl StatsSink for Collect {
        fn record(&mut self, stats: &StreamStats) {
            self.0.lock().push(stats.clone());
        }
    }

    #[test]
    fn reporter_follows_streaming_state() {
        let collected = Collect::default();
        let reporter = StatsReporter::new(Duration::from_millis(10), Box::new(collected.clone()));
        let mut ctrl = controller(
            ScriptedSignal::levels(&[true, false]),
            ScriptedSink::always(),
        )
        .with_reporter(reporter);

        ctrl.tick();
        assert!(ctrl.reporter.as_ref().unwrap().is_active());
        std::thread::sleep(Duration::from_millis(80));

        ctrl.tick();
        assert!(!ctrl.reporter.as_ref().unwrap().is_active());

        let samples = collected.0.lock();
        assert!(!samples.is_empty());
        assert!(samples.contains(&StreamStats::no_session("audio")));
    }

    #[test]
    fn run_stops_pipeline_on_shutdown() {
        let mut ctrl = controller(ScriptedSignal::levels(&[true]), ScriptedSink::always());
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);

        let handle = std::thread::spawn(move || {
            ctrl.run(&shutdown_rx);
            ctrl
        });
        std::thread::sleep(Duration::from_millis(50));
        shutdown_tx.send(()).unwrap();

        let ctrl = handle.join().unwrap();
        assert_eq!(ctrl.state(), LifecycleState::Idle);
        assert_eq!(ctrl.pipeline().calls, vec![Call::Start, Call::Stop]);
    }
}
