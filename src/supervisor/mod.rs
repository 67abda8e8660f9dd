// Supervisor - wires the probes, the pipeline worker and telemetry together

pub mod controller;

pub use controller::{LifecycleController, LifecycleState, TransitionAction};

use crossbeam_channel::Receiver;
use serde::Serialize;

use crate::config::{Config, TelemetryFormat};
use crate::devices::{
    DvTimingsReader, InputState, ProcessSinkProbe, SignalReading, SignalSource, SinkProbe,
};
use crate::gstreamer_init::{get_gstreamer_info, GStreamerInfo};
use crate::streaming::{
    GstEngine, JsonStatsSink, LogStatsSink, PipelineSpec, PipelineWorker, StatsReporter, StatsSink,
};

/// Build the production controller from config
pub fn build_controller(
    config: &Config,
) -> LifecycleController<DvTimingsReader, ProcessSinkProbe, PipelineWorker<GstEngine>> {
    let signal = DvTimingsReader::from_config(&config.device);
    let probe = ProcessSinkProbe::new(config.sink.process_name.clone());

    let worker = PipelineWorker::new(
        GstEngine::new(),
        PipelineSpec::from_config(config, None),
        config.timing.stop_grace(),
    )
    .with_follow_signal(config.pipeline.follow_signal)
    .with_stats_timeout(config.telemetry.query_timeout());

    let sink: Box<dyn StatsSink> = match config.telemetry.format {
        TelemetryFormat::Log => Box::new(LogStatsSink),
        TelemetryFormat::Json => Box::new(JsonStatsSink::stdout()),
    };
    let reporter = StatsReporter::new(config.telemetry.interval(), sink);

    LifecycleController::new(signal, probe, worker, config.timing.poll_interval())
        .with_reporter(reporter)
}

/// Run the supervisor until `shutdown` fires or its sender is dropped
pub fn run_supervisor(config: &Config, shutdown: Receiver<()>) -> anyhow::Result<()> {
    log::info!(
        "Watching {} {} for signal, publishing to {} when '{}' is running",
        config.device.query_program,
        config.device.query_args.join(" "),
        config.sink.rtsp_url,
        config.sink.process_name
    );

    let mut controller = build_controller(config);
    controller.run(&shutdown);

    let abandoned = controller.pipeline().abandoned_workers();
    if abandoned > 0 {
        log::warn!("{} pipeline worker(s) were abandoned during this run", abandoned);
    }
    Ok(())
}

/// One-shot view of everything the supervisor looks at
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub signal: SignalReading,
    /// Set when the device query itself failed
    pub signal_error: Option<String>,
    pub sink_process: String,
    pub sink_ready: bool,
    /// Whether the supervisor would be streaming right now
    pub input_available: bool,
    pub gstreamer: GStreamerInfo,
}

pub fn status_report(config: &Config) -> StatusReport {
    let mut signal = DvTimingsReader::from_config(&config.device);
    let (reading, signal_error) = match signal.read() {
        Ok(reading) => (reading, None),
        Err(e) => (SignalReading::unavailable(), Some(e.to_string())),
    };

    let probe = ProcessSinkProbe::new(config.sink.process_name.clone());
    let sink_ready = probe.is_sink_ready();

    StatusReport {
        signal: reading,
        signal_error,
        sink_process: config.sink.process_name.clone(),
        sink_ready,
        input_available: InputState::classify(&reading, sink_ready).is_available(),
        gstreamer: get_gstreamer_info(&PipelineSpec::from_config(config, Some(&reading))),
    }
}
