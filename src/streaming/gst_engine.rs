// GStreamer publish pipeline
//
// video: v4l2src -> capsfilter -> queue -> <encoder> -> queue -> <parser> -> queue -> rtspclientsink
// audio: alsasrc -> capsfilter -> queue -> opusenc -> opusparse -> rtspclientsink
//
// rtspclientsink creates one rtpsession per published stream. Bitrate comes
// from the session's `stats` structure once the RECORD handshake is done.

use gstreamer as gst;
use gstreamer::prelude::*;

use super::engine::fps_to_fraction;
use super::{PipelineEngine, PipelineError, PipelineEvent, PipelineSpec, StreamReading, StreamStats};

/// Session element names as assigned by rtspclientsink, per stream
const AUDIO_VIDEO_SESSIONS: &[(&str, &str)] = &[("audio", "rtpsession0"), ("video", "rtpsession1")];
const VIDEO_ONLY_SESSIONS: &[(&str, &str)] = &[("video", "rtpsession0")];

/// Engine backed by a GStreamer pipeline
#[derive(Debug, Default)]
pub struct GstEngine;

impl GstEngine {
    pub fn new() -> Self {
        Self
    }
}

/// A built GStreamer pipeline. Set to NULL when dropped.
pub struct GstPipeline {
    pipeline: gst::Pipeline,
    bus: Option<gst::Bus>,
    sessions: &'static [(&'static str, &'static str)],
}

impl Drop for GstPipeline {
    fn drop(&mut self) {
        // Covers handles dropped without a deactivate (build errors, panics)
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn make_element(factory: &str, name: &str) -> Result<gst::Element, PipelineError> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|e| PipelineError::Build(format!("Failed to create {}: {}", factory, e)))
}

/// Set a property from its string form, converting to whatever type the
/// property declares. Unknown properties and unparseable values are errors
/// rather than panics.
fn set_property_str(element: &gst::Element, name: &str, value: &str) -> Result<(), PipelineError> {
    let pspec = element.find_property(name).ok_or_else(|| {
        PipelineError::Build(format!("{} has no property '{}'", element.name(), name))
    })?;

    let parsed = <gst::glib::Value as GstValueExt>::deserialize(value, pspec.value_type())
        .map_err(|_| {
            PipelineError::Build(format!(
                "Invalid value '{}' for {}::{}",
                value,
                element.name(),
                name
            ))
        })?;

    element.set_property_from_value(name, &parsed);
    Ok(())
}

fn add_and_link(pipeline: &gst::Pipeline, chain: &[&gst::Element]) -> Result<(), PipelineError> {
    for element in chain {
        if element.parent().is_none() {
            pipeline
                .add(*element)
                .map_err(|e| PipelineError::Build(format!("Failed to add {}: {}", element.name(), e)))?;
        }
    }
    gst::Element::link_many(chain.iter().copied())
        .map_err(|e| PipelineError::Build(format!("Failed to link elements: {}", e)))
}

fn build_video_branch(
    pipeline: &gst::Pipeline,
    spec: &PipelineSpec,
    sink: &gst::Element,
) -> Result<(), PipelineError> {
    let source = make_element("v4l2src", "v4l2src")?;
    if let Some(device) = &spec.video_device {
        set_property_str(&source, "device", device)?;
    }

    let (numer, denom) = fps_to_fraction(spec.fps);
    let caps = gst::Caps::builder("video/x-raw")
        .field("width", spec.width as i32)
        .field("height", spec.height as i32)
        .field("framerate", gst::Fraction::new(numer, denom))
        .field("format", spec.pixel_format.as_str())
        .build();
    let filter = make_element("capsfilter", "video_filter")?;
    filter.set_property("caps", &caps);

    let encoder = make_element(&spec.encoder.element, "video_encoder")?;
    for (name, value) in &spec.encoder.properties {
        set_property_str(&encoder, name, value)?;
    }
    let parser = make_element(&spec.encoder.parser, "video_parser")?;

    let queue1 = make_element("queue", "queue1")?;
    let queue2 = make_element("queue", "queue2")?;
    let queue3 = make_element("queue", "queue3")?;

    add_and_link(
        pipeline,
        &[&source, &filter, &queue1, &encoder, &queue2, &parser, &queue3, sink],
    )
}

fn build_audio_branch(
    pipeline: &gst::Pipeline,
    audio: &crate::config::AudioSettings,
    sink: &gst::Element,
) -> Result<(), PipelineError> {
    let source = make_element("alsasrc", "alsasrc")?;
    set_property_str(&source, "device", &audio.device)?;

    let caps = gst::Caps::builder("audio/x-raw")
        .field("rate", audio.sample_rate as i32)
        .field("channels", audio.channels as i32)
        .build();
    let filter = make_element("capsfilter", "audio_filter")?;
    filter.set_property("caps", &caps);

    let queue = make_element("queue", "queue4")?;
    let encoder = make_element("opusenc", "opusenc")?;
    set_property_str(&encoder, "bitrate", &audio.opus_bitrate.to_string())?;
    let parser = make_element("opusparse", "opusparse")?;

    add_and_link(pipeline, &[&source, &filter, &queue, &encoder, &parser, sink])
}

/// Highest `bitrate` across the session's `source-stats` entries.
///
/// A stats structure without `source-stats` means nothing has been sent yet
/// and reads as zero.
fn max_source_bitrate(stats: &gst::StructureRef) -> StreamReading {
    if !stats.has_field("source-stats") {
        return StreamReading::Bitrate { bitrate_bps: 0 };
    }

    match stats.get::<gst::glib::ValueArray>("source-stats") {
        Ok(sources) => {
            let bitrate_bps = sources
                .iter()
                .filter_map(|value| value.get::<gst::Structure>().ok())
                .filter_map(|source| source.get::<u64>("bitrate").ok())
                .max()
                .unwrap_or(0);
            StreamReading::Bitrate { bitrate_bps }
        }
        Err(e) => StreamReading::Failed {
            error: format!("unreadable source-stats: {}", e),
        },
    }
}

fn session_reading(pipeline: &gst::Pipeline, session_name: &str) -> StreamReading {
    let Some(session) = pipeline.by_name(session_name) else {
        return StreamReading::NoSession;
    };

    if session.find_property("stats").is_none() {
        return StreamReading::Failed {
            error: format!("{} has no stats property", session_name),
        };
    }

    match session.property_value("stats").get::<Option<gst::Structure>>() {
        Ok(Some(stats)) => max_source_bitrate(&stats),
        Ok(None) => StreamReading::NoSession,
        Err(e) => StreamReading::Failed {
            error: format!("unexpected stats type: {}", e),
        },
    }
}

impl PipelineEngine for GstEngine {
    type Handle = GstPipeline;

    fn build(&self, spec: &PipelineSpec) -> Result<GstPipeline, PipelineError> {
        crate::gstreamer_init::init_gstreamer_env();
        gst::init().map_err(|e| PipelineError::Build(format!("GStreamer unavailable: {}", e)))?;

        let pipeline = gst::Pipeline::builder().name("signalcast").build();

        let sink = make_element("rtspclientsink", "s")?;
        set_property_str(&sink, "location", &spec.rtsp_url)?;
        set_property_str(&sink, "latency", &spec.latency_ms.to_string())?;

        build_video_branch(&pipeline, spec, &sink)?;

        let sessions = match &spec.audio {
            Some(audio) => {
                build_audio_branch(&pipeline, audio, &sink)?;
                AUDIO_VIDEO_SESSIONS
            }
            None => VIDEO_ONLY_SESSIONS,
        };

        log::info!(
            "Built pipeline: {}x{} @ {:.2}fps via {} -> {}{}",
            spec.width,
            spec.height,
            spec.fps,
            spec.encoder.element,
            spec.rtsp_url,
            if spec.audio.is_some() { " (+opus audio)" } else { "" }
        );

        let bus = pipeline.bus();
        Ok(GstPipeline {
            pipeline,
            bus,
            sessions,
        })
    }

    fn activate(&self, handle: &GstPipeline) -> Result<(), PipelineError> {
        handle
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| PipelineError::StateChange(format!("PLAYING: {}", e)))?;
        Ok(())
    }

    fn deactivate(&self, handle: &GstPipeline) -> Result<(), PipelineError> {
        handle
            .pipeline
            .set_state(gst::State::Null)
            .map_err(|e| PipelineError::StateChange(format!("NULL: {}", e)))?;
        Ok(())
    }

    fn query_stats(&self, handle: &GstPipeline) -> Vec<StreamStats> {
        handle
            .sessions
            .iter()
            .map(|(stream, session_name)| StreamStats {
                stream: stream.to_string(),
                reading: session_reading(&handle.pipeline, session_name),
            })
            .collect()
    }

    fn poll_event(&self, handle: &GstPipeline) -> Option<PipelineEvent> {
        let bus = handle.bus.as_ref()?;
        let msg = bus.pop_filtered(&[
            gst::MessageType::Error,
            gst::MessageType::Warning,
            gst::MessageType::Eos,
        ])?;

        match msg.view() {
            gst::MessageView::Error(err) => {
                let src = err.src().map(|s| s.name().to_string()).unwrap_or_default();
                Some(PipelineEvent::Error(format!(
                    "'{}': {} (debug: {:?})",
                    src,
                    err.error(),
                    err.debug()
                )))
            }
            gst::MessageView::Warning(warn) => {
                let src = warn.src().map(|s| s.name().to_string()).unwrap_or_default();
                Some(PipelineEvent::Warning(format!("'{}': {}", src, warn.error())))
            }
            gst::MessageView::Eos(..) => Some(PipelineEvent::EndOfStream),
            _ => None,
        }
    }
}
