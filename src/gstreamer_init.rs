//! GStreamer initialization and plugin diagnostics
//!
//! Board images often ship the hardware encoder plugins next to the binary
//! instead of in the system plugin directory. If a `gstreamer-1.0` plugin
//! directory exists beside the executable it is added to `GST_PLUGIN_PATH`
//! before GStreamer is initialized.

use std::env;
use std::path::PathBuf;
use std::sync::Once;

use gstreamer as gst;
use serde::Serialize;

use crate::streaming::PipelineSpec;

static GSTREAMER_INIT: Once = Once::new();

/// Initialize GStreamer once per process. Safe to call repeatedly.
pub fn init_gstreamer_env() {
    GSTREAMER_INIT.call_once(|| {
        if let Some(plugin_dir) = bundled_plugin_dir() {
            let existing = env::var_os("GST_PLUGIN_PATH");
            let mut paths = vec![plugin_dir.clone()];
            if let Some(existing) = existing {
                paths.extend(env::split_paths(&existing));
            }
            match env::join_paths(paths) {
                Ok(joined) => {
                    env::set_var("GST_PLUGIN_PATH", &joined);
                    log::info!("Using bundled GStreamer plugins at {}", plugin_dir.display());
                }
                Err(e) => log::warn!("Could not extend GST_PLUGIN_PATH: {}", e),
            }
        }

        match gst::init() {
            Ok(_) => {
                log::info!("GStreamer initialized successfully");
                log_gstreamer_version();
            }
            Err(e) => {
                log::error!("Failed to initialize GStreamer: {}", e);
                log::error!("Pipelines cannot be built until GStreamer is installed");
            }
        }
    });
}

fn bundled_plugin_dir() -> Option<PathBuf> {
    let exe_path = env::current_exe().ok()?;
    let dir = exe_path.parent()?.join("gstreamer-1.0");
    if dir.is_dir() {
        Some(dir)
    } else {
        log::debug!("No bundled GStreamer plugins at {:?}", dir);
        None
    }
}

fn log_gstreamer_version() {
    let (major, minor, micro, nano) = gst::version();
    let nano_str = match nano {
        0 => String::new(),
        1 => " (CVS)".to_string(),
        2 => " (prerelease)".to_string(),
        _ => format!(" (nano: {})", nano),
    };
    log::info!("GStreamer version: {}.{}.{}{}", major, minor, micro, nano_str);
}

/// Check if GStreamer can be initialized
pub fn is_gstreamer_available() -> bool {
    init_gstreamer_env();
    gst::init().is_ok()
}

/// Element factories a pipeline built from `spec` will ask for
pub fn required_elements(spec: &PipelineSpec) -> Vec<String> {
    let mut elements: Vec<String> = ["v4l2src", "capsfilter", "queue", "rtspclientsink"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    elements.push(spec.encoder.element.clone());
    elements.push(spec.encoder.parser.clone());
    if spec.audio.is_some() {
        elements.extend(["alsasrc", "opusenc", "opusparse"].iter().map(|s| s.to_string()));
    }
    elements
}

/// Diagnostics for the `status` command
#[derive(Debug, Clone, Serialize)]
pub struct GStreamerInfo {
    pub available: bool,
    pub version: Option<String>,
    /// Required element factories that are not installed
    pub missing_elements: Vec<String>,
}

pub fn get_gstreamer_info(spec: &PipelineSpec) -> GStreamerInfo {
    if !is_gstreamer_available() {
        return GStreamerInfo {
            available: false,
            version: None,
            missing_elements: required_elements(spec),
        };
    }

    let (major, minor, micro, _) = gst::version();
    let missing_elements = required_elements(spec)
        .into_iter()
        .filter(|name| gst::ElementFactory::find(name).is_none())
        .collect();

    GStreamerInfo {
        available: true,
        version: Some(format!("{}.{}.{}", major, minor, micro)),
        missing_elements,
    }
}
