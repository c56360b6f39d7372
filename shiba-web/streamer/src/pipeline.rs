use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

use bytes::Bytes;
use common::config::{Geometry, PipelineConfig};
use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;
use log::{debug, error, warn};
use thiserror::Error;
use futures::StreamExt;
use tokio::{select, spawn, sync::oneshot};
use tokio_util::sync::CancellationToken;

const AUDIO_FRAME_DURATION: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    Video,
    Audio,
}

impl SinkKind {
    pub fn element_name(&self) -> &'static str {
        match self {
            Self::Video => "videoSink",
            Self::Audio => "audioSink",
        }
    }
}

impl Display for SinkKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Playing,
    Null,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("failed to initialize gstreamer: {0}")]
    Init(String),
    #[error("failed to build pipeline: {0}")]
    Build(String),
    #[error("sink \"{0}\" was not found in the pipeline")]
    SinkNotFound(&'static str),
    #[error("failed to change pipeline state to {state:?}: {message}")]
    State {
        state: PipelineState,
        message: String,
    },
    #[error("pipeline error from {element}: {message}")]
    Runtime { element: String, message: String },
}

/// A pull based source of encoded samples.
pub trait SampleSink: Send {
    /// Blocks until the next sample is available, `None` once the stream ended.
    fn pull(&mut self) -> Option<MediaSample>;
}

pub struct StreamSinks {
    pub video: Box<dyn SampleSink>,
    pub audio: Box<dyn SampleSink>,
}

impl fmt::Debug for StreamSinks {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSinks").finish_non_exhaustive()
    }
}

pub trait MediaPipeline: Send + Sync {
    fn set_state(&self, state: PipelineState) -> Result<(), PipelineError>;

    fn sink(&self, kind: SinkKind) -> Result<Box<dyn SampleSink>, PipelineError>;

    /// Drains the pipeline bus until `cancel` fires.
    /// The first error stops the pipeline and resolves the returned receiver.
    fn watch_errors(&self, cancel: CancellationToken) -> oneshot::Receiver<PipelineError>;
}

pub trait PipelineBuilder: Send + Sync {
    fn build(&self, display: u32, geometry: Geometry)
    -> Result<Box<dyn MediaPipeline>, PipelineError>;
}

pub fn pipeline_description(display: u32, geometry: Geometry, config: &PipelineConfig) -> String {
    let Geometry {
        width, height, fps, ..
    } = geometry;

    format!(
        "ximagesrc use-damage=0 display-name=\":{display}\" ! queue ! videoconvert ! video/x-raw,format=I420 ! queue ! \
         videoscale ! video/x-raw,width={width},height={height},framerate={fps}/1 ! queue ! \
         x264enc bitrate={bitrate} tune=zerolatency speed-preset=veryfast key-int-max={key_int_max} ! queue ! \
         video/x-h264,stream-format=byte-stream ! queue ! appsink name={video_sink} sync=false \
         {audio_source} ! queue ! audioconvert ! audioresample ! queue ! opusenc ! queue ! \
         appsink name={audio_sink} sync=false",
        bitrate = config.video_bitrate,
        key_int_max = config.key_int_max,
        audio_source = config.audio_source,
        video_sink = SinkKind::Video.element_name(),
        audio_sink = SinkKind::Audio.element_name(),
    )
}

// -- GStreamer

pub struct GstPipelineBuilder {
    config: PipelineConfig,
}

impl GstPipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }
}

impl PipelineBuilder for GstPipelineBuilder {
    fn build(
        &self,
        display: u32,
        geometry: Geometry,
    ) -> Result<Box<dyn MediaPipeline>, PipelineError> {
        gst::init().map_err(|err| PipelineError::Init(err.to_string()))?;

        let description = pipeline_description(display, geometry, &self.config);
        debug!("[Pipeline]: launching {description}");

        let pipeline = gst::parse::launch(&description)
            .map_err(|err| PipelineError::Build(err.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError::Build("the description is not a pipeline".to_string()))?;

        Ok(Box::new(GstMediaPipeline {
            pipeline,
            video_frame_duration: Duration::from_secs(1) / geometry.fps.max(1),
        }))
    }
}

struct GstMediaPipeline {
    pipeline: gst::Pipeline,
    video_frame_duration: Duration,
}

impl MediaPipeline for GstMediaPipeline {
    fn set_state(&self, state: PipelineState) -> Result<(), PipelineError> {
        let target = match state {
            PipelineState::Playing => gst::State::Playing,
            PipelineState::Null => gst::State::Null,
        };

        self.pipeline
            .set_state(target)
            .map(|_| ())
            .map_err(|err| PipelineError::State {
                state,
                message: err.to_string(),
            })
    }

    fn sink(&self, kind: SinkKind) -> Result<Box<dyn SampleSink>, PipelineError> {
        let name = kind.element_name();

        let sink = self
            .pipeline
            .by_name(name)
            .ok_or(PipelineError::SinkNotFound(name))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| PipelineError::SinkNotFound(name))?;

        let fallback_duration = match kind {
            SinkKind::Video => self.video_frame_duration,
            SinkKind::Audio => AUDIO_FRAME_DURATION,
        };

        Ok(Box::new(GstSampleSink {
            sink,
            fallback_duration,
        }))
    }

    fn watch_errors(&self, cancel: CancellationToken) -> oneshot::Receiver<PipelineError> {
        let (sender, receiver) = oneshot::channel();

        let Some(bus) = self.pipeline.bus() else {
            warn!("[Pipeline]: pipeline has no bus, errors won't be reported");
            return receiver;
        };

        let pipeline = self.pipeline.clone();
        let mut messages = bus.stream();

        spawn(async move {
            loop {
                let message = select! {
                    _ = cancel.cancelled() => break,
                    message = messages.next() => message,
                };
                let Some(message) = message else {
                    break;
                };

                match message.view() {
                    gst::MessageView::Error(err) => {
                        let error = PipelineError::Runtime {
                            element: err
                                .src()
                                .map(|src| src.path_string().to_string())
                                .unwrap_or_default(),
                            message: format!("{} ({:?})", err.error(), err.debug()),
                        };
                        error!("[Pipeline]: {error}");

                        if let Err(err) = pipeline.set_state(gst::State::Null) {
                            warn!("[Pipeline]: failed to stop pipeline after error: {err}");
                        }

                        let _ = sender.send(error);
                        return;
                    }
                    gst::MessageView::Warning(warning) => {
                        warn!(
                            "[Pipeline]: warning from {:?}: {}",
                            warning.src().map(|src| src.path_string()),
                            warning.error()
                        );
                    }
                    gst::MessageView::Eos(..) => debug!("[Pipeline]: end of stream"),
                    _ => {}
                }
            }

            debug!("[Pipeline]: bus watcher stopped");
        });

        receiver
    }
}

struct GstSampleSink {
    sink: gst_app::AppSink,
    fallback_duration: Duration,
}

impl SampleSink for GstSampleSink {
    fn pull(&mut self) -> Option<MediaSample> {
        let sample = self.sink.pull_sample().ok()?;
        let buffer = sample.buffer()?;
        let map = buffer.map_readable().ok()?;

        if map.is_empty() {
            return None;
        }

        let duration = buffer
            .duration()
            .map(|duration| Duration::from_nanos(duration.nseconds()))
            .filter(|duration| !duration.is_zero())
            .unwrap_or(self.fallback_duration);

        Some(MediaSample {
            data: Bytes::copy_from_slice(map.as_slice()),
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_binds_display_and_geometry() {
        let description = pipeline_description(
            101,
            Geometry {
                width: 1280,
                height: 720,
                depth: 24,
                fps: 30,
            },
            &PipelineConfig::default(),
        );

        assert!(description.contains("display-name=\":101\""));
        assert!(description.contains("width=1280,height=720,framerate=30/1"));
        assert!(description.contains("tune=zerolatency"));
        assert!(description.contains("appsink name=videoSink"));
        assert!(description.contains("pulsesrc ! queue ! audioconvert"));
        assert!(description.contains("appsink name=audioSink"));
    }

    #[test]
    fn test_description_uses_config() {
        let config = PipelineConfig {
            video_bitrate: 2500,
            key_int_max: 60,
            audio_source: "audiotestsrc".to_string(),
        };

        let description = pipeline_description(99, Geometry::default(), &config);

        assert!(description.contains("bitrate=2500"));
        assert!(description.contains("key-int-max=60"));
        assert!(description.contains("audiotestsrc ! queue"));
    }

    fn test_pipeline() -> GstMediaPipeline {
        gst::init().expect("gstreamer");

        let pipeline = gst::parse::launch("fakesrc num-buffers=1 ! fakesink")
            .expect("launch")
            .downcast::<gst::Pipeline>()
            .expect("pipeline");

        GstMediaPipeline {
            pipeline,
            video_frame_duration: Duration::from_millis(16),
        }
    }

    #[tokio::test]
    async fn test_bus_error_stops_the_pipeline() {
        let media = test_pipeline();
        let errors = media.watch_errors(CancellationToken::new());

        let message = gst::message::Error::builder(gst::CoreError::Failed, "encoder crashed")
            .src(&media.pipeline)
            .build();
        media
            .pipeline
            .bus()
            .expect("bus")
            .post(message)
            .expect("post");

        let error = tokio::time::timeout(Duration::from_secs(5), errors)
            .await
            .expect("error in time")
            .expect("error reported");
        match error {
            PipelineError::Runtime { message, .. } => {
                assert!(message.contains("encoder crashed"), "{message}")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(media.pipeline.current_state(), gst::State::Null);
    }

    #[tokio::test]
    async fn test_bus_watcher_stops_on_cancel() {
        let media = test_pipeline();
        let cancel = CancellationToken::new();
        let errors = media.watch_errors(cancel.clone());

        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), errors)
            .await
            .expect("watcher stopped");
        assert!(result.is_err());
    }
}
