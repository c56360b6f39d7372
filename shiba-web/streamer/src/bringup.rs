//! Sequencing of capture environment and pipeline startup.
//!
//! The sequence is modeled as [BringupState] plus the pure [transition] function. [Bringup]
//! drives it with events from the capture environment, the pipeline builder, the deadline
//! and the session's cancellation token, and reports [Milestone]s to its caller.

use std::{collections::VecDeque, future::pending, sync::Arc, time::Duration};

use common::config::Geometry;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::{
    select, spawn,
    sync::{
        mpsc::{self, Receiver, Sender},
        oneshot,
    },
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

use crate::{
    capture::{CaptureEnvironment, CaptureError, CaptureEvent},
    pipeline::{
        MediaPipeline, PipelineBuilder, PipelineError, PipelineState, SinkKind, StreamSinks,
    },
};

pub const MILESTONE_CAPACITY: usize = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BringupError {
    #[error("capture environment failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("media pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("bring-up didn't complete within {0:?}")]
    Timeout(Duration),
    #[error("bring-up was cancelled")]
    Cancelled,
    #[error("unexpected {event} while {state}")]
    OutOfOrder {
        state: &'static str,
        event: &'static str,
    },
    #[error("bring-up stopped without reporting a result")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringupState {
    Idle,
    AwaitingDisplay,
    AwaitingBrowser { display: u32 },
    AwaitingPipeline,
    Streaming,
    Stopped,
}

impl BringupState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingDisplay => "awaiting display",
            Self::AwaitingBrowser { .. } => "awaiting browser",
            Self::AwaitingPipeline => "awaiting pipeline",
            Self::Streaming => "streaming",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BringupEvent {
    Start,
    DisplayReady { display: u32 },
    BrowserReady,
    PipelineBuilt,
    Failed(BringupError),
    TimedOut(Duration),
    Cancelled,
}

impl BringupEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::DisplayReady { .. } => "display ready",
            Self::BrowserReady => "browser ready",
            Self::PipelineBuilt => "pipeline built",
            Self::Failed(_) => "failure",
            Self::TimedOut(_) => "timeout",
            Self::Cancelled => "cancellation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    LaunchCapture,
    ReportDisplayReady,
    /// Reports the browser milestone, then builds the pipeline for the display
    BuildPipeline { display: u32 },
    Play,
    StopPipeline,
    Abort(BringupError),
    Nothing,
}

pub fn transition(state: BringupState, event: BringupEvent) -> (BringupState, Action) {
    use BringupEvent as E;
    use BringupState as S;

    match (state, event) {
        (S::Stopped, _) => (S::Stopped, Action::Nothing),

        (S::Idle, E::Start) => (S::AwaitingDisplay, Action::LaunchCapture),
        (S::AwaitingDisplay, E::DisplayReady { display }) => {
            (S::AwaitingBrowser { display }, Action::ReportDisplayReady)
        }
        (S::AwaitingBrowser { display }, E::BrowserReady) => {
            (S::AwaitingPipeline, Action::BuildPipeline { display })
        }
        (S::AwaitingPipeline, E::PipelineBuilt) => (S::Streaming, Action::Play),

        (S::Streaming, E::Cancelled) => (S::Stopped, Action::StopPipeline),
        (_, E::Cancelled) => (S::Stopped, Action::Abort(BringupError::Cancelled)),

        // The deadline only bounds the bring-up
        (S::Streaming, E::TimedOut(_)) => (S::Streaming, Action::Nothing),
        (_, E::TimedOut(timeout)) => (S::Stopped, Action::Abort(BringupError::Timeout(timeout))),

        (_, E::Failed(err)) => (S::Stopped, Action::Abort(err)),

        (state, event) => (
            S::Stopped,
            Action::Abort(BringupError::OutOfOrder {
                state: state.name(),
                event: event.name(),
            }),
        ),
    }
}

#[derive(Debug)]
pub enum Milestone {
    DisplayReady,
    BrowserReady,
    PipelineReady(StreamSinks),
}

pub struct BringupHandle {
    /// Closed after [Milestone::PipelineReady] or the first error
    pub milestones: Receiver<Result<Milestone, BringupError>>,
    /// Resolves once the session is over, either by cancellation or by an error
    pub task: JoinHandle<Result<(), BringupError>>,
}

#[derive(Clone)]
pub struct Bringup {
    capture: Arc<dyn CaptureEnvironment>,
    pipelines: Arc<dyn PipelineBuilder>,
    geometry: Geometry,
    timeout: Duration,
}

impl Bringup {
    pub fn new(
        capture: Arc<dyn CaptureEnvironment>,
        pipelines: Arc<dyn PipelineBuilder>,
        geometry: Geometry,
        timeout: Duration,
    ) -> Self {
        Self {
            capture,
            pipelines,
            geometry,
            timeout,
        }
    }

    /// Starts bringing up a stream, everything started is stopped once `cancel` fires.
    pub fn start(&self, label: impl Into<String>, cancel: CancellationToken) -> BringupHandle {
        let (sender, milestones) = mpsc::channel(MILESTONE_CAPACITY);

        let runner = Runner {
            label: label.into(),
            bringup: self.clone(),
            environment: cancel.child_token(),
            cancel,
            milestones: Some(sender),
            state: BringupState::Idle,
            capture_events: None,
            pipeline: None,
            pipeline_errors: None,
        };

        BringupHandle {
            milestones,
            task: spawn(runner.run()),
        }
    }
}

struct Runner {
    label: String,
    bringup: Bringup,
    cancel: CancellationToken,
    /// Owns the capture environment and the bus watcher
    environment: CancellationToken,
    milestones: Option<Sender<Result<Milestone, BringupError>>>,
    state: BringupState,
    capture_events: Option<Receiver<CaptureEvent>>,
    pipeline: Option<Box<dyn MediaPipeline>>,
    pipeline_errors: Option<oneshot::Receiver<PipelineError>>,
}

impl Runner {
    async fn run(mut self) -> Result<(), BringupError> {
        let deadline = Instant::now() + self.bringup.timeout;
        let mut pending_events = VecDeque::from([BringupEvent::Start]);

        loop {
            let event = match pending_events.pop_front() {
                Some(event) => event,
                None => self.next_event(deadline).await,
            };

            let (state, action) = transition(self.state, event);
            if state != self.state {
                debug!(
                    "[Bringup]: {}: {} -> {}",
                    self.label,
                    self.state.name(),
                    state.name()
                );
            }
            self.state = state;

            match action {
                Action::LaunchCapture => {
                    match self
                        .bringup
                        .capture
                        .start(self.environment.clone(), self.bringup.geometry)
                    {
                        Ok(events) => self.capture_events = Some(events),
                        Err(err) => pending_events.push_back(BringupEvent::Failed(err.into())),
                    }
                }
                Action::ReportDisplayReady => {
                    self.report(Ok(Milestone::DisplayReady)).await;
                }
                Action::BuildPipeline { display } => {
                    self.report(Ok(Milestone::BrowserReady)).await;

                    match self.bringup.pipelines.build(display, self.bringup.geometry) {
                        Ok(pipeline) => {
                            self.pipeline = Some(pipeline);
                            pending_events.push_back(BringupEvent::PipelineBuilt);
                        }
                        Err(err) => pending_events.push_back(BringupEvent::Failed(err.into())),
                    }
                }
                Action::Play => match self.play() {
                    Ok(sinks) => {
                        info!("[Bringup]: {}: pipeline is playing", self.label);

                        self.report(Ok(Milestone::PipelineReady(sinks))).await;
                        // The caller only waits for the bring-up
                        self.milestones = None;
                    }
                    Err(err) => pending_events.push_back(BringupEvent::Failed(err.into())),
                },
                Action::StopPipeline => {
                    self.stop_pipeline();
                    info!("[Bringup]: {}: stopped", self.label);

                    return Ok(());
                }
                Action::Abort(err) => {
                    warn!("[Bringup]: {}: aborting: {err}", self.label);

                    self.stop_pipeline();
                    self.environment.cancel();
                    self.report(Err(err.clone())).await;

                    return Err(err);
                }
                Action::Nothing => {}
            }
        }
    }

    async fn next_event(&mut self, deadline: Instant) -> BringupEvent {
        if self.state == BringupState::Streaming {
            return select! {
                biased;
                _ = self.cancel.cancelled() => BringupEvent::Cancelled,
                err = next_pipeline_error(&mut self.pipeline_errors) => BringupEvent::Failed(err.into()),
            };
        }

        select! {
            biased;
            _ = self.cancel.cancelled() => BringupEvent::Cancelled,
            _ = sleep_until(deadline) => BringupEvent::TimedOut(self.bringup.timeout),
            event = next_capture_event(&mut self.capture_events) => event,
        }
    }

    fn play(&mut self) -> Result<StreamSinks, PipelineError> {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return Err(PipelineError::Build(
                "no pipeline was built before playing".to_string(),
            ));
        };

        let sinks = StreamSinks {
            video: pipeline.sink(SinkKind::Video)?,
            audio: pipeline.sink(SinkKind::Audio)?,
        };

        self.pipeline_errors = Some(pipeline.watch_errors(self.environment.child_token()));
        pipeline.set_state(PipelineState::Playing)?;

        Ok(sinks)
    }

    fn stop_pipeline(&mut self) {
        if let Some(pipeline) = self.pipeline.take()
            && let Err(err) = pipeline.set_state(PipelineState::Null)
        {
            warn!("[Bringup]: {}: failed to stop pipeline: {err}", self.label);
        }
    }

    async fn report(&mut self, milestone: Result<Milestone, BringupError>) {
        let Some(sender) = self.milestones.as_ref() else {
            return;
        };

        if sender.send(milestone).await.is_err() {
            debug!("[Bringup]: {}: nobody is waiting for milestones", self.label);
            self.milestones = None;
        }
    }
}

async fn next_capture_event(events: &mut Option<Receiver<CaptureEvent>>) -> BringupEvent {
    let Some(receiver) = events.as_mut() else {
        return pending().await;
    };

    match receiver.recv().await {
        Some(CaptureEvent::DisplayReady { display }) => BringupEvent::DisplayReady { display },
        Some(CaptureEvent::BrowserReady) => BringupEvent::BrowserReady,
        Some(CaptureEvent::Failed(err)) => BringupEvent::Failed(err.into()),
        None => BringupEvent::Failed(CaptureError::Exited.into()),
    }
}

async fn next_pipeline_error(
    errors: &mut Option<oneshot::Receiver<PipelineError>>,
) -> PipelineError {
    if let Some(receiver) = errors.as_mut() {
        if let Ok(err) = receiver.await {
            return err;
        }
        // The watcher stopped without an error
        *errors = None;
    }

    pending().await
}
