//! On demand capture environments: one virtual display with one browser bound to it.
//!
//! Environments are leased from a fixed size [DisplayPool]. A lease maps to the display
//! `base_display + slot` and is returned once the environment has been torn down.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use common::config::{CaptureConfig, Geometry};
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::{
    fs,
    process::Command,
    select, spawn,
    sync::mpsc::{self, Receiver, Sender},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::process::{ManagedChild, ProcessError, run_helper};

pub const CAPTURE_EVENT_CAPACITY: usize = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("all {size} capture environments are in use")]
    PoolExhausted { size: usize },
    #[error("failed to start {name}: {message}")]
    Launch { name: String, message: String },
    #[error("failed to prepare the browser profile: {0}")]
    Profile(String),
    #[error("the capture environment was cancelled during bring-up")]
    Cancelled,
    #[error("the capture environment stopped without reporting")]
    Exited,
}

impl From<ProcessError> for CaptureError {
    fn from(err: ProcessError) -> Self {
        let name = match &err {
            ProcessError::Spawn { name, .. }
            | ProcessError::NoPid { name }
            | ProcessError::Signal { name, .. }
            | ProcessError::Wait { name, .. } => name.clone(),
        };

        Self::Launch {
            name,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    DisplayReady { display: u32 },
    BrowserReady,
    Failed(CaptureError),
}

pub trait CaptureEnvironment: Send + Sync {
    /// Leases an environment and starts bringing it up in the background.
    ///
    /// Progress is reported on the returned receiver. The environment is torn down once `cancel` fires.
    fn start(
        &self,
        cancel: CancellationToken,
        geometry: Geometry,
    ) -> Result<Receiver<CaptureEvent>, CaptureError>;
}

// -- Pool

pub struct DisplayPool {
    base_display: u32,
    slots: Vec<AtomicBool>,
}

impl DisplayPool {
    pub fn new(base_display: u32, size: usize) -> Arc<Self> {
        Arc::new(Self {
            base_display,
            slots: (0..size).map(|_| AtomicBool::new(false)).collect(),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn acquire(self: &Arc<Self>) -> Result<DisplayLease, CaptureError> {
        for (slot, in_use) in self.slots.iter().enumerate() {
            if in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(DisplayLease {
                    pool: self.clone(),
                    slot,
                });
            }
        }

        Err(CaptureError::PoolExhausted { size: self.size() })
    }
}

pub struct DisplayLease {
    pool: Arc<DisplayPool>,
    slot: usize,
}

impl DisplayLease {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn display(&self) -> u32 {
        self.pool.base_display + self.slot as u32
    }
}

impl Drop for DisplayLease {
    fn drop(&mut self) {
        self.pool.slots[self.slot].store(false, Ordering::Release);
        debug!("[Capture]: released display :{}", self.display());
    }
}

// -- Manager

pub struct CaptureManager {
    config: Arc<CaptureConfig>,
    pool: Arc<DisplayPool>,
}

impl CaptureManager {
    pub fn new(config: CaptureConfig) -> Self {
        let pool = DisplayPool::new(config.base_display, config.pool_size);

        Self {
            config: Arc::new(config),
            pool,
        }
    }
}

impl CaptureEnvironment for CaptureManager {
    fn start(
        &self,
        cancel: CancellationToken,
        geometry: Geometry,
    ) -> Result<Receiver<CaptureEvent>, CaptureError> {
        let lease = self.pool.acquire()?;
        let (sender, receiver) = mpsc::channel(CAPTURE_EVENT_CAPACITY);

        spawn(run_environment(
            self.config.clone(),
            lease,
            geometry,
            cancel,
            sender,
        ));

        Ok(receiver)
    }
}

#[derive(Default)]
struct Environment {
    display_server: Option<ManagedChild>,
    browser: Option<ManagedChild>,
    profile_dir: Option<PathBuf>,
}

async fn run_environment(
    config: Arc<CaptureConfig>,
    lease: DisplayLease,
    geometry: Geometry,
    cancel: CancellationToken,
    events: Sender<CaptureEvent>,
) {
    let display = lease.display();
    info!("[Capture]: starting environment on display :{display}");

    let mut environment = Environment::default();

    match bring_up(&config, &lease, geometry, &cancel, &events, &mut environment).await {
        Ok(()) => {
            cancel.cancelled().await;
        }
        Err(err) => {
            error!("[Capture]: environment on display :{display} failed: {err}");
            if events.send(CaptureEvent::Failed(err)).await.is_err() {
                debug!("[Capture]: nobody is listening for the failure on :{display}");
            }
        }
    }

    tear_down(&config, display, environment).await;
    info!("[Capture]: environment on display :{display} stopped");

    drop(lease);
}

async fn bring_up(
    config: &CaptureConfig,
    lease: &DisplayLease,
    geometry: Geometry,
    cancel: &CancellationToken,
    events: &Sender<CaptureEvent>,
    environment: &mut Environment,
) -> Result<(), CaptureError> {
    let display = lease.display();

    clear_stale_display(config, display).await;

    let mut command = Command::new(&config.display_server_path);
    command.args(display_server_args(display, geometry));
    environment.display_server = Some(ManagedChild::spawn(
        format!("display :{display}"),
        command,
        true,
    )?);

    settle(config.settle_delay, cancel).await?;
    emit(events, CaptureEvent::DisplayReady { display }).await?;

    let profile_dir = Path::new(&config.profile_root).join(Uuid::new_v4().to_string());
    fs::create_dir_all(&profile_dir)
        .await
        .map_err(|err| CaptureError::Profile(err.to_string()))?;
    environment.profile_dir = Some(profile_dir.clone());

    let debugging_port = debugging_port(config.remote_debugging_port, lease.slot())?;

    let mut command = Command::new(&config.browser_path);
    command
        .args(browser_args(
            geometry,
            &profile_dir,
            debugging_port,
            &config.startup_url,
        ))
        .env("DISPLAY", format!(":{display}"));
    environment.browser = Some(ManagedChild::spawn(
        format!("browser :{display}"),
        command,
        true,
    )?);

    emit(events, CaptureEvent::BrowserReady).await?;

    Ok(())
}

/// Every slot gets its own port so browsers of the same pool don't collide
fn debugging_port(base: Option<u16>, slot: usize) -> Result<Option<u16>, CaptureError> {
    let Some(base) = base else {
        return Ok(None);
    };

    u16::try_from(slot)
        .ok()
        .and_then(|slot| base.checked_add(slot))
        .map(Some)
        .ok_or_else(|| CaptureError::Launch {
            name: "browser".to_string(),
            message: format!("remote debugging port {base} + slot {slot} is out of range"),
        })
}

async fn settle(delay: Duration, cancel: &CancellationToken) -> Result<(), CaptureError> {
    select! {
        _ = cancel.cancelled() => Err(CaptureError::Cancelled),
        _ = sleep(delay) => Ok(()),
    }
}

async fn emit(events: &Sender<CaptureEvent>, event: CaptureEvent) -> Result<(), CaptureError> {
    events
        .send(event)
        .await
        .map_err(|_| CaptureError::Cancelled)
}

/// Graceful then forced shutdown of the browser, then the display server, then leftovers of the display.
async fn tear_down(config: &CaptureConfig, display: u32, environment: Environment) {
    let grace = config.grace_period;

    if let Some(mut browser) = environment.browser {
        if let Err(err) = browser.graceful_stop(Signal::SIGTERM, grace).await {
            warn!("[Capture]: failed to stop {}: {err}", browser.name());
        }
    }

    if let Some(mut display_server) = environment.display_server {
        if let Err(err) = display_server.graceful_stop(Signal::SIGINT, grace).await {
            warn!("[Capture]: failed to stop {}: {err}", display_server.name());
        }
    }

    let pattern = stale_display_pattern(&config.display_server_path, display);
    match run_helper("pkill", &["-9", "-f", &pattern]).await {
        Ok(true) => warn!("[Capture]: killed leftover display servers on :{display}"),
        Ok(false) => {}
        Err(err) => warn!("[Capture]: failed to run pkill: {err}"),
    }

    remove_file_if_exists(&lock_file_path(display)).await;

    if let Some(profile_dir) = environment.profile_dir {
        match fs::remove_dir_all(&profile_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!("[Capture]: failed to remove browser profile {profile_dir:?}: {err}")
            }
        }
    }
}

async fn clear_stale_display(config: &CaptureConfig, display: u32) {
    let pattern = stale_display_pattern(&config.display_server_path, display);

    match run_helper("pgrep", &["-f", &pattern]).await {
        Ok(true) => {
            warn!("[Capture]: found a stale display server on :{display}, killing it");

            if let Err(err) = run_helper("pkill", &["-9", "-f", &pattern]).await {
                warn!("[Capture]: failed to kill stale display server: {err}");
            }
            sleep(config.grace_period).await;

            remove_file_if_exists(&lock_file_path(display)).await;
        }
        Ok(false) => {}
        Err(err) => warn!("[Capture]: failed to look for stale display servers: {err}"),
    }
}

async fn remove_file_if_exists(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("[Capture]: removed {path:?}"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("[Capture]: failed to remove {path:?}: {err}"),
    }
}

pub fn lock_file_path(display: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/.X{display}-lock"))
}

/// `pgrep -f` pattern matching the display server of exactly this display
pub fn stale_display_pattern(display_server_path: &str, display: u32) -> String {
    let binary = Path::new(display_server_path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(display_server_path);

    format!("{binary} :{display}( |$)")
}

pub fn display_server_args(display: u32, geometry: Geometry) -> Vec<String> {
    vec![
        format!(":{display}"),
        "-screen".to_string(),
        "0".to_string(),
        format!(
            "{}x{}x{}",
            geometry.width, geometry.height, geometry.depth
        ),
    ]
}

pub fn browser_args(
    geometry: Geometry,
    profile_dir: &Path,
    remote_debugging_port: Option<u16>,
    startup_url: &str,
) -> Vec<String> {
    let mut args = vec![
        format!("--window-size={},{}", geometry.width, geometry.height),
        "--no-sandbox".to_string(),
        "--disable-gpu".to_string(),
        "--new-window".to_string(),
        format!("--user-data-dir={}", profile_dir.display()),
    ];
    if let Some(port) = remote_debugging_port {
        args.push(format!("--remote-debugging-port={port}"));
    }
    args.push(startup_url.to_string());

    args
}
