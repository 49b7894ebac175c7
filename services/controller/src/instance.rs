//! Instance supervisor.
//!
//! An `AppInstance` owns one version of the application:
//! - materializes the version's source tree (`Pulling`)
//! - runs the configured commands in order on its own task (`Running`)
//! - ends in `Stopped` when the commands finish, one fails, or it is stopped
//!
//! State is held in a `watch` channel so readers (routing, admin, tests) never
//! block the supervision task. `Stopped` is terminal.

use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bisq_reconcile::LifecycleState;
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::PORT_ENV;
use crate::error::{ControllerError, Result};
use crate::source::VersionSource;
use crate::version::Version;

/// Result delivered on an instance's completion channel.
pub type CommandOutcome = Result<()>;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub app: String,
    pub version: Version,
    pub port: u16,
    pub work_dir: PathBuf,
    pub run_commands: Vec<String>,
}

/// A recorded lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEvent {
    pub state: LifecycleState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

pub struct AppInstance {
    spec: InstanceSpec,
    source: Arc<dyn VersionSource>,
    state: watch::Sender<LifecycleState>,
    events: Mutex<Vec<InstanceEvent>>,
    /// Process group of the command currently executing.
    current_pgid: Mutex<Option<i32>>,
    stop_requested: AtomicBool,
    completion: Mutex<Option<oneshot::Receiver<CommandOutcome>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AppInstance {
    /// Create an instance in `Pulling`. Nothing runs until [`start`](Self::start).
    pub fn new(spec: InstanceSpec, source: Arc<dyn VersionSource>) -> Arc<Self> {
        let (state, _) = watch::channel(LifecycleState::Pulling);
        Arc::new(Self {
            spec,
            source,
            state,
            events: Mutex::new(vec![InstanceEvent {
                state: LifecycleState::Pulling,
                at: Utc::now(),
            }]),
            current_pgid: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            completion: Mutex::new(None),
        })
    }

    pub fn app(&self) -> &str {
        &self.spec.app
    }

    pub fn version(&self) -> &Version {
        &self.spec.version
    }

    /// Display name of the version.
    pub fn name(&self) -> &str {
        &self.spec.version.name
    }

    /// Pool key, see [`Version::key`].
    pub fn key(&self) -> &str {
        self.spec.version.key()
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Wait until the instance reaches `target`.
    pub async fn wait_for_state(&self, target: LifecycleState) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|s| *s == target).await;
    }

    /// Lifecycle history, oldest first.
    pub fn events(&self) -> Vec<InstanceEvent> {
        lock(&self.events).clone()
    }

    /// Take the completion channel. Available once, after a successful start.
    pub fn take_completion(&self) -> Option<oneshot::Receiver<CommandOutcome>> {
        lock(&self.completion).take()
    }

    /// Loopback address of the instance, only while it is `Running`.
    pub fn proxy_target(&self) -> Option<SocketAddr> {
        (self.state() == LifecycleState::Running)
            .then(|| SocketAddr::from((Ipv4Addr::LOCALHOST, self.spec.port)))
    }

    /// Materialize the version and launch the command sequence.
    ///
    /// Returns once the process supervision task is running. A failed
    /// materialization leaves the instance in `Pulling`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let app = &self.spec.app;
        let version = &self.spec.version.name;

        self.transition(LifecycleState::Pulling);
        info!(app = %app, version = %version, tag = %self.spec.version.tag, "Pulling version");

        if let Err(e) = self
            .source
            .materialize(&self.spec.version.tag, &self.spec.work_dir)
            .await
        {
            error!(app = %app, version = %version, error = %e, "Error pulling version");
            return Err(e);
        }

        if !self.transition(LifecycleState::Running) {
            info!(app = %app, version = %version, "Stopped while pulling, not starting");
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        *lock(&self.completion) = Some(rx);
        tokio::spawn(Arc::clone(self).supervise(tx));
        Ok(())
    }

    /// Request termination and mark the instance `Stopped` without waiting.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(pgid) = *lock(&self.current_pgid) {
            self.interrupt(pgid);
        }
        self.transition(LifecycleState::Stopped);
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn interrupt(&self, pgid: i32) {
        if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGINT) {
            warn!(
                app = %self.spec.app,
                version = %self.spec.version.name,
                pgid,
                error = %e,
                "Error stopping app"
            );
        }
    }

    /// Move to `next` unless already there or `Stopped`. Returns whether it moved.
    fn transition(&self, next: LifecycleState) -> bool {
        let moved = self.state.send_if_modified(|current| {
            if *current == LifecycleState::Stopped || *current == next {
                return false;
            }
            *current = next;
            // Recorded under the state lock so history order matches transitions.
            lock(&self.events).push(InstanceEvent {
                state: next,
                at: Utc::now(),
            });
            true
        });

        if moved {
            info!(
                app = %self.spec.app,
                version = %self.spec.version.name,
                state = %next,
                "Instance state changed"
            );
        }
        moved
    }

    async fn supervise(self: Arc<Self>, done: oneshot::Sender<CommandOutcome>) {
        info!(
            app = %self.spec.app,
            version = %self.spec.version.name,
            port = self.spec.port,
            "Running version"
        );

        let outcome = self.run_commands().await;
        match &outcome {
            Ok(()) => info!(
                app = %self.spec.app,
                version = %self.spec.version.name,
                "Server stopped"
            ),
            Err(e) => error!(
                app = %self.spec.app,
                version = %self.spec.version.name,
                error = %e,
                "Run command failed"
            ),
        }

        self.transition(LifecycleState::Stopped);
        // Nobody listening is fine.
        let _ = done.send(outcome);
    }

    async fn run_commands(&self) -> CommandOutcome {
        for line in &self.spec.run_commands {
            if self.stop_requested() {
                return Ok(());
            }

            debug!(
                app = %self.spec.app,
                version = %self.spec.version.name,
                command = %line,
                "Running command"
            );
            let status = self.run_one(line).await?;

            if self.stop_requested() {
                return Ok(());
            }
            if !status.success() {
                return Err(ControllerError::CommandFailed {
                    command: line.clone(),
                    status: status.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn run_one(&self, line: &str) -> Result<ExitStatus> {
        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c")
            .arg(line)
            .current_dir(&self.spec.work_dir)
            .env(PORT_ENV, self.spec.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so a stop reaches everything `sh` started.
            .process_group(0);

        let mut child = Command::from(cmd)
            .spawn()
            .map_err(|e| ControllerError::CommandFailed {
                command: line.to_string(),
                status: format!("failed to spawn: {e}"),
            })?;

        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        *lock(&self.current_pgid) = pgid;
        // A stop that raced the spawn may have missed the pgid.
        if let (true, Some(pgid)) = (self.stop_requested(), pgid) {
            self.interrupt(pgid);
        }

        if let Some(stdout) = child.stdout.take() {
            self.pump(stdout, OutputStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.pump(stderr, OutputStream::Stderr);
        }

        let status = child.wait().await;
        *lock(&self.current_pgid) = None;
        Ok(status?)
    }

    /// Re-emit a child's output as log events tagged with app and version.
    fn pump<R>(&self, reader: R, stream: OutputStream)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let app = self.spec.app.clone();
        let version = self.spec.version.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match stream {
                    OutputStream::Stdout => info!(app = %app, version = %version, "{}", line),
                    OutputStream::Stderr => error!(app = %app, version = %version, "{}", line),
                }
            }
        });
    }
}
