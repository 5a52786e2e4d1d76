//! charon lifecycle: launch it as a child, or watch an externally started one.
//!
//! Both modes only ever return a fatal [`SupervisorError`]. When charon dies
//! or restarts, its SAs and loaded connections are gone and the reconciler's
//! caches no longer describe reality, so the caller is expected to exit.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info};

use crate::config::{DEFAULT_PID_FILE, DEFAULT_VICI_SOCKET};
use crate::error::SupervisorError;
use crate::reconciler::Reconciler;

/// Pause between two pid file checks.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// charon logging subsystems, each given an explicit level.
pub const DEBUG_SUBSYSTEMS: [&str; 15] = [
    "dmn", "mgr", "ike", "chd", "cfg", "knl", "net", "asn", "tnc", "imc", "imv", "pts", "tls",
    "esp", "lib",
];

/// Sends SIGKILL to a pid.
pub type Killer = Arc<dyn Fn(i32) -> std::io::Result<()> + Send + Sync>;

/// How charon is run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorMode {
    /// Start charon as a child of this process.
    Launch {
        /// Append charon's output here instead of inheriting stdio.
        log_file: Option<PathBuf>,
    },
    /// Watch a charon started by someone else.
    Monitor,
}

/// Outcome of one monitor check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// First pid read, now remembered.
    FirstSeen(String),
    /// Same pid and charon answered.
    Alive,
    /// Same pid but charon did not answer, so it was killed.
    Killed(String),
}

/// Remembers the first pid seen and rejects any other.
#[derive(Debug, Default)]
pub struct PidWatch {
    pid: Option<String>,
}

impl PidWatch {
    /// Records `pid`, returning whether it is the first one seen.
    pub fn observe(&mut self, pid: &str) -> Result<bool, SupervisorError> {
        match &self.pid {
            None => {
                self.pid = Some(pid.to_string());
                Ok(true)
            }
            Some(old) if old == pid => Ok(false),
            Some(old) => Err(SupervisorError::DaemonRestarted {
                old: old.clone(),
                new: pid.to_string(),
            }),
        }
    }
}

/// Launches or monitors charon.
pub struct Supervisor {
    reconciler: Arc<Reconciler>,
    pid_file: PathBuf,
    vici_socket: PathBuf,
    program: PathBuf,
    interval: Duration,
    killer: Killer,
    watch: Mutex<PidWatch>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("pid_file", &self.pid_file)
            .field("vici_socket", &self.vici_socket)
            .field("program", &self.program)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// A supervisor with the standard charon paths.
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            vici_socket: PathBuf::from(DEFAULT_VICI_SOCKET),
            program: PathBuf::from("charon"),
            interval: MONITOR_INTERVAL,
            killer: Arc::new(kill_process),
            watch: Mutex::new(PidWatch::default()),
        }
    }

    /// Sets the pid file to watch.
    #[must_use]
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = path.into();
        self
    }

    /// Sets the control socket removed before launch.
    #[must_use]
    pub fn with_vici_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.vici_socket = path.into();
        self
    }

    /// Sets the daemon executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Sets the monitor interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Replaces how an unresponsive daemon is killed.
    #[must_use]
    pub fn with_killer(mut self, killer: Killer) -> Self {
        self.killer = killer;
        self
    }

    /// Supervises charon until something fatal happens.
    pub async fn run(self: Arc<Self>, mode: SupervisorMode) -> SupervisorError {
        match mode {
            SupervisorMode::Launch { log_file } => self.launch(log_file.as_deref()).await,
            SupervisorMode::Monitor => self.monitor().await,
        }
    }

    /// Starts charon and waits for it to exit.
    pub async fn launch(&self, log_file: Option<&Path>) -> SupervisorError {
        // A stale socket from a previous charon would make clients hang.
        let _ = std::fs::remove_file(&self.vici_socket);

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(daemon_args(LevelFilter::current() >= LevelFilter::DEBUG))
            .stdin(Stdio::null());

        if let Some(path) = log_file {
            let file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => file,
                Err(source) => {
                    return SupervisorError::LogFile {
                        path: path.to_path_buf(),
                        source,
                    }
                }
            };
            let stderr = match file.try_clone() {
                Ok(f) => f,
                Err(source) => {
                    return SupervisorError::LogFile {
                        path: path.to_path_buf(),
                        source,
                    }
                }
            };
            cmd.stdout(Stdio::from(file)).stderr(Stdio::from(stderr));
        }
        set_parent_death_signal(&mut cmd);

        let program = self.program.display().to_string();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => return SupervisorError::Spawn { program, source },
        };
        info!(program = %program, pid = ?child.id(), "launched charon");

        match child.wait().await {
            Ok(status) => SupervisorError::DaemonExited {
                status: status.to_string(),
            },
            Err(source) => SupervisorError::Spawn { program, source },
        }
    }

    /// Polls the pid file and probes charon until something fatal happens.
    pub async fn monitor(self: Arc<Self>) -> SupervisorError {
        loop {
            let this = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || this.tick()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return e,
                Err(e) => return SupervisorError::Task(e.to_string()),
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One monitor check. Blocks on the control socket.
    pub fn tick(&self) -> Result<Tick, SupervisorError> {
        let pid = std::fs::read_to_string(&self.pid_file)
            .map_err(|source| SupervisorError::PidFile {
                path: self.pid_file.clone(),
                source,
            })?
            .trim()
            .to_string();

        if self.watch.lock().observe(&pid)? {
            info!(pid = %pid, "charon running");
            return Ok(Tick::FirstSeen(pid));
        }

        // Held across probe and kill so no pass talks to a dying daemon.
        Ok(self.reconciler.while_locked(|client| match client.probe() {
            Ok(()) => {
                debug!(pid = %pid, "charon alive");
                Tick::Alive
            }
            Err(e) => {
                error!(pid = %pid, error = %e, "killing charon");
                self.kill(&pid);
                Tick::Killed(pid.clone())
            }
        }))
    }

    fn kill(&self, pid: &str) {
        let result = pid
            .parse::<i32>()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            .and_then(|pid| (self.killer)(pid));
        if let Err(e) = result {
            error!(pid = %pid, error = %e, "can't kill charon");
        }
    }
}

/// `--debug-<subsystem> <level>` for every subsystem.
pub fn daemon_args(debug: bool) -> Vec<String> {
    let level = if debug { "3" } else { "0" };
    DEBUG_SUBSYSTEMS
        .iter()
        .flat_map(|subsystem| [format!("--debug-{subsystem}"), level.to_string()])
        .collect()
}

fn kill_process(pid: i32) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), Signal::SIGKILL).map_err(std::io::Error::from)
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_parent_death_signal(cmd: &mut tokio::process::Command) {
    use nix::sys::signal::Signal;

    // SAFETY: the hook runs between fork and exec and only calls prctl(2).
    unsafe {
        cmd.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(Signal::SIGTERM).map_err(std::io::Error::from)
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn set_parent_death_signal(_cmd: &mut tokio::process::Command) {}
