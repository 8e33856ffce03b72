//! Engine child processes: spawn with a stdout tee, health probing, and
//! terminate-then-kill stop semantics.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reportstore::Engine;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SupervisorError;

/// A supervised engine process plus its log tee tasks
pub struct ChildHandle {
    pub engine: Engine,
    process: Child,
    tees: Vec<JoinHandle<()>>,
}

impl ChildHandle {
    /// Whether the process is still alive (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }
}

/// Spawn an engine server through the shell, with stdout and stderr teed
/// line-buffered into the engine's log file.
pub async fn spawn_engine(
    engine: Engine,
    command: &str,
    log_path: &Path,
) -> Result<ChildHandle, SupervisorError> {
    debug!(%engine, command, "spawning engine child");

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SupervisorError::SpawnFailed {
            engine,
            message: e.to_string(),
        })?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| SupervisorError::SpawnFailed {
            engine,
            message: e.to_string(),
        })?;
    let log_file = Arc::new(Mutex::new(log_file));

    let mut process = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SupervisorError::SpawnFailed {
            engine,
            message: e.to_string(),
        })?;

    let mut tees = Vec::new();
    if let Some(stdout) = process.stdout.take() {
        tees.push(spawn_tee(engine, stdout, log_file.clone()));
    }
    if let Some(stderr) = process.stderr.take() {
        tees.push(spawn_tee(engine, stderr, log_file));
    }

    info!(%engine, pid = ?process.id(), "engine child spawned");
    Ok(ChildHandle {
        engine,
        process,
        tees,
    })
}

fn spawn_tee(
    engine: Engine,
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    log_file: Arc<Mutex<std::fs::File>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        use std::io::Write;
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let mut file = log_file.lock().expect("log tee lock");
                    if let Err(e) = writeln!(file, "{line}") {
                        warn!(%engine, error = %e, "log tee write failed");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(%engine, error = %e, "log tee read failed");
                    break;
                }
            }
        }
        debug!(%engine, "log tee finished");
    })
}

/// Terminate the child, wait out the grace period, then kill. The tee
/// tasks drain on their own once the pipes close.
pub async fn stop_child(mut handle: ChildHandle, grace: Duration) {
    let engine = handle.engine;
    debug!(%engine, "stopping child");

    #[cfg(unix)]
    if let Some(pid) = handle.process.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(%engine, error = %e, "SIGTERM failed (process may be gone)");
        }
    }

    match tokio::time::timeout(grace, handle.process.wait()).await {
        Ok(Ok(status)) => info!(%engine, ?status, "child exited"),
        Ok(Err(e)) => warn!(%engine, error = %e, "wait failed"),
        Err(_) => {
            warn!(%engine, "child ignored SIGTERM, killing");
            if let Err(e) = handle.process.start_kill() {
                warn!(%engine, error = %e, "kill failed");
            }
            let _ = handle.process.wait().await;
        }
    }

    for tee in handle.tees.drain(..) {
        let _ = tokio::time::timeout(Duration::from_secs(1), tee).await;
    }
}

/// Poll the engine's health endpoint at 1 Hz until it answers 200 or the
/// timeout elapses.
pub async fn probe_health(port: u16, timeout: Duration) -> bool {
    let url = format!("http://127.0.0.1:{port}/_stcore/health");
    probe_health_url(&url, timeout).await
}

pub async fn probe_health_url(url: &str, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "could not build health probe client");
            return false;
        }
    };

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match client.get(url).send().await {
            Ok(response) if response.status().as_u16() == 200 => {
                debug!(url, "health probe succeeded");
                return true;
            }
            Ok(response) => debug!(url, status = response.status().as_u16(), "health probe refused"),
            Err(e) => debug!(url, error = %e, "health probe unreachable"),
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(url, "health probe timed out");
            return false;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
