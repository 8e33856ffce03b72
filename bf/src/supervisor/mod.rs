//! Supervisor - child engine lifecycle and shutdown choreography
//!
//! Owns the three engine server processes and the in-process forum
//! aggregator. All mutable state lives in one value behind locks; the
//! HTTP layer holds the supervisor in an Arc and never touches children
//! directly.

mod child;

pub use child::{ChildHandle, probe_health, spawn_engine, stop_child};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reportstore::Engine;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::forum::{ForumConfig, ForumHandle, HostSpeaker, start_forum};
use crate::llm::create_client;

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("system is already starting")]
    AlreadyStarting,

    #[error("system is already running")]
    AlreadyStarted,

    #[error("shutdown in progress")]
    ShuttingDown,

    #[error("migration command failed: {0}")]
    MigrationFailed(String),

    #[error("failed to spawn {engine}: {message}")]
    SpawnFailed { engine: Engine, message: String },

    #[error("{engine} did not become healthy within {seconds}s")]
    HealthTimeout { engine: Engine, seconds: u64 },
}

/// Lifecycle flags, guarded together by one mutex.
#[derive(Debug, Clone, Copy, Default)]
struct SystemFlags {
    started: bool,
    starting: bool,
    /// Monotonic: set once, never cleared.
    shutdown_in_progress: bool,
}

/// Point-in-time system view for the status endpoints
#[derive(Debug, Clone, serde::Serialize)]
pub struct SupervisorStatus {
    pub started: bool,
    pub starting: bool,
    pub shutdown_in_progress: bool,
    pub engines: HashMap<String, bool>,
    pub forum_running: bool,
}

/// Owner of the engine children and the forum aggregator task
pub struct Supervisor {
    flags: Mutex<SystemFlags>,
    children: AsyncMutex<HashMap<Engine, ChildHandle>>,
    forum: AsyncMutex<Option<ForumHandle>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            flags: Mutex::new(SystemFlags::default()),
            children: AsyncMutex::new(HashMap::new()),
            forum: AsyncMutex::new(None),
        }
    }

    /// Cooperative startup: migrations, engine children with health
    /// probes, then the forum aggregator. Any failure triggers concurrent
    /// cleanup and returns the accumulated errors.
    pub async fn initialize(&self, settings: &Settings) -> Result<(), Vec<String>> {
        self.begin_start()?;
        info!("system initialization started");

        let mut errors: Vec<String> = Vec::new();

        if let Err(e) = self.run_migrations(settings).await {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            // A previous forum task must not keep tailing while children
            // restart.
            self.stop_forum().await;

            for engine in Engine::ALL {
                match self.start_engine(settings, engine).await {
                    Ok(()) => info!(%engine, "engine ready"),
                    Err(e) => {
                        error!(%engine, error = %e, "engine startup failed");
                        errors.push(e.to_string());
                        break;
                    }
                }
            }
        }

        if errors.is_empty() {
            self.start_forum(settings).await;
            let mut flags = self.flags.lock().expect("flags lock");
            flags.started = true;
            flags.starting = false;
            info!("system initialization complete");
            Ok(())
        } else {
            warn!(?errors, "initialization failed, cleaning up");
            self.cleanup_concurrent(settings.shutdown_cleanup_timeout, settings.child_stop_grace)
                .await;
            let mut flags = self.flags.lock().expect("flags lock");
            flags.started = false;
            flags.starting = false;
            Err(errors)
        }
    }

    fn begin_start(&self) -> Result<(), Vec<String>> {
        let mut flags = self.flags.lock().expect("flags lock");
        if flags.shutdown_in_progress {
            return Err(vec![SupervisorError::ShuttingDown.to_string()]);
        }
        if flags.starting {
            return Err(vec![SupervisorError::AlreadyStarting.to_string()]);
        }
        if flags.started {
            return Err(vec![SupervisorError::AlreadyStarted.to_string()]);
        }
        flags.starting = true;
        Ok(())
    }

    async fn run_migrations(&self, settings: &Settings) -> Result<(), SupervisorError> {
        let Some(command) = &settings.migrate_command else {
            debug!("no migration command configured");
            return Ok(());
        };
        info!(command, "running migrations");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .await
            .map_err(|e| SupervisorError::MigrationFailed(e.to_string()))?;
        if !status.success() {
            return Err(SupervisorError::MigrationFailed(format!(
                "exit status {:?}",
                status.code()
            )));
        }
        Ok(())
    }

    async fn start_engine(
        &self,
        settings: &Settings,
        engine: Engine,
    ) -> Result<(), SupervisorError> {
        let child_config = match engine {
            Engine::Insight => &settings.insight_child,
            Engine::Media => &settings.media_child,
            Engine::Query => &settings.query_child,
        };
        let log_path = settings.engine_log_path(engine);
        let handle = spawn_engine(engine, &child_config.command, &log_path).await?;
        self.children.lock().await.insert(engine, handle);

        let healthy = probe_health(child_config.port, settings.health_probe_timeout).await;
        if !healthy {
            return Err(SupervisorError::HealthTimeout {
                engine,
                seconds: settings.health_probe_timeout.as_secs(),
            });
        }
        Ok(())
    }

    async fn start_forum(&self, settings: &Settings) {
        let host = if settings.forum_host.is_configured() {
            match create_client("forum host", &settings.forum_host, settings.llm_timeout) {
                Ok(client) => Some(HostSpeaker::new(client)),
                Err(e) => {
                    warn!(error = %e, "forum host unavailable, running in pure monitoring mode");
                    None
                }
            }
        } else {
            info!("no forum host credentials, running in pure monitoring mode");
            None
        };
        let handle = start_forum(ForumConfig::from_settings(settings), host);
        *self.forum.lock().await = Some(handle);
    }

    async fn stop_forum(&self) {
        if let Some(handle) = self.forum.lock().await.take() {
            debug!("stopping forum aggregator");
            handle.stop().await;
        }
    }

    /// Stop one child: terminate, wait for the grace period, then kill.
    pub async fn stop_engine(&self, engine: Engine, grace: Duration) -> bool {
        match self.children.lock().await.remove(&engine) {
            Some(handle) => {
                stop_child(handle, grace).await;
                true
            }
            None => false,
        }
    }

    /// Fan out stops across all children within a deadline; survivors are
    /// force-killed. Also stops the forum task and marks the system
    /// stopped.
    pub async fn cleanup_concurrent(&self, timeout: Duration, child_grace: Duration) {
        info!(timeout_s = timeout.as_secs(), "concurrent cleanup started");
        self.stop_forum().await;

        let children: Vec<(Engine, ChildHandle)> =
            self.children.lock().await.drain().collect();
        let grace = child_grace.min(timeout);
        let stops = children.into_iter().map(|(engine, handle)| async move {
            debug!(%engine, "stopping engine child");
            stop_child(handle, grace).await;
        });
        if tokio::time::timeout(timeout, futures::future::join_all(stops))
            .await
            .is_err()
        {
            warn!("cleanup deadline exceeded; remaining children were force-killed on drop");
        }

        self.flags.lock().expect("flags lock").started = false;
        info!("concurrent cleanup finished");
    }

    /// Schedule cleanup on a background task and force-exit the process
    /// after `timeout + 2s`. The caller's HTTP response returns
    /// immediately.
    pub fn async_shutdown(self: &Arc<Self>, timeout: Duration, child_grace: Duration) {
        {
            let mut flags = self.flags.lock().expect("flags lock");
            if flags.shutdown_in_progress {
                debug!("shutdown already in progress");
                return;
            }
            flags.shutdown_in_progress = true;
        }
        info!(timeout_s = timeout.as_secs(), "async shutdown scheduled");

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.cleanup_concurrent(timeout, child_grace).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            info!("shutdown cleanup finished, exiting");
            std::process::exit(0);
        });
        let force_exit_after = timeout + Duration::from_secs(2);
        tokio::spawn(async move {
            tokio::time::sleep(force_exit_after).await;
            error!("cleanup overran its deadline, forcing exit");
            std::process::exit(1);
        });
    }

    pub fn is_started(&self) -> bool {
        self.flags.lock().expect("flags lock").started
    }

    pub fn is_shutting_down(&self) -> bool {
        self.flags.lock().expect("flags lock").shutdown_in_progress
    }

    pub async fn status(&self) -> SupervisorStatus {
        let flags = *self.flags.lock().expect("flags lock");
        let mut engines = HashMap::new();
        {
            let mut children = self.children.lock().await;
            for engine in Engine::ALL {
                let running = match children.get_mut(&engine) {
                    Some(handle) => handle.is_running(),
                    None => false,
                };
                engines.insert(engine.to_string(), running);
            }
        }
        SupervisorStatus {
            started: flags.started,
            starting: flags.starting,
            shutdown_in_progress: flags.shutdown_in_progress,
            engines,
            forum_running: self.forum.lock().await.is_some(),
        }
    }
}
