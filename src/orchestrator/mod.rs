//! Dev-environment process orchestrator
//!
//! Starts and stops the services declared in a [`DevManifest`] in
//! dependency order. Each service moves through
//! `Stopped → Starting → Running → Stopping → Stopped`; starting requires
//! every dependency to be `Running`, stopping takes all dependents down
//! first. Failures leave the service `Stopped` and are never retried.

pub mod console;
pub mod manifest;
pub mod port;
pub mod process;

pub use manifest::{DevManifest, ServiceSpec};
pub use port::{PortGuard, SystemPortGuard};
pub use process::{ProcessHandle, ProcessLauncher, TokioLauncher};

use crate::config::OrchestratorConfig;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Unknown service '{0}'")]
    UnknownService(String),
    #[error("Cannot start '{service}': dependency '{dependency}' is not running")]
    DependencyNotRunning { service: String, dependency: String },
    #[error("Cannot start '{service}': port {port} is still in use")]
    PortInUse { service: String, port: u16 },
    #[error("Failed to spawn '{service}': {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to signal '{service}': {source}")]
    Signal {
        service: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid manifest: {0}")]
    ManifestInvalid(String),
    #[error("Dependency cycle involving '{0}'")]
    Cycle(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

struct ManagedService {
    spec: ServiceSpec,
    state: ServiceState,
    handle: Option<Box<dyn ProcessHandle>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
}

/// Owns every managed process. Used from a single task, so no locking.
pub struct Orchestrator {
    services: Vec<ManagedService>,
    launcher: Arc<dyn ProcessLauncher>,
    ports: Arc<dyn PortGuard>,
    grace_period: Duration,
    poll_interval: Duration,
    /// How long an evicted port may take to become free
    port_wait: Duration,
}

impl Orchestrator {
    pub fn new(
        manifest: DevManifest,
        launcher: Arc<dyn ProcessLauncher>,
        grace_period: Duration,
    ) -> Result<Self, OrchestratorError> {
        manifest.validate()?;
        let services = manifest
            .services
            .into_iter()
            .map(|spec| ManagedService {
                spec,
                state: ServiceState::Stopped,
                handle: None,
            })
            .collect();
        Ok(Self {
            services,
            launcher,
            ports: Arc::new(SystemPortGuard),
            grace_period,
            poll_interval: Duration::from_millis(100),
            port_wait: Duration::from_secs(2),
        })
    }

    pub fn with_port_guard(mut self, ports: Arc<dyn PortGuard>) -> Self {
        self.ports = ports;
        self
    }

    fn index_of(&self, name: &str) -> Result<usize, OrchestratorError> {
        self.services
            .iter()
            .position(|s| s.spec.name == name)
            .ok_or_else(|| OrchestratorError::UnknownService(name.to_string()))
    }

    pub fn state(&self, name: &str) -> Result<ServiceState, OrchestratorError> {
        Ok(self.services[self.index_of(name)?].state)
    }

    pub fn status(&self) -> Vec<ServiceStatus> {
        self.services
            .iter()
            .map(|s| ServiceStatus {
                name: s.spec.name.clone(),
                state: s.state,
                pid: s.handle.as_ref().and_then(|h| h.pid()),
                port: s.spec.port,
            })
            .collect()
    }

    /// Move services whose process exited on its own back to `Stopped`.
    pub fn refresh(&mut self) {
        for service in &mut self.services {
            if service.state != ServiceState::Running {
                continue;
            }
            let alive = service.handle.as_mut().is_some_and(|h| h.is_alive());
            if !alive {
                log::warn!("Service {} exited unexpectedly", service.spec.name);
                service.state = ServiceState::Stopped;
                service.handle = None;
            }
        }
    }

    pub async fn start(&mut self, name: &str) -> Result<(), OrchestratorError> {
        self.refresh();
        let idx = self.index_of(name)?;
        if self.services[idx].state == ServiceState::Running {
            log::info!("Service {} is already running", name);
            return Ok(());
        }

        for dep in &self.services[idx].spec.depends_on {
            let dep_idx = self.index_of(dep)?;
            if self.services[dep_idx].state != ServiceState::Running {
                log::error!("Cannot start {}: dependency {} is not running", name, dep);
                return Err(OrchestratorError::DependencyNotRunning {
                    service: name.to_string(),
                    dependency: dep.clone(),
                });
            }
        }

        self.services[idx].state = ServiceState::Starting;
        log::info!("Starting {}", name);

        if let Some(port) = self.services[idx].spec.port {
            let freed =
                port::free_port(self.ports.as_ref(), port, self.port_wait, self.poll_interval)
                    .await;
            if !freed {
                self.services[idx].state = ServiceState::Stopped;
                log::error!("Cannot start {}: port {} is still in use", name, port);
                return Err(OrchestratorError::PortInUse {
                    service: name.to_string(),
                    port,
                });
            }
        }

        match self.launcher.launch(&self.services[idx].spec) {
            Ok(handle) => {
                log::info!(
                    "Service {} running (pid {})",
                    name,
                    handle
                        .pid()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "?".to_string())
                );
                let service = &mut self.services[idx];
                service.handle = Some(handle);
                service.state = ServiceState::Running;
                Ok(())
            }
            Err(source) => {
                self.services[idx].state = ServiceState::Stopped;
                log::error!("Failed to spawn {}: {}", name, source);
                Err(OrchestratorError::Spawn {
                    service: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Services to stop for `name`, dependents before the services they depend on.
    pub fn stop_order(&self, name: &str) -> Result<Vec<String>, OrchestratorError> {
        self.index_of(name)?;
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        self.collect_dependents(name, &mut visited, &mut order);
        Ok(order)
    }

    fn collect_dependents(&self, name: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) {
        if !visited.insert(name.to_string()) {
            return;
        }
        for service in &self.services {
            if service.spec.depends_on.iter().any(|d| d == name) {
                self.collect_dependents(&service.spec.name, visited, order);
            }
        }
        order.push(name.to_string());
    }

    /// Stop `name` after recursively stopping everything that depends on it.
    pub async fn stop(&mut self, name: &str) -> Result<(), OrchestratorError> {
        self.refresh();
        for target in self.stop_order(name)? {
            self.stop_one(&target).await?;
        }
        Ok(())
    }

    async fn stop_one(&mut self, name: &str) -> Result<(), OrchestratorError> {
        let idx = self.index_of(name)?;
        if self.services[idx].state == ServiceState::Stopped {
            return Ok(());
        }
        let grace_period = self.grace_period;
        let poll_interval = self.poll_interval;
        let service = &mut self.services[idx];
        service.state = ServiceState::Stopping;
        log::info!("Stopping {}", name);

        if let Some(mut handle) = service.handle.take() {
            if let Err(source) = handle.terminate() {
                log::warn!("Graceful stop of {} failed: {}", name, source);
            }

            let deadline = tokio::time::Instant::now() + grace_period;
            while handle.is_alive() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(poll_interval).await;
            }

            if handle.is_alive() {
                log::warn!(
                    "{} still alive after {:?}, killing it",
                    name,
                    grace_period
                );
                if let Err(source) = handle.kill() {
                    service.handle = Some(handle);
                    service.state = ServiceState::Running;
                    return Err(OrchestratorError::Signal {
                        service: name.to_string(),
                        source,
                    });
                }
            }
        }

        service.state = ServiceState::Stopped;
        log::info!("Service {} stopped", name);
        Ok(())
    }

    pub async fn restart(&mut self, name: &str) -> Result<(), OrchestratorError> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Start everything in dependency order. Failures are reported, not fatal.
    pub async fn start_all(&mut self) -> Vec<OrchestratorError> {
        let manifest = DevManifest {
            services: self.services.iter().map(|s| s.spec.clone()).collect(),
        };
        let order = match manifest.start_order() {
            Ok(order) => order,
            Err(e) => return vec![e],
        };
        let mut errors = Vec::new();
        for name in order {
            if let Err(e) = self.start(&name).await {
                errors.push(e);
            }
        }
        errors
    }

    /// Stop every running service, dependents first.
    pub async fn stop_all(&mut self) -> Vec<OrchestratorError> {
        let mut errors = Vec::new();
        let names: Vec<String> = self.services.iter().map(|s| s.spec.name.clone()).collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                errors.push(e);
            }
        }
        errors
    }
}

/// Run the orchestrator with an operator console on stdin until `quit` or Ctrl-C.
pub async fn run_dev(config: OrchestratorConfig) -> anyhow::Result<()> {
    let manifest = DevManifest::load(&config.manifest)?;
    log::info!(
        "Loaded {} services from {}",
        manifest.services.len(),
        config.manifest.display()
    );
    let mut orchestrator =
        Orchestrator::new(manifest, Arc::new(TokioLauncher), config.grace_period)?;

    if config.autostart {
        for e in orchestrator.start_all().await {
            log::error!("{}", e);
        }
    }
    println!("{}", console::HELP);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    tokio::select! {
        _ = console::run(&mut orchestrator, stdin) => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down");
        }
    }

    for e in orchestrator.stop_all().await {
        log::error!("{}", e);
    }
    Ok(())
}
