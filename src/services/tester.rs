//! Tester lifecycle: the outbound operations of the orchestration engine.
//!
//! A tester moves `idle → initialising → initialised → running → idle`.
//! Initialising provisions and readies one set of workers per session;
//! starting hands each session to the run coordinator in the background.
//! Any initialisation failure releases whatever was provisioned and returns
//! the tester to idle.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::json;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::AppError;
use crate::models::job::Job;
use crate::models::provisioning::{ProvisionRequestItem, ProvisionedSession, SessionEndpoints};
use crate::models::session::RunnableSession;
use crate::models::sut::Sut;
use crate::services::provisioning::ProvisioningCoordinator;
use crate::services::publisher::{self, ProgressPublisher, EVENT_TESTER_MESSAGE};
use crate::services::session_run::{
    ProcessLauncher, SessionLauncher, SessionRunCoordinator, Teardown,
};
use crate::services::strategies::validate_strategies;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TesterStatus {
    Idle,
    Initialising,
    Initialised,
    Running,
}

impl std::fmt::Display for TesterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Initialising => write!(f, "initialising"),
            Self::Initialised => write!(f, "initialised"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Check whether a tester status transition is allowed.
pub fn is_valid_transition(from: TesterStatus, to: TesterStatus) -> bool {
    matches!(
        (from, to),
        (TesterStatus::Idle, TesterStatus::Initialising)
            | (TesterStatus::Initialising, TesterStatus::Initialised)
            | (TesterStatus::Initialising, TesterStatus::Idle)
            | (TesterStatus::Initialised, TesterStatus::Running)
            | (TesterStatus::Initialised, TesterStatus::Idle)
            | (TesterStatus::Running, TesterStatus::Idle)
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitOutcome {
    pub run_id: Uuid,
    pub status: TesterStatus,
    pub runnable_sessions: Vec<SessionEndpoints>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: Option<Uuid>,
    pub status: TesterStatus,
    pub sessions: usize,
    pub message: String,
}

#[derive(Debug)]
struct RunState {
    run_id: Option<Uuid>,
    status: TesterStatus,
    provisioned: Vec<ProvisionedSession>,
    runnable: Vec<RunnableSession>,
}

impl RunState {
    fn transition(&mut self, to: TesterStatus) -> Result<(), AppError> {
        if !is_valid_transition(self.status, to) {
            return Err(AppError::Conflict(format!(
                "Tester is {}, cannot become {to}",
                self.status
            )));
        }
        self.status = to;
        Ok(())
    }

    fn clear(&mut self) {
        self.run_id = None;
        self.status = TesterStatus::Idle;
        self.provisioned.clear();
        self.runnable.clear();
    }
}

pub struct Tester {
    config: AppConfig,
    provisioning: Arc<ProvisioningCoordinator>,
    launcher: Arc<dyn SessionLauncher>,
    publisher: Arc<dyn ProgressPublisher>,
    state: Arc<Mutex<RunState>>,
}

impl std::fmt::Debug for Tester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tester")
            .field("status", &self.status())
            .field("run_mode", &self.config.run_mode)
            .finish_non_exhaustive()
    }
}

impl Tester {
    pub fn new(
        config: AppConfig,
        provisioning: Arc<ProvisioningCoordinator>,
        launcher: Arc<dyn SessionLauncher>,
        publisher: Arc<dyn ProgressPublisher>,
    ) -> Self {
        Self {
            config,
            provisioning,
            launcher,
            publisher,
            state: Arc::new(Mutex::new(RunState {
                run_id: None,
                status: TesterStatus::Idle,
                provisioned: Vec::new(),
                runnable: Vec::new(),
            })),
        }
    }

    /// Wire the production collaborators from configuration.
    pub async fn from_config(config: AppConfig) -> Result<Self, AppError> {
        let provisioning = Arc::new(ProvisioningCoordinator::over_http(
            config.provisioning.clone(),
            config.emissary.port,
        )?);
        let launcher = Arc::new(ProcessLauncher::new(&config.session_runner_path));
        let publisher: Arc<dyn ProgressPublisher> =
            Arc::from(publisher::from_config(config.redis_url.as_deref()).await);
        Ok(Self::new(config, provisioning, launcher, publisher))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> TesterStatus {
        self.lock().status
    }

    /// Provision and ready workers for every session of the job.
    pub async fn init_tester(&self, job: Job) -> Result<InitOutcome, AppError> {
        job.validate_job()?;
        let suts = Sut::all_for_job(&job);
        for (sut, _) in &suts {
            validate_strategies(sut).map_err(|e| e.in_session(sut.session_id()))?;
        }

        let run_id = Uuid::now_v7();
        {
            let mut state = self.lock();
            state.transition(TesterStatus::Initialising)?;
            state.run_id = Some(run_id);
        }

        let items: Vec<ProvisionRequestItem> = suts
            .iter()
            .map(|(sut, _)| ProvisionRequestItem::new(sut.session_id(), sut.browser))
            .collect();
        tracing::info!(%run_id, sessions = items.len(), kind = %job.sut.kind, "Initialising tester");

        let provisioned = match self.provisioning.provision(&items).await {
            Ok(provisioned) => provisioned,
            Err(failure) => {
                return Err(self
                    .abort_init(failure.error, failure.partial, &items)
                    .await)
            }
        };

        let endpoints = match self.ready_workers(&provisioned).await {
            Ok(endpoints) => endpoints,
            Err(e) => return Err(self.abort_init(e, provisioned, &items).await),
        };

        let mut runnable = Vec::with_capacity(suts.len());
        for (sut, routes) in suts {
            let Some(bound) = endpoints.iter().find(|e| e.session_id == sut.session_id()) else {
                let e = AppError::Internal(format!(
                    "no endpoints resolved for session {}",
                    sut.session_id()
                ));
                return Err(self.abort_init(e, provisioned, &items).await);
            };
            runnable.push(RunnableSession {
                endpoints: bound.clone(),
                sut,
                routes,
                emissary: self.config.emissary.clone(),
                report_dir: self.config.report_dir.clone(),
                redis_url: self.config.redis_url.clone(),
            });
        }

        let mut state = self.lock();
        state.transition(TesterStatus::Initialised)?;
        state.provisioned = provisioned;
        state.runnable = runnable;
        tracing::info!(%run_id, sessions = endpoints.len(), "Tester initialised");
        Ok(InitOutcome {
            run_id,
            status: state.status,
            runnable_sessions: endpoints,
        })
    }

    async fn ready_workers(
        &self,
        provisioned: &[ProvisionedSession],
    ) -> Result<Vec<SessionEndpoints>, AppError> {
        let endpoints = self.provisioning.resolve_endpoints(provisioned).await?;
        self.provisioning.await_readiness(&endpoints).await?;
        Ok(endpoints)
    }

    /// Release partial resources, tell each session's Build User, go idle.
    async fn abort_init(
        &self,
        error: AppError,
        partial: Vec<ProvisionedSession>,
        items: &[ProvisionRequestItem],
    ) -> AppError {
        tracing::error!(error = %error, "Tester initialisation failed");
        if let Err(e) = self.provisioning.deprovision(&partial).await {
            tracing::error!(error = %e, "Best-effort deprovisioning failed");
        }
        for item in items {
            let message = error.build_user_message();
            self.publisher
                .publish(
                    &item.app_scanner_session_id,
                    json!({ "message": format!("Tester initialisation failed: {message}") }),
                    EVENT_TESTER_MESSAGE,
                )
                .await;
        }
        self.lock().clear();
        error
    }

    /// Launch every initialised session in the background.
    pub fn start_sessions(&self) -> Result<RunStatus, AppError> {
        let (run_id, runnable, provisioned) = {
            let mut state = self.lock();
            state.transition(TesterStatus::Running)?;
            (
                state.run_id,
                std::mem::take(&mut state.runnable),
                std::mem::take(&mut state.provisioned),
            )
        };
        let sessions = runnable.len();

        let teardown: Option<Arc<dyn Teardown>> = self.config.deprovision_on_completion.then(|| {
            Arc::new(Deprovision {
                provisioning: self.provisioning.clone(),
                sessions: provisioned,
            }) as Arc<dyn Teardown>
        });
        let coordinator =
            SessionRunCoordinator::new(self.launcher.clone(), teardown, self.config.run_mode);
        let state = self.state.clone();

        tokio::spawn(async move {
            let reports = coordinator.run(runnable).await;
            let passed = reports.iter().filter(|r| r.exit.is_success()).count();
            tracing::info!(run_id = ?run_id, passed, total = reports.len(), "Test run complete");
            state.lock().unwrap_or_else(PoisonError::into_inner).clear();
        });

        Ok(RunStatus {
            run_id,
            status: TesterStatus::Running,
            sessions,
            message: format!("Started {sessions} session(s)"),
        })
    }

    /// Initialise and start in one go. A run already in progress makes this a no-op.
    pub async fn run_job(&self, job: Job) -> Result<RunStatus, AppError> {
        let current = self.status();
        if current != TesterStatus::Idle {
            return Ok(self.already_running(current));
        }
        match self.init_tester(job).await {
            Ok(_) => self.start_sessions(),
            Err(AppError::Conflict(_)) => Ok(self.already_running(self.status())),
            Err(e) => Err(e),
        }
    }

    fn already_running(&self, status: TesterStatus) -> RunStatus {
        let run_id = self.lock().run_id;
        tracing::info!(%status, run_id = ?run_id, "Run requested while a run is in progress");
        RunStatus {
            run_id,
            status,
            sessions: 0,
            message: "A test run is already in progress".to_string(),
        }
    }

    /// Release an initialised but unstarted run.
    pub async fn reset_tester(&self) -> Result<RunStatus, AppError> {
        let (run_id, provisioned) = {
            let mut state = self.lock();
            match state.status {
                TesterStatus::Idle => {
                    return Ok(RunStatus {
                        run_id: None,
                        status: TesterStatus::Idle,
                        sessions: 0,
                        message: "Tester is already idle".to_string(),
                    })
                }
                TesterStatus::Initialised => {
                    let run_id = state.run_id;
                    let provisioned = std::mem::take(&mut state.provisioned);
                    state.transition(TesterStatus::Idle)?;
                    state.clear();
                    (run_id, provisioned)
                }
                other => {
                    return Err(AppError::Conflict(format!("Cannot reset a tester that is {other}")))
                }
            }
        };
        let sessions = provisioned.len();
        self.provisioning.deprovision(&provisioned).await?;
        Ok(RunStatus {
            run_id,
            status: TesterStatus::Idle,
            sessions,
            message: format!("Released {sessions} session(s)"),
        })
    }
}

/// Teardown that releases the run's workers.
struct Deprovision {
    provisioning: Arc<ProvisioningCoordinator>,
    sessions: Vec<ProvisionedSession>,
}

#[async_trait]
impl Teardown for Deprovision {
    async fn teardown(&self) {
        if let Err(e) = self.provisioning.deprovision(&self.sessions).await {
            tracing::error!(error = %e, "Deprovisioning after run failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::RunMode;
    use crate::services::provisioning::testing::config;
    use crate::services::strategies::testing::settings;

    pub fn app_config() -> AppConfig {
        AppConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            emissary: settings(),
            provisioning: config(false),
            run_mode: RunMode::Parallel,
            deprovision_on_completion: true,
            session_runner_path: "/nonexistent/session-runner".to_string(),
            report_dir: "./reports".to_string(),
            redis_url: None,
        }
    }
}
