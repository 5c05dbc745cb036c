//! Session Run Coordinator.
//!
//! Each session's pipeline runs in its own `session-runner` OS process. The
//! coordinator only sees process lifecycle: it hands the session over on
//! stdin and maps the exit code or signal to a [`SessionExit`]. A shared
//! tally counts finished sessions; the completion that makes it reach the
//! total triggers teardown.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinSet;

use crate::config::RunMode;
use crate::errors::AppError;
use crate::models::scan::SessionExit;
use crate::models::session::RunnableSession;

/// Starts one session's execution unit and waits for it to end.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    /// `Err` means the unit could not be started at all.
    async fn launch(&self, session: &RunnableSession) -> Result<SessionExit, AppError>;
}

/// Work to do once every session of a run has finished.
#[async_trait]
pub trait Teardown: Send + Sync {
    async fn teardown(&self);
}

pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_: &ExitStatus) -> Option<i32> {
    None
}

#[async_trait]
impl SessionLauncher for ProcessLauncher {
    async fn launch(&self, session: &RunnableSession) -> Result<SessionExit, AppError> {
        let input = serde_json::to_vec(session)
            .map_err(|e| AppError::Internal(format!("Failed to serialize session: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                AppError::Process(format!(
                    "failed to start {}: {e}",
                    self.program.display()
                ))
            })?;
        tracing::info!(
            session_id = %session.session_id(),
            pid = child.id(),
            "Session process started"
        );

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(&input).await?;
                stdin.shutdown().await
            }
            .await;
            if let Err(e) = written {
                tracing::warn!(
                    session_id = %session.session_id(),
                    error = %e,
                    "Session process closed stdin early"
                );
            }
        }

        let status = child.wait().await?;
        Ok(SessionExit::from_code(status.code(), signal_of(&status)))
    }
}

/// Counts finished sessions and fires teardown exactly once, on the last one.
pub struct FinishTally {
    finished: AtomicUsize,
    total: usize,
    teardown: Option<Arc<dyn Teardown>>,
}

impl FinishTally {
    pub fn new(total: usize, teardown: Option<Arc<dyn Teardown>>) -> Self {
        Self {
            finished: AtomicUsize::new(0),
            total,
            teardown,
        }
    }

    /// Record one finished session.
    pub async fn record(&self, session_id: &str) {
        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            session_id,
            finished,
            total = self.total,
            "Session finished"
        );
        if finished == self.total {
            if let Some(teardown) = &self.teardown {
                teardown.teardown().await;
            }
        }
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: String,
    pub exit: SessionExit,
}

pub struct SessionRunCoordinator {
    launcher: Arc<dyn SessionLauncher>,
    teardown: Option<Arc<dyn Teardown>>,
    run_mode: RunMode,
}

impl SessionRunCoordinator {
    pub fn new(
        launcher: Arc<dyn SessionLauncher>,
        teardown: Option<Arc<dyn Teardown>>,
        run_mode: RunMode,
    ) -> Self {
        Self {
            launcher,
            teardown,
            run_mode,
        }
    }

    /// Run every session to its end. Reports come back in input order.
    pub async fn run(&self, sessions: Vec<RunnableSession>) -> Vec<SessionReport> {
        let tally = Arc::new(FinishTally::new(sessions.len(), self.teardown.clone()));
        tracing::info!(
            sessions = sessions.len(),
            run_mode = ?self.run_mode,
            "Starting sessions"
        );

        match self.run_mode {
            RunMode::Sequential => {
                let mut reports = Vec::with_capacity(sessions.len());
                for session in sessions {
                    reports.push(run_one(self.launcher.clone(), tally.clone(), session).await);
                }
                reports
            }
            RunMode::Parallel => {
                let mut set = JoinSet::new();
                for (index, session) in sessions.into_iter().enumerate() {
                    let launcher = self.launcher.clone();
                    let tally = tally.clone();
                    set.spawn(async move { (index, run_one(launcher, tally, session).await) });
                }
                let mut indexed = Vec::new();
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok(report) => indexed.push(report),
                        Err(e) => tracing::error!(error = %e, "Session task panicked"),
                    }
                }
                indexed.sort_by_key(|(index, _)| *index);
                indexed.into_iter().map(|(_, report)| report).collect()
            }
        }
    }
}

async fn run_one(
    launcher: Arc<dyn SessionLauncher>,
    tally: Arc<FinishTally>,
    session: RunnableSession,
) -> SessionReport {
    let session_id = session.session_id().to_string();
    let exit = match launcher.launch(&session).await {
        Ok(exit) => exit,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Session could not be started");
            SessionExit::NotStarted {
                reason: e.to_string(),
            }
        }
    };
    match &exit {
        SessionExit::Passed => tracing::info!(session_id = %session_id, "Session passed"),
        SessionExit::Failed => tracing::warn!(session_id = %session_id, "Session failed its alert threshold"),
        other => tracing::error!(session_id = %session_id, exit = ?other, "Session ended abnormally"),
    }
    tally.record(&session_id).await;
    SessionReport { session_id, exit }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    /// Launcher with a scripted outcome and run time per session id.
    #[derive(Default)]
    pub struct FakeLauncher {
        pub outcomes: HashMap<String, (Duration, Result<SessionExit, String>)>,
        pub launched: Mutex<Vec<String>>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl FakeLauncher {
        pub fn with(mut self, session_id: &str, after: Duration, outcome: Result<SessionExit, String>) -> Self {
            self.outcomes.insert(session_id.to_string(), (after, outcome));
            self
        }
    }

    #[async_trait]
    impl SessionLauncher for FakeLauncher {
        async fn launch(&self, session: &RunnableSession) -> Result<SessionExit, AppError> {
            let id = session.session_id().to_string();
            self.launched.lock().unwrap().push(id.clone());
            let (after, outcome) = self
                .outcomes
                .get(&id)
                .cloned()
                .unwrap_or((Duration::ZERO, Ok(SessionExit::Passed)));
            if let Err(reason) = outcome {
                return Err(AppError::Process(reason));
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(after).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome.map_err(AppError::Process)
        }
    }

    /// Records each teardown along with how many sessions had finished by then.
    #[derive(Default)]
    pub struct RecordingTeardown {
        pub calls: Mutex<Vec<usize>>,
        pub tally: Mutex<Option<Arc<FinishTally>>>,
    }

    #[async_trait]
    impl Teardown for RecordingTeardown {
        async fn teardown(&self) {
            let finished = self
                .tally
                .lock()
                .unwrap()
                .as_ref()
                .map(|t| t.finished())
                .unwrap_or_default();
            self.calls.lock().unwrap().push(finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::*;
    use super::*;
    use crate::models::job::fixtures::browser_app_job;
    use crate::models::provisioning::{SessionEndpoints, WorkerEndpoint};
    use crate::models::sut::Sut;
    use crate::services::strategies::testing::settings;

    fn sessions(ids: &[&str]) -> Vec<RunnableSession> {
        let (sut, routes) = Sut::all_for_job(&browser_app_job()).remove(0);
        ids.iter()
            .map(|id| {
                let mut sut = sut.clone();
                sut.test_session.id = id.to_string();
                RunnableSession {
                    sut,
                    routes: routes.clone(),
                    endpoints: SessionEndpoints {
                        session_id: id.to_string(),
                        emissary: WorkerEndpoint::new(format!("e-{id}"), 8080),
                        selenium: None,
                    },
                    emissary: settings(),
                    report_dir: "/tmp/reports".to_string(),
                    redis_url: None,
                }
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_fires_once_after_last_completion() {
        let launcher = Arc::new(
            FakeLauncher::default()
                .with("a", Duration::from_secs(30), Ok(SessionExit::Passed))
                .with("b", Duration::from_secs(10), Ok(SessionExit::Errored { code: 2 }))
                .with("c", Duration::ZERO, Err("no such file".to_string())),
        );
        let teardown = Arc::new(RecordingTeardown::default());
        let coordinator =
            SessionRunCoordinator::new(launcher, Some(teardown.clone()), RunMode::Parallel);

        let reports = coordinator.run(sessions(&["a", "b", "c"])).await;

        assert_eq!(*teardown.calls.lock().unwrap(), vec![0]);
        assert_eq!(reports[0].exit, SessionExit::Passed);
        assert_eq!(reports[1].exit, SessionExit::Errored { code: 2 });
        assert!(matches!(reports[2].exit, SessionExit::NotStarted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn tally_reaches_total_before_teardown() {
        let teardown = Arc::new(RecordingTeardown::default());
        let tally = Arc::new(FinishTally::new(3, Some(teardown.clone())));
        *teardown.tally.lock().unwrap() = Some(tally.clone());

        tally.record("a").await;
        tally.record("b").await;
        assert!(teardown.calls.lock().unwrap().is_empty());
        tally.record("c").await;
        assert_eq!(*teardown.calls.lock().unwrap(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_sessions_overlap() {
        let launcher = Arc::new(
            FakeLauncher::default()
                .with("a", Duration::from_secs(10), Ok(SessionExit::Passed))
                .with("b", Duration::from_secs(10), Ok(SessionExit::Failed)),
        );
        let coordinator = SessionRunCoordinator::new(launcher.clone(), None, RunMode::Parallel);
        let started = tokio::time::Instant::now();
        coordinator.run(sessions(&["a", "b"])).await;
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(launcher.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_sessions_run_one_at_a_time_in_order() {
        let launcher = Arc::new(
            FakeLauncher::default()
                .with("a", Duration::from_secs(10), Ok(SessionExit::Passed))
                .with("b", Duration::from_secs(5), Ok(SessionExit::Passed)),
        );
        let coordinator = SessionRunCoordinator::new(launcher.clone(), None, RunMode::Sequential);
        let started = tokio::time::Instant::now();
        coordinator.run(sessions(&["a", "b"])).await;
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert_eq!(launcher.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(*launcher.launched.lock().unwrap(), vec!["a", "b"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exit_codes_map_to_session_exits() {
        let failing = ProcessLauncher::new("/bin/sh").with_args(["-c", "cat > /dev/null; exit 1"]);
        let exit = failing.launch(&sessions(&["a"])[0]).await.unwrap();
        assert_eq!(exit, SessionExit::Failed);

        let passing = ProcessLauncher::new("/bin/sh").with_args(["-c", "cat > /dev/null"]);
        let exit = passing.launch(&sessions(&["a"])[0]).await.unwrap();
        assert_eq!(exit, SessionExit::Passed);
    }

    #[tokio::test]
    async fn missing_program_is_a_start_failure() {
        let launcher = ProcessLauncher::new("/nonexistent/session-runner");
        let err = launcher.launch(&sessions(&["a"])[0]).await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }
}
