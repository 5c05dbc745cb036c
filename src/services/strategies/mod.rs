//! Per-session strategy pipeline.
//!
//! A pipeline is eight stage slots run strictly in order. Each stage is a
//! closed set of named strategies; the job picks one by name per stage, or
//! the SUT variant's default applies. Every strategy is resolved and built
//! before the first stage runs, so an unknown or inapplicable name fails the
//! session without a single Emissary call.

pub mod authentication;
pub mod post_scanning;
pub mod reporting;
pub mod scanners;
pub mod scanning;
pub mod sites_tree;
pub mod spider;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EmissaryConfig;
use crate::errors::AppError;
use crate::models::job::{Route, StrategyNames, SutKind};
use crate::models::scan::Verdict;
use crate::models::sut::Sut;
use crate::services::browser::BrowserDriver;
use crate::services::emissary::EmissaryApi;
use crate::services::publisher::ProgressPublisher;
use crate::services::scan_progress::ScanTracker;
use crate::services::session_state::SessionState;

use self::authentication::EmissaryAuthentication;
use self::post_scanning::PostScanning;
use self::reporting::Reporting;
use self::scanners::Scanners;
use self::scanning::Scanning;
use self::sites_tree::{SitesTreePopulation, SutAuthenticationPopulation};
use self::spider::Spider;

/// The capability every stage implementation exposes.
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn run(&self) -> Result<(), AppError>;
}

/// Pipeline stage slots, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    SitesTreeSutAuthenticationPopulation,
    SitesTreePopulation,
    EmissaryAuthentication,
    Spider,
    Scanners,
    Scanning,
    PostScanning,
    Reporting,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::SitesTreeSutAuthenticationPopulation,
        Stage::SitesTreePopulation,
        Stage::EmissaryAuthentication,
        Stage::Spider,
        Stage::Scanners,
        Stage::Scanning,
        Stage::PostScanning,
        Stage::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SitesTreeSutAuthenticationPopulation => "sitesTreeSutAuthenticationPopulation",
            Self::SitesTreePopulation => "sitesTreePopulation",
            Self::EmissaryAuthentication => "emissaryAuthentication",
            Self::Spider => "spider",
            Self::Scanners => "scanners",
            Self::Scanning => "scanning",
            Self::PostScanning => "postScanning",
            Self::Reporting => "reporting",
        }
    }

    /// The strategy name the job asked for in this slot, if any.
    pub fn requested<'a>(&self, names: &'a StrategyNames) -> Option<&'a str> {
        let name = match self {
            Self::SitesTreeSutAuthenticationPopulation => {
                &names.sites_tree_sut_authentication_population_strategy
            }
            Self::SitesTreePopulation => &names.sites_tree_population_strategy,
            Self::EmissaryAuthentication => &names.emissary_authentication_strategy,
            Self::Spider => &names.spider_strategy,
            Self::Scanners => &names.scanners_strategy,
            Self::Scanning => &names.scanning_strategy,
            Self::PostScanning => &names.post_scanning_strategy,
            Self::Reporting => &names.reporting_strategy,
        };
        name.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a session's strategies may be built from.
///
/// Each strategy constructor copies out only the slice it needs.
#[derive(Clone)]
pub struct StageContext {
    pub sut: Sut,
    pub routes: Vec<Route>,
    pub emissary: Arc<dyn EmissaryApi>,
    pub browser: Option<Arc<dyn BrowserDriver>>,
    pub publisher: Arc<dyn ProgressPublisher>,
    pub state: Arc<SessionState>,
    pub settings: EmissaryConfig,
    pub report_dir: PathBuf,
}

impl StageContext {
    pub fn session_id(&self) -> &str {
        self.sut.session_id()
    }

    /// Absolute URLs of the session's routes, or the base URL when it has none.
    pub fn target_urls(&self) -> Vec<String> {
        let base = self.sut.base_url();
        if self.routes.is_empty() {
            return vec![base];
        }
        self.routes
            .iter()
            .map(|route| format!("{base}{}", route.id))
            .collect()
    }

    pub fn tracker(&self) -> ScanTracker {
        ScanTracker::new(
            self.emissary.clone(),
            self.publisher.clone(),
            self.state.clone(),
            self.session_id(),
            self.settings.poll_interval(),
        )
    }
}

/// A closed set of named implementations for one stage.
pub(crate) trait StageStrategy: Sized + Copy + 'static {
    const STAGE: Stage;
    const ALL: &'static [Self];

    fn name(&self) -> &'static str;

    /// The strategy used when the job names none. `None` leaves the slot empty.
    fn default_for(sut: &Sut) -> Option<Self>;

    /// Check the strategy applies to the SUT alone, before any worker exists.
    fn check(&self, _sut: &Sut) -> Result<(), AppError> {
        Ok(())
    }

    /// Check applicability and capture arguments. Must not touch the network.
    fn build(&self, ctx: &StageContext) -> Result<Box<dyn Strategy>, AppError>;
}

fn resolve<S: StageStrategy>(sut: &Sut) -> Result<Option<S>, AppError> {
    let names = &sut.test_session.attributes.strategies;
    match S::STAGE.requested(names) {
        None => Ok(S::default_for(sut)),
        Some(requested) => S::ALL
            .iter()
            .copied()
            .find(|s| s.name() == requested)
            .map(Some)
            .ok_or_else(|| {
                let known: Vec<_> = S::ALL.iter().map(|s| s.name()).collect();
                AppError::Validation(format!(
                    "Unknown {} strategy '{requested}'. Known strategies: {}",
                    S::STAGE,
                    known.join(", ")
                ))
            }),
    }
}

/// Fail unless the session's SUT is of the given variant.
pub(crate) fn require_kind<S: StageStrategy>(
    strategy: &S,
    sut: &Sut,
    kind: SutKind,
) -> Result<(), AppError> {
    if sut.kind == kind {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "{} strategy '{}' is not applicable to this SUT ({})",
            S::STAGE,
            strategy.name(),
            sut.kind
        )))
    }
}

/// Fail when a SUT property the strategy depends on is absent.
pub(crate) fn require<S: StageStrategy, T>(
    strategy: &S,
    value: Option<T>,
    what: &str,
) -> Result<T, AppError> {
    value.ok_or_else(|| {
        AppError::Validation(format!(
            "{} strategy '{}' requires {what}",
            S::STAGE,
            strategy.name()
        ))
    })
}

struct ResolvedStage {
    stage: Stage,
    name: &'static str,
    strategy: Box<dyn Strategy>,
}

fn push_stage<S: StageStrategy>(
    stages: &mut Vec<ResolvedStage>,
    ctx: &StageContext,
) -> Result<(), AppError> {
    if let Some(selected) = resolve::<S>(&ctx.sut)? {
        stages.push(ResolvedStage {
            stage: S::STAGE,
            name: selected.name(),
            strategy: selected.build(ctx)?,
        });
    }
    Ok(())
}

fn check_stage<S: StageStrategy>(
    plan: &mut Vec<(Stage, &'static str)>,
    sut: &Sut,
) -> Result<(), AppError> {
    if let Some(selected) = resolve::<S>(sut)? {
        selected.check(sut)?;
        plan.push((S::STAGE, selected.name()));
    }
    Ok(())
}

/// Resolve every stage's strategy for a SUT and check it applies, without
/// workers or remote calls. Returns the plan `Pipeline::build` would produce.
pub fn validate_strategies(sut: &Sut) -> Result<Vec<(Stage, &'static str)>, AppError> {
    let mut plan = Vec::with_capacity(Stage::ALL.len());
    check_stage::<SutAuthenticationPopulation>(&mut plan, sut)?;
    check_stage::<SitesTreePopulation>(&mut plan, sut)?;
    check_stage::<EmissaryAuthentication>(&mut plan, sut)?;
    check_stage::<Spider>(&mut plan, sut)?;
    check_stage::<Scanners>(&mut plan, sut)?;
    check_stage::<Scanning>(&mut plan, sut)?;
    check_stage::<PostScanning>(&mut plan, sut)?;
    check_stage::<Reporting>(&mut plan, sut)?;
    Ok(plan)
}

pub struct Pipeline {
    session_id: String,
    stages: Vec<ResolvedStage>,
    state: Arc<SessionState>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("session_id", &self.session_id)
            .field("stages", &self.plan())
            .finish()
    }
}

impl Pipeline {
    /// Resolve and build every stage. No remote call is made.
    pub fn build(ctx: &StageContext) -> Result<Self, AppError> {
        let mut stages = Vec::with_capacity(Stage::ALL.len());
        push_stage::<SutAuthenticationPopulation>(&mut stages, ctx)?;
        push_stage::<SitesTreePopulation>(&mut stages, ctx)?;
        push_stage::<EmissaryAuthentication>(&mut stages, ctx)?;
        push_stage::<Spider>(&mut stages, ctx)?;
        push_stage::<Scanners>(&mut stages, ctx)?;
        push_stage::<Scanning>(&mut stages, ctx)?;
        push_stage::<PostScanning>(&mut stages, ctx)?;
        push_stage::<Reporting>(&mut stages, ctx)?;

        Ok(Self {
            session_id: ctx.session_id().to_string(),
            stages,
            state: ctx.state.clone(),
        })
    }

    /// The selected strategy per stage, in execution order.
    pub fn plan(&self) -> Vec<(Stage, &'static str)> {
        self.stages.iter().map(|s| (s.stage, s.name)).collect()
    }

    /// Run every stage in order, stopping at the first failure.
    pub async fn run(&self) -> Result<Verdict, AppError> {
        for resolved in &self.stages {
            tracing::info!(
                session_id = %self.session_id,
                stage = %resolved.stage,
                strategy = resolved.name,
                "Stage started"
            );
            resolved.strategy.run().await.map_err(|e| {
                tracing::error!(
                    session_id = %self.session_id,
                    stage = %resolved.stage,
                    strategy = resolved.name,
                    error = %e,
                    "Stage failed"
                );
                e.in_session(&self.session_id)
            })?;
            tracing::info!(
                session_id = %self.session_id,
                stage = %resolved.stage,
                "Stage complete"
            );
        }

        self.state.verdict().ok_or_else(|| {
            AppError::Internal(format!(
                "pipeline for session {} finished without a verdict",
                self.session_id
            ))
            .in_session(&self.session_id)
        })
    }
}
