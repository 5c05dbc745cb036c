//! Turning the Emissary's alerts into a pass/fail verdict.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::scanners::BROWSER_ONLY_SCANNERS;
use super::{require_kind, Stage, StageContext, StageStrategy, Strategy};
use crate::errors::AppError;
use crate::models::job::SutKind;
use crate::models::scan::Verdict;
use crate::models::sut::Sut;
use crate::services::emissary::EmissaryApi;
use crate::services::publisher::{ProgressPublisher, EVENT_TESTER_MESSAGE};
use crate::services::session_state::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostScanning {
    BrowserAppStandard,
    ApiStandard,
}

impl StageStrategy for PostScanning {
    const STAGE: Stage = Stage::PostScanning;
    const ALL: &'static [Self] = &[Self::BrowserAppStandard, Self::ApiStandard];

    fn name(&self) -> &'static str {
        match self {
            Self::BrowserAppStandard => "BrowserAppStandard",
            Self::ApiStandard => "ApiStandard",
        }
    }

    fn default_for(sut: &Sut) -> Option<Self> {
        Some(match sut.kind {
            SutKind::BrowserApp => Self::BrowserAppStandard,
            SutKind::Api => Self::ApiStandard,
        })
    }

    fn check(&self, sut: &Sut) -> Result<(), AppError> {
        let kind = match self {
            Self::BrowserAppStandard => SutKind::BrowserApp,
            Self::ApiStandard => SutKind::Api,
        };
        require_kind(self, sut, kind)
    }

    fn build(&self, ctx: &StageContext) -> Result<Box<dyn Strategy>, AppError> {
        self.check(&ctx.sut)?;
        let ignored: &'static [&'static str] = match self {
            Self::BrowserAppStandard => {
                &[]
            }
            Self::ApiStandard => {
                BROWSER_ONLY_SCANNERS
            }
        };
        Ok(Box::new(AlertEvaluation {
            emissary: ctx.emissary.clone(),
            publisher: ctx.publisher.clone(),
            state: ctx.state.clone(),
            session_id: ctx.session_id().to_string(),
            base_url: ctx.sut.base_url(),
            alert_threshold: ctx.sut.test_session.attributes.alert_threshold,
            ignored,
        }))
    }
}

struct AlertEvaluation {
    emissary: Arc<dyn EmissaryApi>,
    publisher: Arc<dyn ProgressPublisher>,
    state: Arc<SessionState>,
    session_id: String,
    base_url: String,
    alert_threshold: u32,
    /// Plugin ids whose alerts do not count towards the verdict.
    ignored: &'static [&'static str],
}

#[async_trait]
impl Strategy for AlertEvaluation {
    async fn run(&self) -> Result<(), AppError> {
        // Counted afresh rather than from the running total published during
        // scanning: the Emissary dedupes alerts across scans and ignored
        // plugins are dropped here, so this count can be lower.
        let alerts = self.emissary.alerts(&self.base_url).await?;
        let counted = alerts
            .iter()
            .filter(|alert| !self.ignored.contains(&alert.plugin_id.as_str()))
            .count() as u64;

        let verdict = Verdict::evaluate(counted, self.alert_threshold);
        self.state.set_verdict(verdict);

        let message = if verdict.passed {
            format!(
                "Tester passed: {counted} alert(s) within the threshold of {}",
                self.alert_threshold
            )
        } else {
            format!(
                "Tester failure: {counted} alert(s) exceed the threshold of {}",
                self.alert_threshold
            )
        };
        tracing::info!(
            session_id = %self.session_id,
            alert_count = counted,
            alert_threshold = self.alert_threshold,
            passed = verdict.passed,
            "Post-scan evaluation complete"
        );
        self.publisher
            .publish(&self.session_id, json!({ "message": message }), EVENT_TESTER_MESSAGE)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::fixtures::{api_job, browser_app_job};
    use crate::services::emissary::testing::FakeEmissary;
    use crate::services::publisher::testing::RecordingPublisher;
    use crate::services::strategies::testing::context;

    async fn evaluate(job: crate::models::job::Job, alerts: usize) -> (Verdict, Vec<serde_json::Value>) {
        let dir = tempfile::tempdir().unwrap();
        let (sut, routes) = Sut::all_for_job(&job).remove(0);
        let kind = sut.kind;
        let emissary = Arc::new(FakeEmissary::new().with_alerts(alerts));
        let publisher = Arc::new(RecordingPublisher::default());
        let mut ctx = context(sut, routes, emissary, None, dir.path());
        ctx.publisher = publisher.clone();

        let strategy = PostScanning::default_for(&ctx.sut).unwrap();
        assert_eq!(strategy == PostScanning::ApiStandard, kind == SutKind::Api);
        strategy.build(&ctx).unwrap().run().await.unwrap();
        (
            ctx.state.verdict().unwrap(),
            publisher.events_named(EVENT_TESTER_MESSAGE),
        )
    }

    #[tokio::test]
    async fn alerts_within_threshold_pass() {
        let (verdict, messages) = evaluate(browser_app_job(), 12).await;
        assert!(verdict.passed);
        assert_eq!(verdict.alert_count, 12);
        assert_eq!(
            messages[0]["message"],
            "Tester passed: 12 alert(s) within the threshold of 12"
        );
    }

    #[tokio::test]
    async fn alerts_over_threshold_fail() {
        let (verdict, messages) = evaluate(api_job(), 1).await;
        assert!(!verdict.passed);
        assert!(messages[0]["message"]
            .as_str()
            .unwrap()
            .starts_with("Tester failure: 1 alert(s)"));
    }
}
