use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::scanners::scan_policy_name;
use super::{require_kind, Stage, StageContext, StageStrategy, Strategy};
use crate::errors::AppError;
use crate::models::job::SutKind;
use crate::models::sut::Sut;
use crate::services::emissary::ActiveScanRequest;
use crate::services::publisher::{ProgressPublisher, EVENT_TESTER_MESSAGE};
use crate::services::scan_progress::ScanTracker;
use crate::services::session_state::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scanning {
    BrowserAppStandard,
    ApiStandard,
}

/// One active-scan target: where, and how the request is replayed.
#[derive(Debug, Clone, PartialEq)]
struct ScanTarget {
    url: String,
    method: String,
    post_data: Option<String>,
}

impl StageStrategy for Scanning {
    const STAGE: Stage = Stage::Scanning;
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
        let with_body = match self {
            Self::BrowserAppStandard => {
                true
            }
            Self::ApiStandard => {
                false
            }
        };

        let base_url = ctx.sut.base_url();
        let targets = if ctx.routes.is_empty() {
            vec![ScanTarget {
                url: base_url,
                method: "GET".to_string(),
                post_data: None,
            }]
        } else {
            ctx.routes
                .iter()
                .map(|route| ScanTarget {
                    url: format!("{base_url}{}", route.id),
                    method: route.attributes.method.to_ascii_uppercase(),
                    post_data: (with_body && route.is_post()).then(|| route.post_data()),
                })
                .collect()
        };

        Ok(Box::new(ActiveScanAsUser {
            tracker: ctx.tracker(),
            state: ctx.state.clone(),
            publisher: ctx.publisher.clone(),
            session_id: ctx.session_id().to_string(),
            policy_name: scan_policy_name(ctx.session_id()),
            targets,
            timeout: ctx.settings.scan_timeout(),
        }))
    }
}

struct ActiveScanAsUser {
    tracker: ScanTracker,
    state: Arc<SessionState>,
    publisher: Arc<dyn ProgressPublisher>,
    session_id: String,
    policy_name: String,
    targets: Vec<ScanTarget>,
    timeout: Duration,
}

#[async_trait]
impl Strategy for ActiveScanAsUser {
    async fn run(&self) -> Result<(), AppError> {
        let context_id = self.state.context_id()?;
        let user_id = self.state.user_id()?;
        let requests: Vec<_> = self
            .targets
            .iter()
            .map(|target| ActiveScanRequest {
                context_id: context_id.clone(),
                user_id: user_id.clone(),
                url: target.url.clone(),
                recurse: true,
                scan_policy_name: self.policy_name.clone(),
                method: target.method.clone(),
                post_data: target.post_data.clone(),
            })
            .collect();

        let completed = self.tracker.active_scan(&requests, self.timeout).await?;
        let message = format!(
            "Active scanning complete: {} target(s), {} alert(s) raised",
            completed.len(),
            self.state.alert_total()
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

    #[tokio::test(start_paused = true)]
    async fn browser_app_replays_post_routes_with_attack_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (sut, routes) = Sut::all_for_job(&browser_app_job()).remove(0);
        let emissary = Arc::new(
            FakeEmissary::new()
                .with_scan_tick("100", 2)
                .with_scan_tick("100", 1),
        );
        let publisher = Arc::new(RecordingPublisher::default());
        let mut ctx = context(sut, routes, emissary.clone(), None, dir.path());
        ctx.publisher = publisher.clone();
        ctx.state.set_context_id("1");
        ctx.state.set_user_id("5");

        Scanning::BrowserAppStandard.build(&ctx).unwrap().run().await.unwrap();

        assert_eq!(
            emissary.calls_starting_with("activeScanAsUser"),
            vec![
                "activeScanAsUser:POST:http://pt-sut-cont:4000/profile",
                "activeScanAsUser:POST:http://pt-sut-cont:4000/memos",
            ]
        );
        assert_eq!(ctx.state.alert_total(), 3);
        let messages = publisher.events_named(EVENT_TESTER_MESSAGE);
        assert_eq!(
            messages[0]["message"],
            "Active scanning complete: 2 target(s), 3 alert(s) raised"
        );
    }

    #[test]
    fn scanning_variant_must_match_sut() {
        let dir = tempfile::tempdir().unwrap();
        let (sut, routes) = Sut::all_for_job(&browser_app_job()).remove(1);
        let ctx = context(sut, routes, Arc::new(FakeEmissary::new()), None, dir.path());
        assert!(Scanning::BrowserAppStandard.build(&ctx).is_ok());
        assert!(Scanning::ApiStandard.build(&ctx).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn api_without_routes_scans_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let (sut, routes) = Sut::all_for_job(&api_job()).remove(0);
        let emissary = Arc::new(FakeEmissary::new());
        let ctx = context(sut, routes, emissary.clone(), None, dir.path());
        ctx.state.set_context_id("1");
        ctx.state.set_user_id("5");

        Scanning::ApiStandard.build(&ctx).unwrap().run().await.unwrap();
        assert_eq!(
            emissary.calls_starting_with("activeScanAsUser"),
            vec!["activeScanAsUser:GET:https://pt-sut-api:443"]
        );
    }
}
