use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Stage, StageContext, StageStrategy, Strategy};
use crate::errors::AppError;
use crate::models::job::SutKind;
use crate::models::sut::Sut;
use crate::services::emissary::SpiderRequest;
use crate::services::scan_progress::ScanTracker;
use crate::services::session_state::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spider {
    Standard,
}

impl StageStrategy for Spider {
    const STAGE: Stage = Stage::Spider;
    const ALL: &'static [Self] = &[Self::Standard];

    fn name(&self) -> &'static str {
        match self {
            Self::Standard => "Standard",
        }
    }

    fn default_for(_: &Sut) -> Option<Self> {
        Some(Self::Standard)
    }

    fn build(&self, ctx: &StageContext) -> Result<Box<dyn Strategy>, AppError> {
        let subtree_only = match ctx.sut.kind {
            SutKind::Api => ctx.settings.spider_subtree_only_api,
            SutKind::BrowserApp => ctx.settings.spider_subtree_only_browser_app,
        };
        Ok(Box::new(SpiderAsUser {
            tracker: ctx.tracker(),
            state: ctx.state.clone(),
            targets: ctx.target_urls(),
            max_children: ctx.settings.spider_max_children,
            subtree_only,
            timeout: ctx.settings.spider_timeout(),
        }))
    }
}

/// Spider each target as the session user, one at a time.
struct SpiderAsUser {
    tracker: ScanTracker,
    state: Arc<SessionState>,
    targets: Vec<String>,
    max_children: u32,
    subtree_only: bool,
    timeout: Duration,
}

#[async_trait]
impl Strategy for SpiderAsUser {
    async fn run(&self) -> Result<(), AppError> {
        let context_id = self.state.context_id()?;
        let user_id = self.state.user_id()?;
        for url in &self.targets {
            let request = SpiderRequest {
                context_id: context_id.clone(),
                user_id: user_id.clone(),
                url: url.clone(),
                max_children: self.max_children,
                recurse: true,
                subtree_only: self.subtree_only,
            };
            self.tracker.spider(&request, self.timeout).await?;
        }
        Ok(())
    }
}
