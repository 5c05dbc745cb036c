//! Active-scanner policy for the session.

use std::sync::Arc;

use async_trait::async_trait;

use super::{require_kind, Stage, StageContext, StageStrategy, Strategy};
use crate::errors::AppError;
use crate::models::job::{AlertThreshold, AttackStrength, SutKind};
use crate::models::sut::Sut;
use crate::services::emissary::EmissaryApi;

/// Scanner plugins that only make sense against a rendered browser UI:
/// DOM XSS, anti-CSRF tokens, anti-clickjacking header.
pub const BROWSER_ONLY_SCANNERS: &[&str] = &["40026", "10202", "10020"];

pub fn scan_policy_name(session_id: &str) -> String {
    format!("{session_id}-policy")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scanners {
    BrowserAppStandard,
    ApiStandard,
}

impl StageStrategy for Scanners {
    const STAGE: Stage = Stage::Scanners;
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
        let disabled: &'static [&'static str] = match self {
            Self::BrowserAppStandard => {
                &[]
            }
            Self::ApiStandard => {
                BROWSER_ONLY_SCANNERS
            }
        };
        let base_url = ctx.sut.base_url();
        let attributes = &ctx.sut.test_session.attributes;

        Ok(Box::new(ScanPolicySetup {
            emissary: ctx.emissary.clone(),
            policy_name: scan_policy_name(ctx.session_id()),
            attack_strength: attributes.a_scanner_attack_strength,
            alert_threshold: attributes.a_scanner_alert_threshold,
            excluded: attributes
                .excluded_routes
                .iter()
                .map(|route| format!("^{}.*", regex::escape(&format!("{base_url}{route}"))))
                .collect(),
            disabled,
        }))
    }
}

struct ScanPolicySetup {
    emissary: Arc<dyn EmissaryApi>,
    policy_name: String,
    attack_strength: AttackStrength,
    alert_threshold: AlertThreshold,
    excluded: Vec<String>,
    disabled: &'static [&'static str],
}

#[async_trait]
impl Strategy for ScanPolicySetup {
    async fn run(&self) -> Result<(), AppError> {
        self.emissary
            .add_scan_policy(&self.policy_name, self.attack_strength, self.alert_threshold)
            .await?;
        if !self.disabled.is_empty() {
            self.emissary
                .disable_scanners(self.disabled, &self.policy_name)
                .await?;
        }
        for regex in &self.excluded {
            self.emissary.exclude_from_scan(regex).await?;
        }
        tracing::info!(
            policy = %self.policy_name,
            attack_strength = %self.attack_strength,
            alert_threshold = %self.alert_threshold,
            "Scan policy configured"
        );
        Ok(())
    }
}
