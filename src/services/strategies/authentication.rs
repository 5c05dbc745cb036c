//! Teaching the Emissary how the session authenticates.
//!
//! Every strategy creates the session's context, scopes it to the SUT base
//! URL minus the excluded routes, creates the session user and forces all
//! Emissary traffic to run as that user. The strategies differ only in how
//! the user proves its identity.

use std::sync::Arc;

use async_trait::async_trait;

use super::{require, require_kind, Stage, StageContext, StageStrategy, Strategy};
use crate::errors::AppError;
use crate::models::job::SutKind;
use crate::models::sut::{Indicator, Sut};
use crate::services::emissary::EmissaryApi;
use crate::services::session_state::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmissaryAuthentication {
    FormStandard,
    BearerToken,
    NoAuthentication,
}

impl StageStrategy for EmissaryAuthentication {
    const STAGE: Stage = Stage::EmissaryAuthentication;
    const ALL: &'static [Self] = &[Self::FormStandard, Self::BearerToken, Self::NoAuthentication];

    fn name(&self) -> &'static str {
        match self {
            Self::FormStandard => "FormStandard",
            Self::BearerToken => "BearerToken",
            Self::NoAuthentication => "NoAuthentication",
        }
    }

    fn default_for(sut: &Sut) -> Option<Self> {
        Some(match sut.kind {
            SutKind::BrowserApp if sut.authentication.is_some() => Self::FormStandard,
            SutKind::Api if sut.bearer_token.is_some() => Self::BearerToken,
            _ => Self::NoAuthentication,
        })
    }

    fn check(&self, sut: &Sut) -> Result<(), AppError> {
        match self {
            Self::FormStandard => {
                require_kind(self, sut, SutKind::BrowserApp)?;
                require(self, sut.authentication.as_ref(), "sutAuthentication")?;
                require(self, sut.test_session.attributes.password.as_ref(), "a session password")?;
            }
            Self::BearerToken => {
                require_kind(self, sut, SutKind::Api)?;
                require(self, sut.bearer_token.as_ref(), "bearerToken")?;
            }
            Self::NoAuthentication => {}
        }
        Ok(())
    }

    fn build(&self, ctx: &StageContext) -> Result<Box<dyn Strategy>, AppError> {
        self.check(&ctx.sut)?;
        let base_url = ctx.sut.base_url();
        let method = match self {
            Self::FormStandard => {
                let form = require(self, ctx.sut.authentication.as_ref(), "sutAuthentication")?;
                let password = require(
                    self,
                    ctx.sut.test_session.attributes.password.as_deref(),
                    "a session password",
                )?;
                let login_url = format!("{base_url}{}", form.route);
                let login_request_data = format!(
                    "{}={{%username%}}&{}={{%password%}}",
                    form.username_field_locater, form.password_field_locater
                );
                LoginMethod::Form {
                    config: form_params(&[
                        ("loginUrl", login_url.as_str()),
                        ("loginRequestData", login_request_data.as_str()),
                    ])?,
                    credentials: form_params(&[
                        ("username", ctx.sut.test_session.attributes.username.as_str()),
                        ("password", password),
                    ])?,
                }
            }
            Self::BearerToken => {
                let token = require(self, ctx.sut.bearer_token.clone(), "bearerToken")?;
                LoginMethod::Bearer { token }
            }
            Self::NoAuthentication => LoginMethod::Manual,
        };

        Ok(Box::new(ContextLogin {
            emissary: ctx.emissary.clone(),
            state: ctx.state.clone(),
            context_name: ctx.sut.context.name.clone(),
            include: format!("^{}.*", regex::escape(&base_url)),
            exclude: ctx
                .sut
                .test_session
                .attributes
                .excluded_routes
                .iter()
                .map(|route| format!("^{}.*", regex::escape(&format!("{base_url}{route}"))))
                .collect(),
            username: ctx.sut.test_session.attributes.username.clone(),
            indicator: ctx.sut.indicator(),
            method,
        }))
    }
}

/// URL-encode `key=value` pairs the way the Emissary expects config params.
fn form_params(pairs: &[(&str, &str)]) -> Result<String, AppError> {
    let url = reqwest::Url::parse_with_params("http://localhost/", pairs)
        .map_err(|e| AppError::Internal(format!("failed to encode parameters: {e}")))?;
    Ok(url.query().unwrap_or_default().to_string())
}

#[derive(Debug)]
enum LoginMethod {
    Form { config: String, credentials: String },
    Bearer { token: String },
    Manual,
}

struct ContextLogin {
    emissary: Arc<dyn EmissaryApi>,
    state: Arc<SessionState>,
    context_name: String,
    include: String,
    exclude: Vec<String>,
    username: String,
    indicator: Option<Indicator>,
    method: LoginMethod,
}

#[async_trait]
impl Strategy for ContextLogin {
    async fn run(&self) -> Result<(), AppError> {
        let emissary = &self.emissary;

        let context_id = emissary.new_context(&self.context_name).await?;
        self.state.set_context_id(context_id.clone());
        emissary
            .include_in_context(&self.context_name, &self.include)
            .await?;
        for regex in &self.exclude {
            emissary.exclude_from_context(&self.context_name, regex).await?;
        }

        match &self.method {
            LoginMethod::Form { config, .. } => {
                emissary
                    .set_authentication_method(&context_id, "formBasedAuthentication", config)
                    .await?
            }
            LoginMethod::Bearer { .. } | LoginMethod::Manual => {
                emissary
                    .set_authentication_method(&context_id, "manualAuthentication", "")
                    .await?
            }
        }
        if let Some(indicator) = &self.indicator {
            emissary.set_indicator(&context_id, indicator).await?;
        }
        if let LoginMethod::Bearer { token } = &self.method {
            emissary
                .add_header_rule(
                    "Authorization header",
                    "Authorization",
                    &format!("Bearer {token}"),
                )
                .await?;
        }

        let user_id = emissary.new_user(&context_id, &self.username).await?;
        self.state.set_user_id(user_id.clone());
        if let LoginMethod::Form { credentials, .. } = &self.method {
            emissary
                .set_authentication_credentials(&context_id, &user_id, credentials)
                .await?;
        }
        emissary.set_user_enabled(&context_id, &user_id, true).await?;
        emissary.set_forced_user(&context_id, &user_id).await?;
        emissary.set_forced_user_mode_enabled(true).await?;

        tracing::info!(
            context = %self.context_name,
            context_id = %context_id,
            user_id = %user_id,
            "Emissary context and user established"
        );
        Ok(())
    }
}
