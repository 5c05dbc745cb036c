//! Getting the SUT's pages into the Emissary's sites tree before spidering.

use std::sync::Arc;

use async_trait::async_trait;

use super::{require, require_kind, StageContext, Stage, StageStrategy, Strategy};
use crate::errors::AppError;
use crate::models::job::{Route, SutAuthentication, SutKind};
use crate::models::sut::Sut;
use crate::services::browser::BrowserDriver;
use crate::services::emissary::EmissaryApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SutAuthenticationPopulation {
    FormStandard,
}

impl StageStrategy for SutAuthenticationPopulation {
    const STAGE: Stage = Stage::SitesTreeSutAuthenticationPopulation;
    const ALL: &'static [Self] = &[Self::FormStandard];

    fn name(&self) -> &'static str {
        match self {
            Self::FormStandard => "FormStandard",
        }
    }

    fn default_for(sut: &Sut) -> Option<Self> {
        (sut.kind == SutKind::BrowserApp && sut.authentication.is_some())
            .then_some(Self::FormStandard)
    }

    fn check(&self, sut: &Sut) -> Result<(), AppError> {
        require_kind(self, sut, SutKind::BrowserApp)?;
        require(self, sut.authentication.as_ref(), "sutAuthentication")?;
        require(self, sut.browser, "a browser")?;
        require(self, sut.test_session.attributes.password.as_ref(), "a session password")?;
        Ok(())
    }

    fn build(&self, ctx: &StageContext) -> Result<Box<dyn Strategy>, AppError> {
        self.check(&ctx.sut)?;
        let authentication = require(self, ctx.sut.authentication.clone(), "sutAuthentication")?;
        let browser = require(self, ctx.browser.clone(), "a browser sidecar")?;
        let attributes = &ctx.sut.test_session.attributes;
        let password = require(self, attributes.password.clone(), "a session password")?;

        Ok(Box::new(BrowserLogin {
            browser,
            login_url: format!("{}{}", ctx.sut.base_url(), authentication.route),
            username: attributes.username.clone(),
            password,
            authentication,
        }))
    }
}

/// Log in through the browser so authenticated pages enter the sites tree.
struct BrowserLogin {
    browser: Arc<dyn BrowserDriver>,
    login_url: String,
    username: String,
    password: String,
    authentication: SutAuthentication,
}

#[async_trait]
impl Strategy for BrowserLogin {
    async fn run(&self) -> Result<(), AppError> {
        let form = &self.authentication;
        self.browser.navigate(&self.login_url).await?;
        self.browser
            .type_into(&form.username_field_locater, &self.username)
            .await?;
        self.browser
            .type_into(&form.password_field_locater, &self.password)
            .await?;
        self.browser.click(&form.submit).await?;

        if let Some(expected) = &form.expected_page_source_success {
            let source = self.browser.page_source().await?;
            if !source.contains(expected.as_str()) {
                return Err(AppError::RemoteOperation {
                    service: "SUT".to_string(),
                    detail: format!(
                        "login at {} did not reach a page containing '{expected}'",
                        self.login_url
                    ),
                });
            }
        }
        tracing::info!(login_url = %self.login_url, "Browser logged in to SUT");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SitesTreePopulation {
    WebDriverStandard,
    ImportUrls,
    OpenApi,
}

impl StageStrategy for SitesTreePopulation {
    const STAGE: Stage = Stage::SitesTreePopulation;
    const ALL: &'static [Self] = &[Self::WebDriverStandard, Self::ImportUrls, Self::OpenApi];

    fn name(&self) -> &'static str {
        match self {
            Self::WebDriverStandard => "WebDriverStandard",
            Self::ImportUrls => "ImportUrls",
            Self::OpenApi => "OpenApi",
        }
    }

    fn default_for(sut: &Sut) -> Option<Self> {
        Some(match sut.kind {
            SutKind::BrowserApp => Self::WebDriverStandard,
            SutKind::Api if sut.open_api.is_some() => Self::OpenApi,
            SutKind::Api => Self::ImportUrls,
        })
    }

    fn check(&self, sut: &Sut) -> Result<(), AppError> {
        match self {
            Self::WebDriverStandard => {
                require_kind(self, sut, SutKind::BrowserApp)?;
                require(self, sut.browser, "a browser")?;
            }
            Self::ImportUrls => {}
            Self::OpenApi => {
                require_kind(self, sut, SutKind::Api)?;
                require(self, sut.open_api.as_ref(), "openApi.importUrl")?;
            }
        }
        Ok(())
    }

    fn build(&self, ctx: &StageContext) -> Result<Box<dyn Strategy>, AppError> {
        self.check(&ctx.sut)?;
        match self {
            Self::WebDriverStandard => {
                let browser = require(self, ctx.browser.clone(), "a browser sidecar")?;
                Ok(Box::new(BrowserWalk {
                    browser,
                    base_url: ctx.sut.base_url(),
                    routes: ctx.routes.clone(),
                }))
            }
            Self::ImportUrls => Ok(Box::new(UrlImport {
                emissary: ctx.emissary.clone(),
                urls: ctx.target_urls(),
            })),
            Self::OpenApi => {
                let source = require(self, ctx.sut.open_api.clone(), "openApi.importUrl")?;
                Ok(Box::new(OpenApiImport {
                    emissary: ctx.emissary.clone(),
                    import_url: source.import_url,
                    host_override: format!("{}:{}", ctx.sut.host, ctx.sut.port),
                }))
            }
        }
    }
}

/// Visit every route in the browser, filling and submitting its attack fields.
struct BrowserWalk {
    browser: Arc<dyn BrowserDriver>,
    base_url: String,
    routes: Vec<Route>,
}

#[async_trait]
impl Strategy for BrowserWalk {
    async fn run(&self) -> Result<(), AppError> {
        if self.routes.is_empty() {
            return self.browser.navigate(&self.base_url).await;
        }
        for route in &self.routes {
            self.browser
                .navigate(&format!("{}{}", self.base_url, route.id))
                .await?;
            for field in route.attributes.attack_fields.iter().filter(|f| f.visible) {
                self.browser.type_into(&field.name, &field.value).await?;
            }
            if let Some(submit) = &route.attributes.submit {
                self.browser.click(submit).await?;
            }
            tracing::debug!(route = %route.id, "Route populated through browser");
        }
        Ok(())
    }
}

struct UrlImport {
    emissary: Arc<dyn EmissaryApi>,
    urls: Vec<String>,
}

#[async_trait]
impl Strategy for UrlImport {
    async fn run(&self) -> Result<(), AppError> {
        for url in &self.urls {
            self.emissary.access_url(url).await?;
        }
        Ok(())
    }
}

struct OpenApiImport {
    emissary: Arc<dyn EmissaryApi>,
    import_url: String,
    host_override: String,
}

#[async_trait]
impl Strategy for OpenApiImport {
    async fn run(&self) -> Result<(), AppError> {
        self.emissary
            .import_open_api(&self.import_url, &self.host_override)
            .await?;
        tracing::info!(import_url = %self.import_url, "OpenAPI definition imported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::fixtures::{api_job, browser_app_job};
    use crate::services::browser::testing::FakeBrowser;
    use crate::services::emissary::testing::FakeEmissary;
    use crate::services::strategies::testing::context;

    #[tokio::test]
    async fn browser_login_fills_form_and_checks_landing_page() {
        let dir = tempfile::tempdir().unwrap();
        let (sut, routes) = Sut::all_for_job(&browser_app_job()).remove(0);
        let browser = Arc::new(FakeBrowser::with_page_source("<a>Log Out</a>"));
        let ctx = context(sut, routes, Arc::new(FakeEmissary::new()), Some(browser.clone()), dir.path());

        SutAuthenticationPopulation::FormStandard
            .build(&ctx)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(
            browser.calls(),
            vec![
                "navigate:http://pt-sut-cont:4000/login",
                "type:userName:user1",
                "type:password:User1_123",
                "click:btn btn-danger",
            ]
        );
    }

    #[tokio::test]
    async fn browser_login_fails_when_landing_page_lacks_marker() {
        let dir = tempfile::tempdir().unwrap();
        let (sut, routes) = Sut::all_for_job(&browser_app_job()).remove(0);
        let browser = Arc::new(FakeBrowser::with_page_source("Invalid password"));
        let ctx = context(sut, routes, Arc::new(FakeEmissary::new()), Some(browser), dir.path());

        let err = SutAuthenticationPopulation::FormStandard
            .build(&ctx)
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Log Out"));
    }

    #[tokio::test]
    async fn browser_walk_submits_visible_fields_per_route() {
        let dir = tempfile::tempdir().unwrap();
        let (sut, routes) = Sut::all_for_job(&browser_app_job()).remove(1);
        let browser = Arc::new(FakeBrowser::default());
        let ctx = context(sut, routes, Arc::new(FakeEmissary::new()), Some(browser.clone()), dir.path());

        SitesTreePopulation::WebDriverStandard
            .build(&ctx)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(
            browser.calls(),
            vec![
                "navigate:http://pt-sut-cont:4000/memos",
                "type:memo:PurpleMemo",
                "click:btn btn-primary",
            ]
        );
    }

    #[tokio::test]
    async fn open_api_import_overrides_host() {
        let dir = tempfile::tempdir().unwrap();
        let (sut, routes) = Sut::all_for_job(&api_job()).remove(0);
        let emissary = Arc::new(FakeEmissary::new());
        let ctx = context(sut, routes, emissary.clone(), None, dir.path());

        SitesTreePopulation::OpenApi.build(&ctx).unwrap().run().await.unwrap();
        assert_eq!(
            emissary.calls(),
            vec!["importOpenApi:https://pt-sut-api/openapi.json:pt-sut-api:443"]
        );
    }

    #[tokio::test]
    async fn import_urls_falls_back_to_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let (sut, routes) = Sut::all_for_job(&api_job()).remove(0);
        let emissary = Arc::new(FakeEmissary::new());
        let ctx = context(sut, routes, emissary.clone(), None, dir.path());

        SitesTreePopulation::ImportUrls.build(&ctx).unwrap().run().await.unwrap();
        assert_eq!(emissary.calls(), vec!["accessUrl:https://pt-sut-api:443"]);
    }

    #[test]
    fn open_api_is_not_applicable_to_browser_apps() {
        let dir = tempfile::tempdir().unwrap();
        let (sut, routes) = Sut::all_for_job(&browser_app_job()).remove(0);
        let ctx = context(sut, routes, Arc::new(FakeEmissary::new()), None, dir.path());
        let err = SitesTreePopulation::OpenApi.build(&ctx).err().unwrap();
        assert!(err.is_validation());
        assert!(err.to_string().contains("not applicable to this SUT (BrowserApp)"));
    }
}
