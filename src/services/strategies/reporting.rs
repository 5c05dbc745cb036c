use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{Stage, StageContext, StageStrategy, Strategy};
use crate::errors::AppError;
use crate::models::job::ReportFormat;
use crate::models::sut::Sut;
use crate::services::emissary::EmissaryApi;
use crate::services::session_state::SessionState;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H%M%S";

/// `report_appScannerId-<sessionId>_<timestamp>.<ext>`
pub fn report_file_name(session_id: &str, timestamp: &str, format: ReportFormat) -> String {
    format!(
        "report_appScannerId-{session_id}_{timestamp}.{}",
        format.extension()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reporting {
    Standard,
}

impl StageStrategy for Reporting {
    const STAGE: Stage = Stage::Reporting;
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
        Ok(Box::new(ReportWriter {
            emissary: ctx.emissary.clone(),
            state: ctx.state.clone(),
            session_id: ctx.session_id().to_string(),
            formats: ctx.sut.report_formats.clone(),
            report_dir: ctx.report_dir.clone(),
        }))
    }
}

struct ReportWriter {
    emissary: Arc<dyn EmissaryApi>,
    state: Arc<SessionState>,
    session_id: String,
    formats: Vec<ReportFormat>,
    report_dir: PathBuf,
}

#[async_trait]
impl Strategy for ReportWriter {
    async fn run(&self) -> Result<(), AppError> {
        if self.state.verdict().is_none() {
            return Err(AppError::Internal(
                "report requested before post-scan evaluation completed".to_string(),
            ));
        }

        tokio::fs::create_dir_all(&self.report_dir).await?;
        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        for format in &self.formats {
            let body = self.emissary.report(*format).await?;
            let path = self
                .report_dir
                .join(report_file_name(&self.session_id, &timestamp, *format));
            tokio::fs::write(&path, body).await?;
            tracing::info!(
                session_id = %self.session_id,
                path = %path.display(),
                "Report written"
            );
        }
        Ok(())
    }
}
