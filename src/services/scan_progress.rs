//! Polling state machines over the Emissary's long-running scans.
//!
//! Both spider and active scans are fire-and-forget on the Emissary side. The
//! tracker issues the scan, then polls on a fixed interval until the status
//! reaches 100, the countdown budget runs out, or the Emissary stops
//! answering. A status that is missing or not an integer is treated as the
//! Emissary being unreachable and ends tracking immediately; it is never
//! retried.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::errors::AppError;
use crate::models::scan::{ProgressUpdate, ScanOperation, ScanOutcome};
use crate::services::emissary::{ActiveScanRequest, EmissaryApi, SpiderRequest};
use crate::services::polling::{ticker, Countdown};
use crate::services::publisher::{ProgressPublisher, EVENT_TESTER_PROGRESS};
use crate::services::session_state::SessionState;

/// Parse an Emissary status string into a 0–100 percentage.
pub fn parse_status(raw: Option<&str>) -> Option<u8> {
    raw?.trim().parse::<u8>().ok().filter(|s| *s <= 100)
}

/// `(sum of completed target percentages + current target percentage) / number of targets`.
pub fn percent_complete(completed_targets: usize, current_status: u8, total_targets: usize) -> u8 {
    if total_targets == 0 {
        return 100;
    }
    let sum = completed_targets * 100 + usize::from(current_status);
    (sum / total_targets).min(100) as u8
}

pub struct ScanTracker {
    emissary: Arc<dyn EmissaryApi>,
    publisher: Arc<dyn ProgressPublisher>,
    state: Arc<SessionState>,
    session_id: String,
    poll_interval: Duration,
}

impl ScanTracker {
    pub fn new(
        emissary: Arc<dyn EmissaryApi>,
        publisher: Arc<dyn ProgressPublisher>,
        state: Arc<SessionState>,
        session_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            emissary,
            publisher,
            state,
            session_id: session_id.into(),
            poll_interval,
        }
    }

    /// Issue one spider-as-user scan and wait for it to reach 100%.
    pub async fn spider(
        &self,
        request: &SpiderRequest,
        timeout: Duration,
    ) -> Result<ScanOperation, AppError> {
        let scan_id = self.emissary.spider_scan_as_user(request).await?;
        let mut op = ScanOperation::new(scan_id, &request.url);
        tracing::info!(
            session_id = %self.session_id,
            scan_id = %op.operation_id,
            target = %op.target,
            "Spider scan started"
        );

        let mut interval = ticker(self.poll_interval);
        let mut countdown = Countdown::new(timeout, self.poll_interval);
        loop {
            interval.tick().await;

            let raw = self
                .emissary
                .spider_status(&op.operation_id)
                .await
                .map_err(|e| self.terminal(&mut op, e))?;
            op.status = self.require_status(&mut op, raw.as_deref(), "spider")?;
            tracing::debug!(
                session_id = %self.session_id,
                scan_id = %op.operation_id,
                status = op.status,
                "Spider scan progress"
            );

            if op.is_complete() {
                op.outcome = Some(ScanOutcome::Completed);
                tracing::info!(
                    session_id = %self.session_id,
                    scan_id = %op.operation_id,
                    "Spider scan complete"
                );
                return Ok(op);
            }

            if countdown.elapse() {
                op.outcome = Some(ScanOutcome::TimedOut);
                return Err(AppError::Timeout(format!(
                    "spider scan {} of {} stalled at {}% after {}s",
                    op.operation_id,
                    op.target,
                    op.status,
                    timeout.as_secs()
                )));
            }
        }
    }

    /// Active-scan each target strictly one after another.
    ///
    /// Every tick publishes the aggregate percentage and the running alert
    /// count. A target's final alert count is added to the session total
    /// exactly once, when it reaches 100%.
    pub async fn active_scan(
        &self,
        requests: &[ActiveScanRequest],
        timeout_per_target: Duration,
    ) -> Result<Vec<ScanOperation>, AppError> {
        let total = requests.len();
        let mut completed = Vec::with_capacity(total);

        for (index, request) in requests.iter().enumerate() {
            let op = self
                .active_scan_target(request, index, total, timeout_per_target)
                .await?;
            let session_total = self.state.add_alerts(op.alert_count);
            tracing::info!(
                session_id = %self.session_id,
                scan_id = %op.operation_id,
                target = %op.target,
                target_alerts = op.alert_count,
                session_alerts = session_total,
                "Active scan of target complete"
            );
            completed.push(op);
        }

        Ok(completed)
    }

    async fn active_scan_target(
        &self,
        request: &ActiveScanRequest,
        index: usize,
        total: usize,
        timeout: Duration,
    ) -> Result<ScanOperation, AppError> {
        let scan_id = self.emissary.active_scan_as_user(request).await?;
        let mut op = ScanOperation::new(scan_id, &request.url);
        tracing::info!(
            session_id = %self.session_id,
            scan_id = %op.operation_id,
            target = %op.target,
            target_index = index,
            targets = total,
            "Active scan started"
        );

        let mut interval = ticker(self.poll_interval);
        let mut countdown = Countdown::new(timeout, self.poll_interval);
        loop {
            interval.tick().await;

            let raw = self
                .emissary
                .active_scan_status(&op.operation_id)
                .await
                .map_err(|e| self.terminal(&mut op, e))?;
            let alerts = self
                .emissary
                .active_scan_alert_count(&op.operation_id)
                .await
                .map_err(|e| self.terminal(&mut op, e))?;

            op.status = self.require_status(&mut op, raw.as_deref(), "active scan")?;
            if let Some(alerts) = alerts {
                op.alert_count = alerts;
            }

            let update = ProgressUpdate {
                percent_complete: percent_complete(index, op.status, total),
                alert_count: self.state.alert_total() + op.alert_count,
            };
            self.publisher
                .publish(&self.session_id, json!(update), EVENT_TESTER_PROGRESS)
                .await;

            if op.is_complete() {
                op.outcome = Some(ScanOutcome::Completed);
                return Ok(op);
            }

            if countdown.elapse() {
                op.outcome = Some(ScanOutcome::TimedOut);
                return Err(AppError::Timeout(format!(
                    "active scan {} of {} stalled at {}% after {}s",
                    op.operation_id,
                    op.target,
                    op.status,
                    timeout.as_secs()
                )));
            }
        }
    }

    fn require_status(
        &self,
        op: &mut ScanOperation,
        raw: Option<&str>,
        kind: &str,
    ) -> Result<u8, AppError> {
        parse_status(raw).ok_or_else(|| {
            op.outcome = Some(ScanOutcome::Unreachable);
            tracing::error!(
                session_id = %self.session_id,
                scan_id = %op.operation_id,
                raw_status = ?raw,
                "Emissary returned an undefined {kind} status"
            );
            AppError::emissary_unreachable(format!(
                "Emissary unreachable: {kind} {} returned an undefined status ({raw:?})",
                op.operation_id
            ))
        })
    }

    fn terminal(&self, op: &mut ScanOperation, error: AppError) -> AppError {
        if error.is_unreachable() {
            op.outcome = Some(ScanOutcome::Unreachable);
            tracing::error!(
                session_id = %self.session_id,
                scan_id = %op.operation_id,
                error = %error,
                "Emissary unreachable while polling"
            );
        }
        error
    }
}
