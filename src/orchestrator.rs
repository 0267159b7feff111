//! Nine-stage scan pipeline for a single URL.
//!
//! compliance → trap guard → fetch → plan → extract → validate → trap
//! content check → normalize → persist, with an optional parallel day
//! expansion at the end. Control branches once, at validation: a low
//! confidence with a retry hint buys exactly one refetch with altered
//! options; a second failure is recorded and the scan proceeds with what it
//! has.

use crate::browser::BrowserPool;
use crate::compliance::{self, Compliance};
use crate::config::Config;
use crate::dayworker;
use crate::error::ScanError;
use crate::extract::ExtractorFactory;
use crate::fetch::{FetchOptions, FetchResult, FetchService};
use crate::normalize;
use crate::planner::PagePlanner;
use crate::session::SessionManager;
use crate::sink::UpsertSink;
use crate::trap::TrapDetector;
use crate::types::{
    ClassRow, DayFetchResult, Location, Organization, Plan, RetryHint, ScanOutcome, ScrapeResult,
};
use crate::validate::validate;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

/// Idle window after a load-more click.
const LOAD_MORE_IDLE: Duration = Duration::from_secs(5);
/// Extra settle bought by a wait-longer retry.
const WAIT_LONGER_SETTLE: Duration = Duration::from_secs(5);
/// Name of the location synthesized for classes whose page never named one.
const DEFAULT_LOCATION_NAME: &str = "Main";

/// The pipeline and its collaborators.
pub struct Orchestrator {
    config: Arc<Config>,
    trap: Arc<TrapDetector>,
    session: Arc<SessionManager>,
    compliance: Arc<Compliance>,
    pool: Arc<BrowserPool>,
    fetcher: Arc<dyn FetchService>,
    factory: ExtractorFactory,
    planner: Option<Arc<dyn PagePlanner>>,
    sink: Arc<dyn UpsertSink>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        trap: Arc<TrapDetector>,
        session: Arc<SessionManager>,
        compliance: Arc<Compliance>,
        pool: Arc<BrowserPool>,
        fetcher: Arc<dyn FetchService>,
        planner: Option<Arc<dyn PagePlanner>>,
        sink: Arc<dyn UpsertSink>,
    ) -> Self {
        Self {
            config,
            trap,
            session,
            compliance,
            pool,
            fetcher,
            factory: ExtractorFactory::new(),
            planner,
            sink,
        }
    }

    /// Run the full pipeline against one URL.
    pub async fn scan(&self, url: &str, gym_timezone: &str) -> Result<ScanOutcome, ScanError> {
        let mut warnings: Vec<String> = Vec::new();

        // Stage 2: trap pre-check (stage 1, compliance, lives inside fetch).
        let verdict = self.trap.check_url(url);
        if !verdict.safe {
            return Err(ScanError::trap(
                url,
                verdict.reason.unwrap_or_else(|| "unsafe URL".into()),
            ));
        }

        // Stage 3: gate + fetch. Paywall and empty bodies are fatal.
        let mut fetch = self.fetcher.fetch(url, &FetchOptions::default()).await?;
        if let Some(fatal) = self.fatal_for(&fetch, url) {
            self.dispose(&mut fetch).await;
            return Err(fatal);
        }

        // Stage 4: plan, when a live page and a planner are both present.
        if fetch.lease.is_some() {
            if let Some(planner) = self.planner.clone() {
                let plan = planner
                    .plan_page(&fetch.body, url)
                    .await
                    .unwrap_or_else(|e| {
                        warnings.push(format!("planner failed: {e:#}"));
                        Plan::default()
                    });

                if plan.auth_wall_detected {
                    info!(url, "plan reports auth wall, re-authenticating");
                    self.session.reauthenticate(&self.pool, url).await?;
                    self.dispose(&mut fetch).await;
                    fetch = self
                        .fetcher
                        .fetch(url, &FetchOptions { force_browser: true, extra_settle: None })
                        .await?;
                    if let Some(fatal) = self.fatal_for(&fetch, url) {
                        self.dispose(&mut fetch).await;
                        return Err(fatal);
                    }
                } else if let Some(selector) = plan.load_more_selector.as_deref() {
                    if let Some(lease) = &fetch.lease {
                        match lease.click_and_settle(selector, LOAD_MORE_IDLE).await {
                            Ok(()) => {
                                if let Ok(html) = lease.html().await {
                                    fetch.body = html;
                                }
                            }
                            Err(e) => warnings.push(format!("load-more click failed: {e:#}")),
                        }
                    }
                }
            }
        }

        // Stage 5: extract via factory dispatch.
        let extractor = self.factory.for_page(&fetch.body, url);
        let mut result = extractor.extract(&fetch.body, url);

        // Stage 6: validate, with at most one hint-directed retry.
        let live_dom = match &fetch.lease {
            Some(lease) => lease.html().await.ok(),
            None => None,
        };
        let report = validate(&result, &fetch.body, live_dom.as_deref());
        info!(
            url,
            confidence = report.confidence,
            valid = report.valid,
            "validation"
        );

        if !report.valid {
            if let Some(hint) = report.retry_hint {
                warnings.push(format!(
                    "low confidence {:.2} ({}), retrying with {hint:?}",
                    report.confidence,
                    report.signals.join("; ")
                ));

                if hint == RetryHint::ReAuthenticate {
                    self.session.reauthenticate(&self.pool, url).await?;
                }
                let opts = FetchOptions {
                    force_browser: true,
                    extra_settle: (hint == RetryHint::WaitLonger).then_some(WAIT_LONGER_SETTLE),
                };

                self.dispose(&mut fetch).await;
                match self.fetcher.fetch(url, &opts).await {
                    Ok(refetched) => {
                        fetch = refetched;
                        if let Some(fatal) = self.fatal_for(&fetch, url) {
                            self.dispose(&mut fetch).await;
                            return Err(fatal);
                        }
                        let extractor = self.factory.for_page(&fetch.body, url);
                        result = extractor.extract(&fetch.body, url);

                        let live_dom = match &fetch.lease {
                            Some(lease) => lease.html().await.ok(),
                            None => None,
                        };
                        let second = validate(&result, &fetch.body, live_dom.as_deref());
                        if !second.valid {
                            warnings.push(format!(
                                "retry still below threshold ({:.2}), proceeding with current data",
                                second.confidence
                            ));
                        }
                    }
                    Err(e) => warnings.push(format!("retry fetch failed: {e}")),
                }
            } else {
                warnings.push(format!(
                    "low confidence {:.2} with no retry hint",
                    report.confidence
                ));
            }
        }

        // Stage 7: trap content check. A trip here is recorded, not fatal.
        let content_verdict = self
            .trap
            .check_content(url, &fetch.body, result.classes.len());
        if !content_verdict.safe {
            warnings.push(format!(
                "trap content check: {}",
                content_verdict.reason.unwrap_or_default()
            ));
        }

        // The lease has served extraction and validation; collect the
        // intercepted traffic for day expansion and release the context.
        let captured = fetch
            .lease
            .as_ref()
            .map(|lease| lease.captured_requests())
            .unwrap_or_default();
        self.dispose(&mut fetch).await;

        // Stages 8-9: normalize and persist, parents before children.
        let (org, locations, rows, mut norm_warnings) =
            self.normalize_result(&result, url, gym_timezone);
        warnings.append(&mut norm_warnings);

        let organization_ref = self.sink.upsert_organization(&org).await?;
        let location_refs = self
            .sink
            .upsert_locations(&organization_ref, &locations)
            .await?;
        let rows = assign_location_refs(rows, &location_refs);
        let mut classes_upserted = self.sink.upsert_classes(&rows).await?;

        // Optional parallel expansion over a discovered day pattern.
        let patterns = dayworker::discover_patterns(&captured);
        let day_replay = match patterns.first() {
            Some(pattern) => {
                let results = self.expand_week(pattern, url).await;
                classes_upserted += self
                    .persist_replayed_days(&results, url, gym_timezone, &location_refs, &mut warnings)
                    .await?;
                results
            }
            None => Vec::new(),
        };

        Ok(ScanOutcome {
            organization_ref,
            location_refs: location_refs.values().cloned().collect(),
            classes_upserted,
            warnings,
            day_replay,
        })
    }

    /// Paywall and empty-body checks shared by first fetch and retry.
    fn fatal_for(&self, fetch: &FetchResult, url: &str) -> Option<ScanError> {
        if compliance::is_paywall(fetch.status) {
            return Some(ScanError::Paywall(url.to_string()));
        }
        if fetch.body.trim().is_empty() {
            return Some(ScanError::transport(format!("empty body from {url}")));
        }
        None
    }

    async fn dispose(&self, fetch: &mut FetchResult) {
        if let Some(lease) = fetch.lease.take() {
            lease.dispose().await;
        }
    }

    /// Map raw classes to UTC rows. Normalization failures keep the raw
    /// value out of the sink and leave a warning instead.
    fn normalize_result(
        &self,
        result: &ScrapeResult,
        url: &str,
        gym_timezone: &str,
    ) -> (Organization, Vec<Location>, Vec<PendingRow>, Vec<String>) {
        let mut warnings = Vec::new();
        let reference = Utc::now();

        let org = result.organization.clone().unwrap_or_else(|| Organization {
            name: Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(String::from))
                .unwrap_or_else(|| url.to_string()),
            website_url: url.to_string(),
        });

        let mut locations = result.locations.clone();
        let needs_default = result.classes.iter().any(|c| c.location_name.is_none())
            || locations.is_empty();
        if needs_default && !locations.iter().any(|l| l.name == DEFAULT_LOCATION_NAME) {
            locations.push(Location {
                name: DEFAULT_LOCATION_NAME.to_string(),
                address: None,
                iana_timezone: gym_timezone.to_string(),
            });
        }

        let zone_by_name: HashMap<&str, &str> = locations
            .iter()
            .map(|l| (l.name.as_str(), l.iana_timezone.as_str()))
            .collect();

        let mut rows = Vec::new();
        for class in &result.classes {
            let location_name = class
                .location_name
                .clone()
                .unwrap_or_else(|| DEFAULT_LOCATION_NAME.to_string());
            let tz = zone_by_name
                .get(location_name.as_str())
                .copied()
                .unwrap_or(gym_timezone);

            let start = match normalize::normalize(&class.start_raw, tz, reference) {
                Ok(n) => {
                    if let Some(w) = n.warning {
                        warnings.push(w);
                    }
                    n.instant
                }
                Err(e) => {
                    warnings.push(format!(
                        "dropping class {:?}: start {:?} not normalizable: {e}",
                        class.name, class.start_raw
                    ));
                    continue;
                }
            };
            let end = class.end_raw.as_deref().and_then(|raw| {
                match normalize::normalize(raw, tz, reference) {
                    Ok(n) => Some(n.instant),
                    Err(e) => {
                        warnings.push(format!(
                            "class {:?}: end {raw:?} not normalizable: {e}",
                            class.name
                        ));
                        None
                    }
                }
            });

            rows.push(PendingRow {
                location_name,
                row: ClassRow {
                    location_ref: String::new(),
                    name: class.name.clone(),
                    start_instant_utc: start,
                    end_instant_utc: end,
                    instructor: class.instructor.clone(),
                    spots_total: class.spots_total,
                },
            });
        }

        (org, locations, rows, warnings)
    }

    /// Replay the discovered pattern across the coming week.
    async fn expand_week(
        &self,
        pattern: &crate::types::DayApiPattern,
        url: &str,
    ) -> Vec<DayFetchResult> {
        let week_start = Utc::now().date_naive();
        let limiter = self.compliance.api_limiter_for(url);
        let cookie_header = self.session.cookie_header();
        info!(url, template = %pattern.url_template, "replaying week via discovered pattern");
        dayworker::fetch_week_parallel(
            pattern,
            week_start,
            cookie_header,
            limiter,
            self.config.fetch_timeout_ms,
        )
        .await
    }

    /// Extract and persist classes from replayed day payloads that carry
    /// renderable schedule markup. JSON payloads without markup are left to
    /// the per-day warnings.
    async fn persist_replayed_days(
        &self,
        results: &[DayFetchResult],
        url: &str,
        gym_timezone: &str,
        location_refs: &HashMap<String, String>,
        warnings: &mut Vec<String>,
    ) -> Result<usize, ScanError> {
        let mut extra_rows = Vec::new();
        for day in results {
            if !day.success {
                warnings.push(format!("day {} replay failed (status {})", day.date, day.status));
                continue;
            }
            let Some(body) = day.body.as_deref() else {
                continue;
            };
            if !body.contains('<') {
                continue;
            }
            let extractor = self.factory.for_page(body, url);
            let day_result = extractor.extract(body, url);
            let (_, _, rows, mut norm_warnings) =
                self.normalize_result(&day_result, url, gym_timezone);
            warnings.append(&mut norm_warnings);
            extra_rows.extend(rows);
        }

        if extra_rows.is_empty() {
            return Ok(0);
        }
        let rows = assign_location_refs(extra_rows, location_refs);
        self.sink.upsert_classes(&rows).await
    }
}

/// A class row waiting for its location ref.
struct PendingRow {
    location_name: String,
    row: ClassRow,
}

/// Attach location refs; rows whose location never resolved fall back to
/// the default location's ref when one exists.
fn assign_location_refs(rows: Vec<PendingRow>, refs: &HashMap<String, String>) -> Vec<ClassRow> {
    let default_ref = refs.get(DEFAULT_LOCATION_NAME);
    rows.into_iter()
        .filter_map(|pending| {
            let location_ref = refs
                .get(&pending.location_name)
                .or(default_ref)?
                .clone();
            Some(ClassRow {
                location_ref,
                ..pending.row
            })
        })
        .collect()
}
