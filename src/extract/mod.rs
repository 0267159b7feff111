//! Scraper dispatch: substring signatures → extractor, with a generic
//! fallback.
//!
//! Dispatch is a linear rule list evaluated in priority order against the
//! page HTML and URL; no reflection, no plugin loading. Each site extractor
//! knows the DOM its platform renders and falls back to the generic passes
//! when the expected selectors are absent.

pub mod generic;

use crate::types::ScrapeResult;
use std::sync::Arc;

/// One page-to-entities extractor.
pub trait ScheduleExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, html: &str, url: &str) -> ScrapeResult;
}

/// Fallback extractor using the generic selector and line-scan passes.
pub struct GenericExtractor;

impl ScheduleExtractor for GenericExtractor {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn extract(&self, html: &str, url: &str) -> ScrapeResult {
        generic::extract(html, url)
    }
}

/// Mindbody / Healcode widget schedules.
pub struct MindbodyExtractor;

impl ScheduleExtractor for MindbodyExtractor {
    fn name(&self) -> &'static str {
        "mindbody"
    }

    fn extract(&self, html: &str, url: &str) -> ScrapeResult {
        generic::extract_with_selectors(
            html,
            url,
            ".bw-session",
            ".bw-session__name",
            ".bw-session__time",
            ".bw-session__staff",
        )
    }
}

/// Zen Planner calendar pages.
pub struct ZenPlannerExtractor;

impl ScheduleExtractor for ZenPlannerExtractor {
    fn name(&self) -> &'static str {
        "zenplanner"
    }

    fn extract(&self, html: &str, url: &str) -> ScrapeResult {
        generic::extract_with_selectors(
            html,
            url,
            ".calendar-event, .class-row",
            ".event-name, .class-name",
            ".event-time, .class-time",
            ".event-instructor, .class-instructor",
        )
    }
}

/// Wodify class schedules.
pub struct WodifyExtractor;

impl ScheduleExtractor for WodifyExtractor {
    fn name(&self) -> &'static str {
        "wodify"
    }

    fn extract(&self, html: &str, url: &str) -> ScrapeResult {
        generic::extract_with_selectors(
            html,
            url,
            ".class-schedule-row, .ClassSchedule tr",
            ".class-title, .program-name",
            ".class-time, .start-time",
            ".coach-name, .coach",
        )
    }
}

/// Priority-ordered dispatch table.
pub struct ExtractorFactory {
    rules: Vec<(&'static [&'static str], Arc<dyn ScheduleExtractor>)>,
    fallback: Arc<dyn ScheduleExtractor>,
}

impl Default for ExtractorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractorFactory {
    pub fn new() -> Self {
        Self {
            rules: vec![
                (
                    &["healcode", "mindbody", "brandedweb"],
                    Arc::new(MindbodyExtractor),
                ),
                (&["zenplanner"], Arc::new(ZenPlannerExtractor)),
                (&["wodify"], Arc::new(WodifyExtractor)),
            ],
            fallback: Arc::new(GenericExtractor),
        }
    }

    /// Choose the first extractor whose signature appears in the HTML or the
    /// URL, falling back to the generic extractor.
    pub fn for_page(&self, html: &str, url: &str) -> Arc<dyn ScheduleExtractor> {
        let haystack_url = url.to_lowercase();
        let haystack_html = html.to_lowercase();
        for (signatures, extractor) in &self.rules {
            if signatures
                .iter()
                .any(|sig| haystack_url.contains(sig) || haystack_html.contains(sig))
            {
                return Arc::clone(extractor);
            }
        }
        Arc::clone(&self.fallback)
    }
}
