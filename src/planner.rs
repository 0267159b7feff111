//! Page planners: decide where the schedule lives and how to advance it.
//!
//! The selector planner is always available and costs nothing. The LLM
//! planner is an optional collaborator gated by an API key and a cumulative
//! spend budget; when the key is absent or the budget is exhausted, the core
//! runs on common selectors alone.

use crate::types::Plan;
use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Plans a rendered page from its captured HTML.
#[async_trait]
pub trait PagePlanner: Send + Sync {
    async fn plan_page(&self, html: &str, url: &str) -> Result<Plan>;

    /// Login form selectors for pages where the common list fails.
    /// Default: no opinion.
    async fn login_selectors(&self, _html: &str) -> Option<LoginSelectors> {
        None
    }
}

/// Selector triple for a login form.
#[derive(Debug, Clone)]
pub struct LoginSelectors {
    pub username: String,
    pub password: String,
    pub submit: String,
}

/// Deterministic planner over common schedule and auth markup.
pub struct SelectorPlanner;

const SCHEDULE_SELECTORS: &[&str] = &[
    ".schedule",
    ".class-schedule",
    "#schedule",
    "[class*=\"schedule\"]",
    "table",
];

const NEXT_SELECTORS: &[&str] = &[
    "a[rel=\"next\"]",
    "button[aria-label*=\"next\" i]",
    "a[aria-label*=\"next\" i]",
    ".next:not(.disabled)",
];

const LOAD_MORE_SELECTORS: &[&str] = &[
    "button[class*=\"load-more\"]",
    "button[class*=\"loadmore\"]",
    "a[class*=\"load-more\"]",
    "button[data-load-more]",
];

#[async_trait]
impl PagePlanner for SelectorPlanner {
    async fn plan_page(&self, html: &str, _url: &str) -> Result<Plan> {
        let document = Html::parse_document(html);

        let first_present = |candidates: &[&str]| -> Option<String> {
            candidates.iter().find_map(|s| {
                let sel = Selector::parse(s).ok()?;
                document.select(&sel).next().map(|_| (*s).to_string())
            })
        };

        let auth_wall_detected = Selector::parse("input[type=\"password\"]")
            .map(|sel| document.select(&sel).next().is_some())
            .unwrap_or(false);

        Ok(Plan {
            schedule_selector: first_present(SCHEDULE_SELECTORS),
            next_button_selector: first_present(NEXT_SELECTORS),
            load_more_selector: first_present(LOAD_MORE_SELECTORS),
            auth_wall_detected,
        })
    }
}

/// Budget-gated LLM planner. Falls back to the selector planner on any
/// failure or once the spend cap is reached.
pub struct LlmPlanner {
    api_key: String,
    budget_cents: u32,
    spent_cents: AtomicU32,
    client: reqwest::Client,
    fallback: SelectorPlanner,
}

/// Rough per-call cost used for budget accounting.
const PLAN_CALL_COST_CENTS: u32 = 2;

impl LlmPlanner {
    pub fn new(api_key: String, budget_cents: u32) -> Self {
        Self {
            api_key,
            budget_cents,
            spent_cents: AtomicU32::new(0),
            client: reqwest::Client::new(),
            fallback: SelectorPlanner,
        }
    }

    fn try_spend(&self) -> bool {
        loop {
            let spent = self.spent_cents.load(Ordering::Acquire);
            if spent + PLAN_CALL_COST_CENTS > self.budget_cents {
                return false;
            }
            if self
                .spent_cents
                .compare_exchange(
                    spent,
                    spent + PLAN_CALL_COST_CENTS,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn spent_cents(&self) -> u32 {
        self.spent_cents.load(Ordering::Acquire)
    }

    async fn ask_model(&self, html: &str, url: &str) -> Result<Plan> {
        // Trim the document: the model only needs the structural skeleton.
        let excerpt: String = html.chars().take(12_000).collect();

        let body = serde_json::json!({
            "model": "gpt-4o-mini",
            "response_format": {"type": "json_object"},
            "messages": [
                {
                    "role": "system",
                    "content": "You identify schedule widgets in gym web pages. \
                                Reply with JSON: {\"schedule_selector\": string|null, \
                                \"next_button_selector\": string|null, \
                                \"load_more_selector\": string|null, \
                                \"auth_wall_detected\": bool}."
                },
                {
                    "role": "user",
                    "content": format!("URL: {url}\n\nHTML:\n{excerpt}")
                }
            ]
        });

        let resp = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("planner request failed")?;

        let payload: serde_json::Value = resp.json().await.context("planner response not JSON")?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .context("planner response missing content")?;

        let plan: Plan = serde_json::from_str(content).context("planner emitted invalid plan")?;
        Ok(plan)
    }
}

#[async_trait]
impl PagePlanner for LlmPlanner {
    async fn plan_page(&self, html: &str, url: &str) -> Result<Plan> {
        if !self.try_spend() {
            debug!("planner budget exhausted, using selector planner");
            return self.fallback.plan_page(html, url).await;
        }
        match self.ask_model(html, url).await {
            Ok(plan) => Ok(plan),
            Err(err) => {
                debug!(%err, "LLM plan failed, using selector planner");
                self.fallback.plan_page(html, url).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_selector_planner_finds_schedule() {
        let html = r#"<html><body><div class="class-schedule"><p>Mon 6pm</p></div></body></html>"#;
        let plan = SelectorPlanner.plan_page(html, "https://x.example/").await.unwrap();
        assert!(plan.schedule_selector.is_some());
        assert!(!plan.auth_wall_detected);
    }

    #[tokio::test]
    async fn test_selector_planner_detects_auth_wall() {
        let html = r#"<html><body><input type="password"/></body></html>"#;
        let plan = SelectorPlanner.plan_page(html, "https://x.example/").await.unwrap();
        assert!(plan.auth_wall_detected);
    }

    #[tokio::test]
    async fn test_selector_planner_finds_load_more() {
        let html = r#"<html><body><button class="btn load-more">Load more</button></body></html>"#;
        let plan = SelectorPlanner.plan_page(html, "https://x.example/").await.unwrap();
        assert!(plan.load_more_selector.is_some());
    }

    #[test]
    fn test_budget_counter_caps_spend() {
        let planner = LlmPlanner::new("sk-test".into(), 5);
        assert!(planner.try_spend()); // 2
        assert!(planner.try_spend()); // 4
        assert!(!planner.try_spend()); // would be 6 > 5
        assert_eq!(planner.spent_cents(), 4);
    }
}
