//! robots.txt fetching and evaluation.
//!
//! One fetch per host with a 5-second timeout. Per RFC 9309, an unreachable
//! file or any 4xx/5xx answer means the host is unrestricted. Rules are
//! evaluated longest-path-match first; Allow wins length ties.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

const ROBOTS_TIMEOUT: Duration = Duration::from_secs(5);

/// One parsed rule: `(allow, path_prefix)`.
#[derive(Debug, Clone)]
struct Rule {
    allow: bool,
    path: String,
}

/// The effective policy for one host: the rule group that best matched our
/// user agent token, or no rules at all (unrestricted).
#[derive(Debug, Default)]
pub struct RobotsPolicy {
    rules: Vec<Rule>,
}

impl RobotsPolicy {
    /// Parse robots.txt content, keeping the group that best matches
    /// `ua_token` (falling back to the `*` group).
    pub fn parse(content: &str, ua_token: &str) -> Self {
        let token_lower = ua_token.to_lowercase();

        // group agent-names -> rules, in file order
        let mut groups: Vec<(Vec<String>, Vec<Rule>)> = Vec::new();
        let mut pending_agents: Vec<String> = Vec::new();
        let mut in_rules = false;

        for raw_line in content.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim().to_string();

            match key.as_str() {
                "user-agent" => {
                    if in_rules {
                        pending_agents.clear();
                        in_rules = false;
                    }
                    pending_agents.push(value.to_lowercase());
                }
                "allow" | "disallow" => {
                    if !pending_agents.is_empty() {
                        if !in_rules {
                            groups.push((pending_agents.clone(), Vec::new()));
                            in_rules = true;
                        }
                        if !value.is_empty() {
                            if let Some((_, rules)) = groups.last_mut() {
                                rules.push(Rule {
                                    allow: key == "allow",
                                    path: value,
                                });
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // Pick the group with the longest agent token contained in ours;
        // "*" matches with length 0.
        let mut best: Option<(usize, &Vec<Rule>)> = None;
        for (agents, rules) in &groups {
            for agent in agents {
                let score = if agent == "*" {
                    Some(0)
                } else if token_lower.contains(agent.as_str()) {
                    Some(agent.len())
                } else {
                    None
                };
                if let Some(score) = score {
                    if best.map_or(true, |(s, _)| score >= s) {
                        best = Some((score, rules));
                    }
                }
            }
        }

        Self {
            rules: best.map(|(_, r)| r.clone()).unwrap_or_default(),
        }
    }

    /// Unrestricted policy, used on fetch failure or error statuses.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Longest-match evaluation; Allow wins ties; no match means allowed.
    pub fn is_allowed(&self, path: &str) -> bool {
        let mut verdict = true;
        let mut best_len = 0usize;
        for rule in &self.rules {
            if path.starts_with(&rule.path) {
                let len = rule.path.len();
                if len > best_len || (len == best_len && rule.allow) {
                    best_len = len;
                    verdict = rule.allow;
                }
            }
        }
        verdict
    }
}

/// Lazy per-host robots cache. Policies are fetched at most once per host
/// and retained for the process lifetime or until `reset`.
pub struct RobotsCache {
    client: reqwest::Client,
    ua_token: String,
    policies: Mutex<HashMap<String, Arc<RobotsPolicy>>>,
}

impl RobotsCache {
    pub fn new(bot_user_agent: &str) -> Self {
        // Product token only: "MilesC-GymBot/1.0 (+url)" -> "MilesC-GymBot".
        let ua_token = bot_user_agent
            .split(['/', ' '])
            .next()
            .unwrap_or(bot_user_agent)
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(ROBOTS_TIMEOUT)
            .user_agent(bot_user_agent)
            .build()
            .unwrap_or_default();

        Self {
            client,
            ua_token,
            policies: Mutex::new(HashMap::new()),
        }
    }

    /// Whether our agent may fetch this URL. Unparseable URLs are denied.
    pub async fn is_allowed(&self, raw_url: &str) -> bool {
        let Ok(url) = Url::parse(raw_url) else {
            return false;
        };
        let Some(host) = url.host_str().map(String::from) else {
            return false;
        };

        // Holding the map lock through the fetch serializes lookups for a
        // host so the file is fetched at most once.
        let mut policies = self.policies.lock().await;
        if !policies.contains_key(&host) {
            let policy = self.fetch_policy(&url, &host).await;
            policies.insert(host.clone(), Arc::new(policy));
        }
        let policy = Arc::clone(policies.get(&host).expect("just inserted"));
        drop(policies);

        policy.is_allowed(url.path())
    }

    async fn fetch_policy(&self, url: &Url, host: &str) -> RobotsPolicy {
        let robots_url = format!("{}://{}/robots.txt", url.scheme(), host);
        match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body = resp.text().await.unwrap_or_default();
                RobotsPolicy::parse(&body, &self.ua_token)
            }
            Ok(resp) => {
                debug!(host, status = resp.status().as_u16(), "robots.txt unavailable, unrestricted");
                RobotsPolicy::unrestricted()
            }
            Err(err) => {
                debug!(host, %err, "robots.txt fetch failed, unrestricted");
                RobotsPolicy::unrestricted()
            }
        }
    }

    /// Drop all cached policies.
    pub async fn reset(&self) {
        self.policies.lock().await.clear();
    }
}
