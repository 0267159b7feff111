//! Upsert sink: the narrow persistence interface and its Supabase binding.
//!
//! All three calls are batch upserts keyed on the natural identity of each
//! entity; conflicts update in place. The orchestrator guarantees
//! parent-before-child ordering, so the sink never sees a child whose
//! parent has not been resolved.

use crate::error::ScanError;
use crate::types::{ClassRow, Location, Organization};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;

/// Batch upsert interface consumed by the orchestrator.
#[async_trait]
pub trait UpsertSink: Send + Sync {
    /// Upsert keyed on `website_url`; returns the organization ref.
    async fn upsert_organization(&self, org: &Organization) -> Result<String, ScanError>;

    /// Upsert keyed on `(org_ref, name)`; returns name → ref.
    async fn upsert_locations(
        &self,
        org_ref: &str,
        locations: &[Location],
    ) -> Result<HashMap<String, String>, ScanError>;

    /// Upsert keyed on `(location_ref, start_instant_utc, name)`; returns the
    /// number of rows written.
    async fn upsert_classes(&self, classes: &[ClassRow]) -> Result<usize, ScanError>;
}

/// PostgREST-backed sink.
pub struct SupabaseSink {
    base_url: String,
    service_key: String,
    client: reqwest::Client,
}

impl SupabaseSink {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            client: reqwest::Client::new(),
        }
    }

    /// POST a batch upsert and return the representation rows.
    async fn upsert(
        &self,
        table: &str,
        on_conflict: &str,
        rows: serde_json::Value,
    ) -> Result<Vec<serde_json::Value>, ScanError> {
        let url = format!("{}/rest/v1/{table}?on_conflict={on_conflict}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&rows)
            .send()
            .await
            .map_err(|e| ScanError::PersistFailed(format!("{table}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ScanError::PersistFailed(format!(
                "{table}: {status}: {body}"
            )));
        }

        resp.json::<Vec<serde_json::Value>>()
            .await
            .map_err(|e| ScanError::PersistFailed(format!("{table}: bad representation: {e}")))
    }
}

fn row_ref(row: &serde_json::Value) -> Option<String> {
    row.get("id").map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[async_trait]
impl UpsertSink for SupabaseSink {
    async fn upsert_organization(&self, org: &Organization) -> Result<String, ScanError> {
        let rows = self
            .upsert(
                "organizations",
                "website_url",
                json!([{ "name": org.name, "website_url": org.website_url }]),
            )
            .await?;
        rows.first()
            .and_then(row_ref)
            .ok_or_else(|| ScanError::PersistFailed("organizations: no ref returned".into()))
    }

    async fn upsert_locations(
        &self,
        org_ref: &str,
        locations: &[Location],
    ) -> Result<HashMap<String, String>, ScanError> {
        if locations.is_empty() {
            return Ok(HashMap::new());
        }
        let payload: Vec<serde_json::Value> = locations
            .iter()
            .map(|l| {
                json!({
                    "organization_id": org_ref,
                    "name": l.name,
                    "address": l.address,
                    "iana_timezone": l.iana_timezone,
                })
            })
            .collect();

        let rows = self
            .upsert("locations", "organization_id,name", json!(payload))
            .await?;

        let mut refs = HashMap::new();
        for row in rows {
            let name = row.get("name").and_then(|v| v.as_str());
            if let (Some(name), Some(id)) = (name, row_ref(&row)) {
                refs.insert(name.to_string(), id);
            }
        }
        Ok(refs)
    }

    async fn upsert_classes(&self, classes: &[ClassRow]) -> Result<usize, ScanError> {
        if classes.is_empty() {
            return Ok(0);
        }
        let payload: Vec<serde_json::Value> = classes
            .iter()
            .map(|c| {
                json!({
                    "location_id": c.location_ref,
                    "name": c.name,
                    "start_instant": c.start_instant_utc,
                    "end_instant": c.end_instant_utc,
                    "instructor": c.instructor,
                    "spots_total": c.spots_total,
                })
            })
            .collect();

        let rows = self
            .upsert("classes", "location_id,start_instant,name", json!(payload))
            .await?;
        Ok(rows.len())
    }
}
