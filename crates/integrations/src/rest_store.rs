//! Recovery store over a PostgREST endpoint.
//!
//! Tables: `recovery_sessions` (unique on checkout_id, step_id),
//! `discount_codes` (unique on code) and `ab_test_events` (serial `id`).

use crate::error::{IntegrationError, IntegrationResult};
use async_trait::async_trait;
use chrono::Utc;
use recovery_core::config::{RateLimitConfig, StoreConfig};
use recovery_core::store::rate_limit_breach;
use recovery_core::types::{
    AbEventType, AbTestEvent, AbTestResults, CodeHistoryEntry, DiscountCodeRecord, InsertOutcome,
    RecoverySessionRecord,
};
use recovery_core::{RecoveryResult, RecoveryStore};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const SESSIONS: &str = "recovery_sessions";
const DISCOUNT_CODES: &str = "discount_codes";
const AB_EVENTS: &str = "ab_test_events";
const HISTORY_LIMIT: &str = "100";
/// Must not exceed PostgREST's `max-rows` (1000 by default).
const EVENT_PAGE_SIZE: usize = 1000;

pub struct PostgRestStore {
    client: Client,
    base_url: String,
    api_key: String,
    event_page_size: usize,
}

impl PostgRestStore {
    pub fn new(config: &StoreConfig) -> IntegrationResult<Self> {
        let base_url = config
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| IntegrationError::Config("store.url is required".into()))?;
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| IntegrationError::Config("store.api_key is required".into()))?;
        url::Url::parse(base_url)
            .map_err(|e| IntegrationError::Config(format!("invalid store URL {base_url}: {e}")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        info!(base_url, "PostgREST store initialized");
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            event_page_size: EVENT_PAGE_SIZE,
        })
    }

    /// Rows requested per page when reading A/B events.
    pub fn with_event_page_size(mut self, size: usize) -> Self {
        self.event_page_size = size.max(1);
        self
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    fn table(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> IntegrationResult<Vec<T>> {
        let response = self
            .request(self.client.get(self.table(table)).query(query))
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Insert one row. A uniqueness violation comes back as `Duplicate`.
    async fn insert<T: Serialize>(&self, table: &str, row: &T) -> IntegrationResult<InsertOutcome> {
        let response = self
            .request(self.client.post(self.table(table)).json(row))
            .header("Prefer", "return=minimal")
            .send()
            .await?;
        match check_status(response).await {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(IntegrationError::Conflict(message)) => {
                debug!(table, message = %message, "Insert hit a uniqueness constraint");
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn code_history(&self, email: &str) -> IntegrationResult<Vec<CodeHistoryEntry>> {
        self.select(
            DISCOUNT_CODES,
            &[
                ("select", "created_at,redeemed_at".to_string()),
                ("email", format!("eq.{email}")),
                ("order", "created_at.desc".to_string()),
                ("limit", HISTORY_LIMIT.to_string()),
            ],
        )
        .await
    }

    /// Every A/B event row, paged by `id` until a short page comes back.
    async fn all_events(&self) -> IntegrationResult<Vec<EventRow>> {
        let mut rows = Vec::new();
        loop {
            let page: Vec<EventRow> = self
                .select(
                    AB_EVENTS,
                    &[
                        ("select", "test_id,variant_id,event_type,value".to_string()),
                        ("order", "id.asc".to_string()),
                        ("limit", self.event_page_size.to_string()),
                        ("offset", rows.len().to_string()),
                    ],
                )
                .await?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < self.event_page_size {
                break;
            }
        }
        debug!(rows = rows.len(), "A/B events fetched");
        Ok(rows)
    }
}

async fn check_status(response: Response) -> IntegrationResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status == StatusCode::CONFLICT {
        Err(IntegrationError::Conflict(response.text().await.unwrap_or_default()))
    } else if status == StatusCode::NOT_FOUND {
        Err(IntegrationError::NotFound(response.url().path().to_string()))
    } else {
        Err(IntegrationError::Api {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EventRow {
    test_id: String,
    variant_id: String,
    event_type: String,
    #[serde(default)]
    value: Option<f64>,
}

/// Fold raw event rows into per-variant counters. Unknown event types are skipped.
fn aggregate_events(rows: Vec<EventRow>) -> AbTestResults {
    let mut results = AbTestResults::new();
    for row in rows {
        let Some(event) = AbEventType::parse(&row.event_type) else {
            debug!(event_type = %row.event_type, "Skipping unknown A/B event type");
            continue;
        };
        results
            .entry(row.test_id)
            .or_default()
            .entry(row.variant_id)
            .or_default()
            .apply(event, row.value.unwrap_or(0.0));
    }
    results
}

#[async_trait]
impl RecoveryStore for PostgRestStore {
    async fn has_already_sent(&self, checkout_id: &str, step_id: &str) -> RecoveryResult<bool> {
        let rows: Vec<serde_json::Value> = self
            .select(
                SESSIONS,
                &[
                    ("select", "checkout_id".to_string()),
                    ("checkout_id", format!("eq.{checkout_id}")),
                    ("step_id", format!("eq.{step_id}")),
                    ("limit", "1".to_string()),
                ],
            )
            .await
            .map_err(IntegrationError::into_store_error)?;
        Ok(!rows.is_empty())
    }

    async fn check_discount_eligibility(
        &self,
        email: &str,
        limits: &RateLimitConfig,
    ) -> RecoveryResult<bool> {
        let history = self
            .code_history(email)
            .await
            .map_err(IntegrationError::into_store_error)?;
        match rate_limit_breach(limits, &history, Utc::now()) {
            Some(breach) => {
                debug!(reason = breach.as_str(), codes = history.len(), "Discount rate limit applies");
                Ok(false)
            }
            None => Ok(true),
        }
    }

    async fn log_discount_code(&self, record: &DiscountCodeRecord) -> RecoveryResult<InsertOutcome> {
        self.insert(DISCOUNT_CODES, record)
            .await
            .map_err(IntegrationError::into_store_error)
    }

    async fn log_recovery_session(
        &self,
        record: &RecoverySessionRecord,
    ) -> RecoveryResult<InsertOutcome> {
        self.insert(SESSIONS, record)
            .await
            .map_err(IntegrationError::into_store_error)
    }

    async fn log_ab_test_event(&self, event: &AbTestEvent) -> RecoveryResult<()> {
        match self.insert(AB_EVENTS, event).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(test_id = %event.test_id, error = %e, "Failed to log A/B event");
                Err(e.into_store_error())
            }
        }
    }

    async fn get_ab_test_results(&self) -> RecoveryResult<AbTestResults> {
        let rows = self
            .all_events()
            .await
            .map_err(IntegrationError::into_store_error)?;
        Ok(aggregate_events(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use recovery_core::types::{CustomerSegment, ProductCategory};
    use recovery_core::RecoveryError;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> PostgRestStore {
        PostgRestStore::new(&StoreConfig {
            enabled: true,
            url: Some(format!("{}/rest/v1", server.uri())),
            api_key: Some("service-key".into()),
            timeout_secs: 5,
        })
        .unwrap()
    }

    fn session() -> RecoverySessionRecord {
        RecoverySessionRecord {
            checkout_id: "1001".into(),
            step_id: "step_3_incentive".into(),
            step_index: 2,
            email: Some("a@example.com".into()),
            segment: CustomerSegment::ReturningCustomer,
            dominant_category: ProductCategory::Smokeshop,
            cart_value: 180.0,
            discount_percent: 25,
            free_shipping: false,
            discount_code: Some("COMEBACK-BACK-ABC234".into()),
            variants: Default::default(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_requires_url_and_key() {
        let missing = StoreConfig {
            enabled: true,
            url: None,
            api_key: Some("k".into()),
            timeout_secs: 5,
        };
        assert!(matches!(PostgRestStore::new(&missing), Err(IntegrationError::Config(_))));
    }

    #[tokio::test]
    async fn test_has_already_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/recovery_sessions"))
            .and(query_param("checkout_id", "eq.1001"))
            .and(query_param("step_id", "eq.step_1_reminder"))
            .and(header("apikey", "service-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "checkout_id": "1001" }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/recovery_sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let store = store(&server);
        assert!(store.has_already_sent("1001", "step_1_reminder").await.unwrap());
        assert!(!store.has_already_sent("1001", "step_2_social_proof").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_session_insert() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/recovery_sessions"))
            .and(header("Prefer", "return=minimal"))
            .respond_with(ResponseTemplate::new(201))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/recovery_sessions"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "code": "23505", "message": "duplicate key value violates unique constraint"
            })))
            .mount(&server)
            .await;

        let store = store(&server);
        assert_eq!(store.log_recovery_session(&session()).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.log_recovery_session(&session()).await.unwrap(), InsertOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_eligibility_uses_code_history() {
        let server = MockServer::start().await;
        let recent = (Utc::now() - ChronoDuration::days(3)).to_rfc3339();
        let older = (Utc::now() - ChronoDuration::days(12)).to_rfc3339();
        Mock::given(method("GET"))
            .and(path("/rest/v1/discount_codes"))
            .and(query_param("email", "eq.busy@example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "created_at": recent, "redeemed_at": null },
                { "created_at": older, "redeemed_at": null }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/discount_codes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let store = store(&server);
        let limits = RateLimitConfig::default();
        assert!(!store.check_discount_eligibility("busy@example.com", &limits).await.unwrap());
        assert!(store.check_discount_eligibility("fresh@example.com", &limits).await.unwrap());
    }

    #[tokio::test]
    async fn test_server_error_is_store_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let err = store(&server).has_already_sent("1", "s").await.unwrap_err();
        assert!(matches!(err, RecoveryError::Store(_)));
    }

    #[tokio::test]
    async fn test_ab_results_are_aggregated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/ab_test_events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "test_id": "cta_text_v1", "variant_id": "control", "event_type": "impression", "value": 0 },
                { "test_id": "cta_text_v1", "variant_id": "control", "event_type": "click", "value": null },
                { "test_id": "cta_text_v1", "variant_id": "return", "event_type": "conversion", "value": 72.5 },
                { "test_id": "cta_text_v1", "variant_id": "return", "event_type": "bounce", "value": 0 }
            ])))
            .mount(&server)
            .await;

        let results = store(&server).get_ab_test_results().await.unwrap();
        assert_eq!(results["cta_text_v1"]["control"].impressions, 1);
        assert_eq!(results["cta_text_v1"]["control"].clicks, 1);
        assert_eq!(results["cta_text_v1"]["return"].conversions, 1);
        assert_eq!(results["cta_text_v1"]["return"].revenue, 72.5);
    }

    #[tokio::test]
    async fn test_ab_results_read_every_page() {
        let server = MockServer::start().await;
        let impression = |variant: &str| {
            json!({ "test_id": "subject_line_v1", "variant_id": variant, "event_type": "impression", "value": 0 })
        };
        Mock::given(method("GET"))
            .and(path("/rest/v1/ab_test_events"))
            .and(query_param("order", "id.asc"))
            .and(query_param("limit", "2"))
            .and(query_param("offset", "0"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([impression("control"), impression("control")])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/ab_test_events"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([impression("urgency")])))
            .expect(1)
            .mount(&server)
            .await;

        let results = store(&server)
            .with_event_page_size(2)
            .get_ab_test_results()
            .await
            .unwrap();
        assert_eq!(results["subject_line_v1"]["control"].impressions, 2);
        assert_eq!(results["subject_line_v1"]["urgency"].impressions, 1);
    }
}
