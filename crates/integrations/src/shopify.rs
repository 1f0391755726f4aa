//! Shopify Admin REST client.

use crate::error::{IntegrationError, IntegrationResult};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use recovery_core::config::ShopifyConfig;
use recovery_core::types::{Checkout, Customer, DiscountCode, DiscountCodeSpec, LineItem};
use recovery_core::{CommerceApi, ProductCatalog, RecoveryResult};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";
const DEFAULT_RETRY_AFTER_SECS: f64 = 2.0;

pub struct ShopifyClient {
    client: Client,
    base_url: String,
    access_token: String,
    request_delay: Duration,
    max_retries: u32,
    page_size: u32,
}

impl ShopifyClient {
    /// Client for `https://{store_domain}/admin/api/{api_version}`.
    pub fn new(config: &ShopifyConfig) -> IntegrationResult<Self> {
        let domain = config
            .store_domain
            .trim()
            .trim_start_matches("https://")
            .trim_end_matches('/');
        if domain.is_empty() {
            return Err(IntegrationError::Config("shopify.store_domain is empty".into()));
        }
        let base_url = format!("https://{}/admin/api/{}", domain, config.api_version);
        Self::with_base_url(&base_url, config)
    }

    /// Client against an explicit Admin API base URL.
    pub fn with_base_url(base_url: &str, config: &ShopifyConfig) -> IntegrationResult<Self> {
        let access_token = config
            .access_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| IntegrationError::Config("shopify.access_token is required".into()))?;
        url::Url::parse(base_url)
            .map_err(|e| IntegrationError::Config(format!("invalid Shopify URL {base_url}: {e}")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        info!(base_url, api_version = %config.api_version, "Shopify client initialized");
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
            request_delay: Duration::from_millis(config.request_delay_ms),
            max_retries: config.max_retries.max(1),
            page_size: config.page_size.clamp(1, 250),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send with the fixed inter-call delay, honoring 429 `Retry-After` and
    /// backing off `2^attempt` seconds on transport errors.
    async fn send(&self, build: impl Fn() -> RequestBuilder) -> IntegrationResult<Response> {
        let mut last_error = None;
        for attempt in 0..self.max_retries {
            if !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }
            match build()
                .header(ACCESS_TOKEN_HEADER, &self.access_token)
                .send()
                .await
            {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let wait = retry_after_secs(&response);
                    warn!(attempt, wait_secs = wait, "Shopify rate limit hit; backing off");
                    metrics::counter!("recovery.shopify_rate_limited").increment(1);
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(attempt, error = %e, "Shopify request failed");
                    last_error = Some(e);
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(1u64 << attempt.min(6))).await;
                    }
                }
            }
        }
        Err(match last_error {
            Some(e) => IntegrationError::Http(e),
            None => IntegrationError::Api {
                status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
                message: format!("rate limited after {} attempts", self.max_retries),
            },
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> IntegrationResult<T> {
        let url = self.url(path);
        let response = self.send(|| self.client.get(&url)).await?;
        self.handle_response(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> IntegrationResult<T> {
        let url = self.url(path);
        let response = self.send(|| self.client.post(&url).json(body)).await?;
        self.handle_response(response).await
    }

    async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> IntegrationResult<T> {
        let url = self.url(path);
        let response = self.send(|| self.client.put(&url).json(body)).await?;
        self.handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> IntegrationResult<T> {
        let status = response.status();

        if status.is_success() {
            Ok(response.json().await?)
        } else if status == StatusCode::NOT_FOUND {
            Err(IntegrationError::NotFound(response.url().path().to_string()))
        } else if status == StatusCode::CONFLICT {
            Err(IntegrationError::Conflict(response.text().await.unwrap_or_default()))
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(IntegrationError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// Every page of open checkouts updated since `since`, following `Link: rel="next"`.
    pub async fn list_abandoned_checkouts(&self, since: DateTime<Utc>) -> IntegrationResult<Vec<Checkout>> {
        let first = self.url("checkouts.json");
        let query = [
            ("limit", self.page_size.to_string()),
            ("status", "open".to_string()),
            ("updated_at_min", since.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ];

        let mut checkouts = Vec::new();
        let mut next: Option<String> = None;
        let mut page = 0u32;
        loop {
            let fetched = match next.as_deref() {
                None => self.fetch_checkout_page(|| self.client.get(&first).query(&query)).await,
                Some(url) => self.fetch_checkout_page(|| self.client.get(url)).await,
            };
            let (envelope, link) = match fetched {
                Ok(page) => page,
                // A failed later page keeps what was already fetched.
                Err(e) if page > 0 => {
                    warn!(page, error = %e, "Checkout page fetch failed; stopping pagination");
                    break;
                }
                Err(e) => return Err(e),
            };
            page += 1;
            debug!(page, count = envelope.checkouts.len(), "Fetched checkout page");

            checkouts.extend(
                envelope
                    .checkouts
                    .into_iter()
                    .filter(|c| c.completed_at.is_none())
                    .map(CheckoutDto::into_checkout),
            );

            match link.as_deref().and_then(next_page_url) {
                Some(url) => next = Some(url),
                None => break,
            }
        }
        info!(pages = page, checkouts = checkouts.len(), "Abandoned checkouts fetched");
        Ok(checkouts)
    }

    async fn fetch_checkout_page(
        &self,
        build: impl Fn() -> RequestBuilder,
    ) -> IntegrationResult<(CheckoutsEnvelope, Option<String>)> {
        let response = self.send(build).await?;
        let link = response
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let envelope = self.handle_response(response).await?;
        Ok((envelope, link))
    }

    pub async fn get_customer(&self, customer_id: u64) -> IntegrationResult<Option<Customer>> {
        match self
            .get::<CustomerEnvelope>(&format!("customers/{customer_id}.json"))
            .await
        {
            Ok(envelope) => Ok(Some(envelope.customer.into_customer())),
            Err(IntegrationError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn get_product_tags(&self, product_id: u64) -> IntegrationResult<Option<Vec<String>>> {
        match self
            .get::<ProductEnvelope>(&format!("products/{product_id}.json?fields=id,tags"))
            .await
        {
            Ok(envelope) => Ok(Some(split_tags(&envelope.product.tags))),
            Err(IntegrationError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Price rule first, then the code under it. A code the shop rejects
    /// as invalid or taken (422) yields `None`.
    pub async fn create_code(&self, spec: &DiscountCodeSpec) -> IntegrationResult<Option<DiscountCode>> {
        let body = PriceRuleEnvelope {
            price_rule: PriceRuleRequest::from_spec(spec),
        };
        let rule: PriceRuleCreated = match self.post("price_rules.json", &body).await {
            Ok(created) => created,
            Err(IntegrationError::Api { status: 422, message }) => {
                warn!(code = %spec.code, message = %message, "Price rule rejected");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let rule_id = rule.price_rule.id;

        let body = serde_json::json!({ "discount_code": { "code": spec.code } });
        let created: DiscountCodeCreated = match self
            .post(&format!("price_rules/{rule_id}/discount_codes.json"), &body)
            .await
        {
            Ok(created) => created,
            Err(IntegrationError::Api { status: 422, message }) => {
                warn!(code = %spec.code, rule_id, message = %message, "Discount code rejected");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        info!(code = %created.discount_code.code, rule_id, "Discount code created");
        Ok(Some(DiscountCode {
            code: created.discount_code.code,
            price_rule_id: Some(rule_id),
            discount_code_id: Some(created.discount_code.id),
        }))
    }

    /// Merge `tags` into the customer's tags. No write when nothing is new.
    pub async fn add_customer_tags(&self, customer_id: u64, tags: &[String]) -> IntegrationResult<()> {
        let envelope: CustomerEnvelope = self.get(&format!("customers/{customer_id}.json")).await?;
        let mut merged = split_tags(&envelope.customer.tags);
        let before = merged.len();
        for tag in tags {
            if !merged.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                merged.push(tag.clone());
            }
        }
        if merged.len() == before {
            return Ok(());
        }

        let body = serde_json::json!({
            "customer": { "id": customer_id, "tags": merged.join(", ") }
        });
        let _: serde_json::Value = self.put(&format!("customers/{customer_id}.json"), &body).await?;
        debug!(customer_id, added = merged.len() - before, "Customer tagged");
        Ok(())
    }

    pub async fn write_customer_metafield(
        &self,
        customer_id: u64,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> IntegrationResult<()> {
        let body = serde_json::json!({
            "metafield": {
                "namespace": namespace,
                "key": key,
                "type": "json",
                "value": value.to_string(),
            }
        });
        let _: serde_json::Value = self
            .post(&format!("customers/{customer_id}/metafields.json"), &body)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProductCatalog for ShopifyClient {
    async fn fetch_product_tags(&self, product_id: u64) -> RecoveryResult<Option<Vec<String>>> {
        Ok(self.get_product_tags(product_id).await?)
    }
}

#[async_trait]
impl CommerceApi for ShopifyClient {
    async fn fetch_abandoned_checkouts(&self, since: DateTime<Utc>) -> RecoveryResult<Vec<Checkout>> {
        Ok(self.list_abandoned_checkouts(since).await?)
    }

    async fn fetch_customer(&self, customer_id: u64) -> RecoveryResult<Option<Customer>> {
        Ok(self.get_customer(customer_id).await?)
    }

    async fn create_discount_code(&self, spec: &DiscountCodeSpec) -> RecoveryResult<Option<DiscountCode>> {
        Ok(self.create_code(spec).await?)
    }

    async fn tag_customer(&self, customer_id: u64, tags: &[String]) -> RecoveryResult<()> {
        Ok(self.add_customer_tags(customer_id, tags).await?)
    }

    async fn set_customer_metafield(
        &self,
        customer_id: u64,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> RecoveryResult<()> {
        Ok(self
            .write_customer_metafield(customer_id, namespace, key, value)
            .await?)
    }
}

fn retry_after_secs(response: &Response) -> f64 {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// URL of the `rel="next"` entry of a `Link` header.
pub fn next_page_url(link_header: &str) -> Option<String> {
    link_header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| {
            let p = p.trim();
            p == "rel=\"next\"" || p == "rel=next"
        });
        if is_next {
            Some(target.trim_start_matches('<').trim_end_matches('>').to_string())
        } else {
            None
        }
    })
}

/// Shopify stores tags as one comma-separated string.
pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Money arrives as a decimal string; accept numbers and nulls too.
fn de_money<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    })
}

// ─── Wire Types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CheckoutsEnvelope {
    #[serde(default)]
    checkouts: Vec<CheckoutDto>,
}

#[derive(Debug, Deserialize)]
struct CheckoutDto {
    id: u64,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    customer: Option<CustomerRef>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    abandoned_checkout_url: Option<String>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default, deserialize_with = "de_money")]
    subtotal_price: f64,
    #[serde(default)]
    line_items: Vec<LineItemDto>,
}

impl CheckoutDto {
    fn into_checkout(self) -> Checkout {
        Checkout {
            id: self.id.to_string(),
            token: self.token,
            email: self
                .email
                .filter(|e| !e.trim().is_empty())
                .or_else(|| self.customer.as_ref().and_then(|c| c.email.clone())),
            customer_id: self.customer.as_ref().map(|c| c.id),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            recovery_url: self.abandoned_checkout_url,
            currency: self.currency.unwrap_or_else(|| "USD".to_string()),
            subtotal: self.subtotal_price,
            line_items: self.line_items.into_iter().map(LineItemDto::into_line_item).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CustomerRef {
    id: u64,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineItemDto {
    #[serde(default)]
    product_id: Option<u64>,
    #[serde(default)]
    variant_id: Option<u64>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    quantity: u32,
    #[serde(default, deserialize_with = "de_money")]
    price: f64,
}

impl LineItemDto {
    fn into_line_item(self) -> LineItem {
        LineItem {
            product_id: self.product_id,
            variant_id: self.variant_id,
            title: self.title,
            vendor: self.vendor.filter(|v| !v.trim().is_empty()),
            quantity: self.quantity,
            price: self.price,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CustomerEnvelope {
    customer: CustomerDto,
}

#[derive(Debug, Deserialize)]
struct CustomerDto {
    id: u64,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    orders_count: u32,
    #[serde(default, deserialize_with = "de_money")]
    total_spent: f64,
    #[serde(default)]
    tags: String,
    #[serde(default)]
    state: Option<String>,
}

impl CustomerDto {
    fn into_customer(self) -> Customer {
        Customer {
            id: self.id,
            email: self.email,
            first_name: self.first_name,
            orders_count: self.orders_count,
            total_spent: self.total_spent,
            tags: split_tags(&self.tags),
            has_account: self.state.as_deref() == Some("enabled"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProductEnvelope {
    product: ProductDto,
}

#[derive(Debug, Deserialize)]
struct ProductDto {
    #[serde(default)]
    tags: String,
}

#[derive(Debug, Serialize)]
struct PriceRuleEnvelope {
    price_rule: PriceRuleRequest,
}

#[derive(Debug, Serialize)]
struct PriceRuleRequest {
    title: String,
    target_type: &'static str,
    target_selection: &'static str,
    allocation_method: &'static str,
    value_type: &'static str,
    value: String,
    customer_selection: &'static str,
    usage_limit: u32,
    once_per_customer: bool,
    starts_at: String,
    ends_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    prerequisite_subtotal_range: Option<SubtotalRange>,
}

#[derive(Debug, Serialize)]
struct SubtotalRange {
    greater_than_or_equal_to: String,
}

impl PriceRuleRequest {
    fn from_spec(spec: &DiscountCodeSpec) -> Self {
        let shipping_only = spec.free_shipping && spec.percent <= 0.0;
        let (target_type, allocation_method, value) = if shipping_only {
            ("shipping_line", "each", "-100.0".to_string())
        } else {
            ("line_item", "across", format!("-{:.1}", spec.percent))
        };
        Self {
            title: spec.title.clone(),
            target_type,
            target_selection: "all",
            allocation_method,
            value_type: "percentage",
            value,
            customer_selection: "all",
            usage_limit: spec.usage_limit,
            once_per_customer: true,
            starts_at: spec.starts_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ends_at: spec.ends_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            prerequisite_subtotal_range: spec.minimum_subtotal.map(|min| SubtotalRange {
                greater_than_or_equal_to: format!("{min:.2}"),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PriceRuleCreated {
    price_rule: IdOnly,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct DiscountCodeCreated {
    discount_code: DiscountCodeDto,
}

#[derive(Debug, Deserialize)]
struct DiscountCodeDto {
    id: u64,
    code: String,
}
