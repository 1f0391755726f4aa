use crate::error::{RecoveryError, RecoveryResult};
use crate::types::{CustomerSegment, ProductCategory};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Root application configuration. Loaded from an optional TOML file
/// layered under environment variables with the prefix `CART_RECOVERY__`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub shopify: ShopifyConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub segments: SegmentsConfig,
    #[serde(default)]
    pub discounts: DiscountsConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub experiments: ExperimentsConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

// ─── Shopify Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopifyConfig {
    #[serde(default = "default_store_domain")]
    pub store_domain: String,
    /// Admin API token. Required unless running in report mode.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Fixed pause between consecutive Admin API calls.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for ShopifyConfig {
    fn default() -> Self {
        Self {
            store_domain: default_store_domain(),
            access_token: None,
            api_version: default_api_version(),
            request_delay_ms: default_request_delay_ms(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
        }
    }
}

// ─── Persistence Store Config ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub enabled: bool,
    /// PostgREST base URL, e.g. `https://xyz.supabase.co/rest/v1`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl StoreConfig {
    /// The store is only used when switched on and fully addressed.
    pub fn is_configured(&self) -> bool {
        self.enabled
            && self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
            && self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

// ─── Catalog Config ─────────────────────────────────────────────────────────

/// Where items land when neither vendor nor tags claim them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultCategoryPolicy {
    #[default]
    DefaultUnknown,
    DefaultToPrimaryCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: ProductCategory,
    /// Case-insensitive substrings matched against the line item vendor.
    #[serde(default)]
    pub vendors: Vec<String>,
    /// Case-insensitive exact matches against product tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Hard upper bound on discount percent for carts in this category.
    pub ceiling_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValueTier {
    pub name: String,
    pub min: f64,
    /// `None` for the open-ended top tier.
    #[serde(default)]
    pub max: Option<f64>,
}

impl ValueTier {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && self.max.map_or(true, |max| value < max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Tie-break winner for mixed carts and target of the primary default policy.
    #[serde(default = "default_primary_category")]
    pub primary_category: ProductCategory,
    #[serde(default)]
    pub default_policy: DefaultCategoryPolicy,
    #[serde(default = "default_category_rules")]
    pub categories: Vec<CategoryRule>,
    #[serde(default = "default_unknown_ceiling")]
    pub unknown_ceiling_percent: f64,
    #[serde(default = "default_value_tiers")]
    pub value_tiers: Vec<ValueTier>,
}

impl CatalogConfig {
    pub fn rule(&self, category: ProductCategory) -> Option<&CategoryRule> {
        self.categories.iter().find(|r| r.category == category)
    }

    pub fn ceiling_for(&self, category: ProductCategory) -> f64 {
        match category {
            ProductCategory::Unknown => self.unknown_ceiling_percent,
            other => self
                .rule(other)
                .map_or(self.unknown_ceiling_percent, |r| r.ceiling_percent),
        }
    }

    /// Category that unmatched items fall into under the configured policy.
    pub fn fallback_category(&self) -> ProductCategory {
        match self.default_policy {
            DefaultCategoryPolicy::DefaultUnknown => ProductCategory::Unknown,
            DefaultCategoryPolicy::DefaultToPrimaryCategory => self.primary_category,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            primary_category: default_primary_category(),
            default_policy: DefaultCategoryPolicy::default(),
            categories: default_category_rules(),
            unknown_ceiling_percent: default_unknown_ceiling(),
            value_tiers: default_value_tiers(),
        }
    }
}

// ─── Segments Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustTagRule {
    pub tag: String,
    pub segment: CustomerSegment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentProfile {
    pub segment: CustomerSegment,
    pub discount_multiplier: f64,
    /// Higher is more trusted. Informational, carried into the audit record.
    #[serde(default)]
    pub trust_level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentsConfig {
    /// Checked in order; the first tag the customer carries wins.
    #[serde(default = "default_trust_tags")]
    pub trust_tags: Vec<TrustTagRule>,
    #[serde(default = "default_wholesale_cart_threshold")]
    pub wholesale_cart_threshold: f64,
    #[serde(default = "default_loyal_min_orders")]
    pub loyal_min_orders: u32,
    #[serde(default = "default_loyal_min_spent")]
    pub loyal_min_spent: f64,
    #[serde(default = "default_at_risk_tags")]
    pub at_risk_tags: Vec<String>,
    #[serde(default = "default_returning_min_orders")]
    pub returning_min_orders: u32,
    #[serde(default = "default_segment_profiles")]
    pub profiles: Vec<SegmentProfile>,
}

impl SegmentsConfig {
    /// Multiplier for a segment; segments without a profile are left unscaled.
    pub fn multiplier(&self, segment: CustomerSegment) -> f64 {
        self.profiles
            .iter()
            .find(|p| p.segment == segment)
            .map_or(1.0, |p| p.discount_multiplier)
    }

    pub fn trust_level(&self, segment: CustomerSegment) -> u8 {
        self.profiles
            .iter()
            .find(|p| p.segment == segment)
            .map_or(0, |p| p.trust_level)
    }
}

impl Default for SegmentsConfig {
    fn default() -> Self {
        Self {
            trust_tags: default_trust_tags(),
            wholesale_cart_threshold: default_wholesale_cart_threshold(),
            loyal_min_orders: default_loyal_min_orders(),
            loyal_min_spent: default_loyal_min_spent(),
            at_risk_tags: default_at_risk_tags(),
            returning_min_orders: default_returning_min_orders(),
            profiles: default_segment_profiles(),
        }
    }
}

// ─── Discounts Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_codes_30d")]
    pub max_codes_30d: u32,
    #[serde(default = "default_max_codes_90d")]
    pub max_codes_90d: u32,
    #[serde(default = "default_redemption_cooldown_days")]
    pub redemption_cooldown_days: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_codes_30d: default_max_codes_30d(),
            max_codes_90d: default_max_codes_90d(),
            redemption_cooldown_days: default_redemption_cooldown_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscountsConfig {
    #[serde(default = "default_min_order_value")]
    pub min_order_value: f64,
    /// Value tiers that never earn a discount.
    #[serde(default = "default_no_discount_tiers")]
    pub no_discount_tiers: Vec<String>,
    #[serde(default = "default_excluded_segments")]
    pub excluded_segments: Vec<CustomerSegment>,
    #[serde(default = "default_code_prefix")]
    pub code_prefix: String,
    #[serde(default = "default_code_suffix_len")]
    pub code_suffix_len: usize,
    #[serde(default = "default_max_code_attempts")]
    pub max_code_attempts: u32,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Customer tag marking a previously issued code when no store is configured.
    #[serde(default = "default_legacy_issued_tag")]
    pub legacy_issued_tag: String,
    #[serde(default)]
    pub fail_open_when_store_unreachable: bool,
}

impl Default for DiscountsConfig {
    fn default() -> Self {
        Self {
            min_order_value: default_min_order_value(),
            no_discount_tiers: default_no_discount_tiers(),
            excluded_segments: default_excluded_segments(),
            code_prefix: default_code_prefix(),
            code_suffix_len: default_code_suffix_len(),
            max_code_attempts: default_max_code_attempts(),
            rate_limit: RateLimitConfig::default(),
            legacy_issued_tag: default_legacy_issued_tag(),
            fail_open_when_store_unreachable: false,
        }
    }
}

// ─── Sequence Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentStrategy {
    Reminder,
    SocialProof,
    Incentive,
    Urgency,
    LastChance,
}

impl ContentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStrategy::Reminder => "reminder",
            ContentStrategy::SocialProof => "social_proof",
            ContentStrategy::Incentive => "incentive",
            ContentStrategy::Urgency => "urgency",
            ContentStrategy::LastChance => "last_chance",
        }
    }
}

/// Base offer for one cart shape at one touchpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct OfferStep {
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub free_shipping: bool,
}

impl OfferStep {
    pub const NONE: OfferStep = OfferStep {
        percent: 0.0,
        free_shipping: false,
    };

    pub fn percent(percent: f64) -> Self {
        Self {
            percent,
            free_shipping: false,
        }
    }

    pub fn free_shipping() -> Self {
        Self {
            percent: 0.0,
            free_shipping: true,
        }
    }
}

/// Discount escalation for one touchpoint, keyed by the cart's dominant category.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EscalationTable {
    #[serde(default)]
    pub extraction: OfferStep,
    #[serde(default)]
    pub smokeshop: OfferStep,
    #[serde(default)]
    pub unknown: OfferStep,
    /// Used instead of the dominant category's entry when the cart is mixed.
    #[serde(default)]
    pub mixed: OfferStep,
}

impl EscalationTable {
    pub fn for_category(&self, category: ProductCategory) -> OfferStep {
        match category {
            ProductCategory::Extraction => self.extraction,
            ProductCategory::Smokeshop => self.smokeshop,
            ProductCategory::Unknown => self.unknown,
        }
    }

    pub fn lookup(&self, dominant: ProductCategory, is_mixed: bool) -> OfferStep {
        if is_mixed {
            self.mixed
        } else {
            self.for_category(dominant)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Touchpoint {
    pub id: String,
    /// Minimum minutes since abandonment before this touch may go out.
    pub delay_minutes: i64,
    pub strategy: ContentStrategy,
    #[serde(default)]
    pub escalation: EscalationTable,
    /// Lifetime of any code issued at this touch.
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: u32,
    /// Shared per-step code used instead of a generated one.
    #[serde(default)]
    pub fixed_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    #[serde(default = "default_touchpoints")]
    pub touchpoints: Vec<Touchpoint>,
    /// How far back to fetch abandoned checkouts.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            touchpoints: default_touchpoints(),
            lookback_days: default_lookback_days(),
        }
    }
}

// ─── Experiments Config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryMetric {
    OpenRate,
    ClickRate,
    ConversionRate,
    RevenuePerImpression,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbVariant {
    pub id: String,
    pub name: String,
    /// Element content, e.g. a subject line template.
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbTestConfig {
    pub id: String,
    /// Content element the test controls (`subject_line`, `cta_text`, ...).
    pub element: String,
    pub variants: Vec<AbVariant>,
    pub primary_metric: PrimaryMetric,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentsConfig {
    #[serde(default = "default_ab_tests")]
    pub tests: Vec<AbTestConfig>,
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: u64,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
}

impl Default for ExperimentsConfig {
    fn default() -> Self {
        Self {
            tests: default_ab_tests(),
            min_sample_size: default_min_sample_size(),
            confidence_level: default_confidence_level(),
        }
    }
}

// ─── Delivery Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    #[serde(default = "default_metafield_namespace")]
    pub metafield_namespace: String,
    #[serde(default = "default_store_name")]
    pub store_name: String,
    #[serde(default = "default_storefront_url")]
    pub storefront_url: String,
    #[serde(default = "default_support_email")]
    pub support_email: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            tag_prefix: default_tag_prefix(),
            metafield_namespace: default_metafield_namespace(),
            store_name: default_store_name(),
            storefront_url: default_storefront_url(),
            support_email: default_support_email(),
        }
    }
}

// Default functions
fn default_true() -> bool {
    true
}
fn default_store_domain() -> String {
    "oil-slick-pad.myshopify.com".to_string()
}
fn default_api_version() -> String {
    "2024-01".to_string()
}
fn default_request_delay_ms() -> u64 {
    500
}
fn default_max_retries() -> u32 {
    4
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_page_size() -> u32 {
    250
}
fn default_primary_category() -> ProductCategory {
    ProductCategory::Extraction
}
fn default_category_rules() -> Vec<CategoryRule> {
    vec![
        CategoryRule {
            category: ProductCategory::Smokeshop,
            vendors: vec!["What You Need".to_string(), "Cloud YHS".to_string()],
            tags: vec![
                "pillar:smokeshop-device".to_string(),
                "pillar:smokeshop-accessory".to_string(),
                "family:glass-bong".to_string(),
                "family:dab-rig".to_string(),
                "family:hand-pipe".to_string(),
            ],
            ceiling_percent: 35.0,
        },
        CategoryRule {
            category: ProductCategory::Extraction,
            vendors: vec!["Oil Slick".to_string()],
            tags: vec![
                "pillar:extraction-packaging".to_string(),
                "family:silicone-pad".to_string(),
                "family:parchment".to_string(),
                "family:concentrate-jar".to_string(),
            ],
            ceiling_percent: 15.0,
        },
    ]
}
fn default_unknown_ceiling() -> f64 {
    15.0
}
fn default_value_tiers() -> Vec<ValueTier> {
    let tier = |name: &str, min: f64, max: Option<f64>| ValueTier {
        name: name.to_string(),
        min,
        max,
    };
    vec![
        tier("micro", 0.0, Some(25.0)),
        tier("small", 25.0, Some(75.0)),
        tier("medium", 75.0, Some(150.0)),
        tier("large", 150.0, Some(300.0)),
        tier("premium", 300.0, None),
    ]
}
fn default_trust_tags() -> Vec<TrustTagRule> {
    vec![
        TrustTagRule {
            tag: "wholesale".to_string(),
            segment: CustomerSegment::WholesaleLead,
        },
        TrustTagRule {
            tag: "vip".to_string(),
            segment: CustomerSegment::LoyalCustomer,
        },
    ]
}
fn default_wholesale_cart_threshold() -> f64 {
    500.0
}
fn default_loyal_min_orders() -> u32 {
    5
}
fn default_loyal_min_spent() -> f64 {
    500.0
}
fn default_at_risk_tags() -> Vec<String> {
    vec!["at-risk".to_string(), "lapsed".to_string()]
}
fn default_returning_min_orders() -> u32 {
    1
}
fn default_segment_profiles() -> Vec<SegmentProfile> {
    let profile = |segment, discount_multiplier, trust_level| SegmentProfile {
        segment,
        discount_multiplier,
        trust_level,
    };
    vec![
        profile(CustomerSegment::NewVisitor, 1.0, 1),
        profile(CustomerSegment::NewCustomer, 1.0, 2),
        profile(CustomerSegment::ReturningCustomer, 1.0, 3),
        profile(CustomerSegment::LoyalCustomer, 0.5, 4),
        profile(CustomerSegment::WholesaleLead, 0.0, 5),
    ]
}
fn default_max_codes_30d() -> u32 {
    2
}
fn default_max_codes_90d() -> u32 {
    4
}
fn default_redemption_cooldown_days() -> u32 {
    30
}
fn default_min_order_value() -> f64 {
    20.0
}
fn default_no_discount_tiers() -> Vec<String> {
    vec!["micro".to_string()]
}
fn default_excluded_segments() -> Vec<CustomerSegment> {
    vec![CustomerSegment::WholesaleLead]
}
fn default_code_prefix() -> String {
    "COMEBACK".to_string()
}
fn default_code_suffix_len() -> usize {
    6
}
fn default_max_code_attempts() -> u32 {
    3
}
fn default_legacy_issued_tag() -> String {
    "cart-recovery-discount-issued".to_string()
}
fn default_expiry_hours() -> u32 {
    48
}
fn default_touchpoints() -> Vec<Touchpoint> {
    vec![
        Touchpoint {
            id: "step_1_reminder".to_string(),
            delay_minutes: 60,
            strategy: ContentStrategy::Reminder,
            escalation: EscalationTable::default(),
            expiry_hours: 0,
            fixed_code: None,
        },
        Touchpoint {
            id: "step_2_social_proof".to_string(),
            delay_minutes: 24 * 60,
            strategy: ContentStrategy::SocialProof,
            escalation: EscalationTable {
                extraction: OfferStep::free_shipping(),
                smokeshop: OfferStep::percent(10.0),
                unknown: OfferStep::percent(5.0),
                mixed: OfferStep::percent(10.0),
            },
            expiry_hours: 72,
            fixed_code: None,
        },
        Touchpoint {
            id: "step_3_incentive".to_string(),
            delay_minutes: 48 * 60,
            strategy: ContentStrategy::Incentive,
            escalation: EscalationTable {
                extraction: OfferStep::percent(10.0),
                smokeshop: OfferStep::percent(25.0),
                unknown: OfferStep::percent(10.0),
                mixed: OfferStep::percent(15.0),
            },
            expiry_hours: 48,
            fixed_code: None,
        },
        Touchpoint {
            id: "step_4_urgency".to_string(),
            delay_minutes: 72 * 60,
            strategy: ContentStrategy::Urgency,
            escalation: EscalationTable {
                extraction: OfferStep::percent(15.0),
                smokeshop: OfferStep::percent(30.0),
                unknown: OfferStep::percent(10.0),
                mixed: OfferStep::percent(15.0),
            },
            expiry_hours: 24,
            fixed_code: None,
        },
        Touchpoint {
            id: "step_5_last_chance".to_string(),
            delay_minutes: 7 * 24 * 60,
            strategy: ContentStrategy::LastChance,
            escalation: EscalationTable {
                extraction: OfferStep::percent(15.0),
                smokeshop: OfferStep::percent(35.0),
                unknown: OfferStep::percent(15.0),
                mixed: OfferStep::percent(15.0),
            },
            expiry_hours: 24,
            fixed_code: None,
        },
    ]
}
fn default_lookback_days() -> u32 {
    14
}
fn default_ab_tests() -> Vec<AbTestConfig> {
    let variant = |id: &str, name: &str, content: &str| AbVariant {
        id: id.to_string(),
        name: name.to_string(),
        content: content.to_string(),
    };
    vec![
        AbTestConfig {
            id: "subject_line_v1".to_string(),
            element: "subject_line".to_string(),
            variants: vec![
                variant("control", "Plain reminder", "You left something in your cart"),
                variant(
                    "personal",
                    "Personalized",
                    "{first_name}, your cart is still waiting",
                ),
            ],
            primary_metric: PrimaryMetric::OpenRate,
            active: true,
        },
        AbTestConfig {
            id: "cta_text_v1".to_string(),
            element: "cta_text".to_string(),
            variants: vec![
                variant("control", "Complete order", "Complete your order"),
                variant("return", "Return to cart", "Take me back to my cart"),
            ],
            primary_metric: PrimaryMetric::ClickRate,
            active: true,
        },
    ]
}
fn default_min_sample_size() -> u64 {
    100
}
fn default_confidence_level() -> f64 {
    0.95
}
fn default_tag_prefix() -> String {
    "cart-recovery".to_string()
}
fn default_metafield_namespace() -> String {
    "cart_recovery".to_string()
}
fn default_store_name() -> String {
    "Oil Slick".to_string()
}
fn default_storefront_url() -> String {
    "https://oilslickpad.com".to_string()
}
fn default_support_email() -> String {
    "support@oilslickpad.com".to_string()
}

impl AppConfig {
    /// Load from `config_path` (optional TOML, may be absent) and the environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = config_path {
            if path.exists() {
                debug!(path = %path.display(), "Loading config file");
            } else {
                debug!(path = %path.display(), "Config file not found; using defaults and environment");
            }
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("CART_RECOVERY")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("discounts.no_discount_tiers")
                .with_list_parse_key("segments.at_risk_tags"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Reject configurations the engines cannot run with. Returns non-fatal
    /// warnings for settings that work but are probably not what was meant.
    pub fn validate(&self) -> RecoveryResult<Vec<String>> {
        let touchpoints = &self.sequence.touchpoints;
        if touchpoints.is_empty() {
            return Err(RecoveryError::Config(
                "sequence.touchpoints must not be empty".into(),
            ));
        }
        for pair in touchpoints.windows(2) {
            if pair[1].delay_minutes <= pair[0].delay_minutes {
                return Err(RecoveryError::Config(format!(
                    "touchpoint '{}' must have a longer delay than '{}'",
                    pair[1].id, pair[0].id
                )));
            }
        }
        for (i, tp) in touchpoints.iter().enumerate() {
            if touchpoints[..i].iter().any(|other| other.id == tp.id) {
                return Err(RecoveryError::Config(format!(
                    "duplicate touchpoint id '{}'",
                    tp.id
                )));
            }
        }

        self.validate_value_tiers()?;

        let confidence = self.experiments.confidence_level;
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(RecoveryError::Config(format!(
                "experiments.confidence_level must be in (0, 1), got {confidence}"
            )));
        }
        if let Some(test) = self.experiments.tests.iter().find(|t| t.variants.is_empty()) {
            return Err(RecoveryError::Config(format!(
                "A/B test '{}' has no variants",
                test.id
            )));
        }
        if self.discounts.min_order_value < 0.0 {
            return Err(RecoveryError::Config(
                "discounts.min_order_value must not be negative".into(),
            ));
        }
        if self.discounts.max_code_attempts == 0 {
            return Err(RecoveryError::Config(
                "discounts.max_code_attempts must be at least 1".into(),
            ));
        }

        Ok(self.ceiling_warnings())
    }

    fn validate_value_tiers(&self) -> RecoveryResult<()> {
        let tiers = &self.catalog.value_tiers;
        let Some(first) = tiers.first() else {
            return Err(RecoveryError::Config(
                "catalog.value_tiers must not be empty".into(),
            ));
        };
        if first.min != 0.0 {
            return Err(RecoveryError::Config(format!(
                "value tier '{}' must start at 0",
                first.name
            )));
        }
        for pair in tiers.windows(2) {
            match pair[0].max {
                Some(max) if max == pair[1].min && max > pair[0].min => {}
                _ => {
                    return Err(RecoveryError::Config(format!(
                        "value tiers '{}' and '{}' are not contiguous",
                        pair[0].name, pair[1].name
                    )))
                }
            }
        }
        if let Some(last) = tiers.last() {
            if last.max.is_some() {
                return Err(RecoveryError::Config(format!(
                    "top value tier '{}' must have no upper bound",
                    last.name
                )));
            }
        }
        Ok(())
    }

    /// Escalation entries above their category ceiling. The ceiling still wins.
    fn ceiling_warnings(&self) -> Vec<String> {
        let catalog = &self.catalog;
        let mixed_ceiling = ProductCategory::PRIMARY
            .iter()
            .map(|c| catalog.ceiling_for(*c))
            .fold(f64::INFINITY, f64::min);

        let mut warnings = Vec::new();
        for tp in &self.sequence.touchpoints {
            for category in ProductCategory::ALL {
                let offer = tp.escalation.for_category(category);
                let ceiling = catalog.ceiling_for(category);
                if offer.percent > ceiling {
                    warnings.push(format!(
                        "touchpoint '{}' offers {}% for {} but the ceiling is {}%",
                        tp.id, offer.percent, category, ceiling
                    ));
                }
            }
            if tp.escalation.mixed.percent > mixed_ceiling {
                warnings.push(format!(
                    "touchpoint '{}' offers {}% for mixed carts but the lowest ceiling is {}%",
                    tp.id, tp.escalation.mixed.percent, mixed_ceiling
                ));
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid_without_warnings() {
        let config = AppConfig::default();
        let warnings = config.validate().unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = AppConfig::load(Some(Path::new("does-not-exist/cart-recovery.toml"))).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(config.sequence.touchpoints.len(), defaults.sequence.touchpoints.len());
        assert_eq!(config.discounts.code_prefix, defaults.discounts.code_prefix);
        assert_eq!(config.catalog.unknown_ceiling_percent, defaults.catalog.unknown_ceiling_percent);
    }

    #[test]
    fn test_default_ceilings() {
        let catalog = CatalogConfig::default();
        assert_eq!(catalog.ceiling_for(ProductCategory::Smokeshop), 35.0);
        assert_eq!(catalog.ceiling_for(ProductCategory::Extraction), 15.0);
        assert_eq!(catalog.ceiling_for(ProductCategory::Unknown), 15.0);
    }

    #[test]
    fn test_ceiling_smell_is_a_warning() {
        let mut config = AppConfig::default();
        config.sequence.touchpoints[4].escalation.smokeshop = OfferStep::percent(50.0);
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("step_5_last_chance"));
    }

    #[test]
    fn test_unsorted_touchpoints_rejected() {
        let mut config = AppConfig::default();
        config.sequence.touchpoints.swap(1, 2);
        assert!(matches!(config.validate(), Err(RecoveryError::Config(_))));
    }

    #[test]
    fn test_empty_schedule_rejected() {
        let mut config = AppConfig::default();
        config.sequence.touchpoints.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_value_tiers_must_be_contiguous_and_open_ended() {
        let mut config = AppConfig::default();
        config.catalog.value_tiers[1].min = 30.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.catalog.value_tiers[4].max = Some(10_000.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_confidence_level_bounds() {
        let mut config = AppConfig::default();
        config.experiments.confidence_level = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_requires_url_and_key() {
        let mut store = StoreConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(!store.is_configured());
        store.url = Some("https://db.example.com/rest/v1".into());
        store.api_key = Some("key".into());
        assert!(store.is_configured());
        store.enabled = false;
        assert!(!store.is_configured());
    }

    #[test]
    fn test_segment_multipliers() {
        let segments = SegmentsConfig::default();
        assert_eq!(segments.multiplier(CustomerSegment::LoyalCustomer), 0.5);
        assert_eq!(segments.multiplier(CustomerSegment::ReturningCustomer), 1.0);

        let empty = SegmentsConfig {
            profiles: Vec::new(),
            ..Default::default()
        };
        assert_eq!(empty.multiplier(CustomerSegment::LoyalCustomer), 1.0);
    }

    #[test]
    fn test_escalation_lookup_prefers_mixed_entry() {
        let table = &default_touchpoints()[2].escalation;
        assert_eq!(table.lookup(ProductCategory::Smokeshop, false).percent, 25.0);
        assert_eq!(table.lookup(ProductCategory::Smokeshop, true).percent, 15.0);
    }

    #[test]
    fn test_deserialize_partial_toml_shape() {
        let json = serde_json::json!({
            "discounts": { "min_order_value": 35.0 },
            "catalog": { "default_policy": "default_to_primary_category" }
        });
        let config: AppConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.discounts.min_order_value, 35.0);
        assert_eq!(config.discounts.code_prefix, "COMEBACK");
        assert_eq!(config.catalog.fallback_category(), ProductCategory::Extraction);
        assert_eq!(config.sequence.touchpoints.len(), 5);
    }
}
