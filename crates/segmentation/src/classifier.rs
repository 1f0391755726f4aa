//! Cart classifier: assigns every line item to a product category and
//! aggregates the cart into per-category buckets, a value tier, and a
//! dominant category.

use async_trait::async_trait;
use recovery_core::config::CatalogConfig;
use recovery_core::types::{LineItem, ProductCategory};
use recovery_core::{ProductCatalog, RecoveryResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// How a line item's category was decided.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Vendor,
    Tag,
    Default,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CategoryBucket {
    pub items: Vec<LineItem>,
    pub subtotal: f64,
    /// Sum of quantities.
    pub item_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifiedItem {
    pub title: String,
    pub category: ProductCategory,
    pub source: MatchSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CartAnalysis {
    pub total_value: f64,
    pub item_count: u32,
    /// One bucket per known category, including `Unknown`, even when empty.
    pub buckets: BTreeMap<ProductCategory, CategoryBucket>,
    pub dominant_category: ProductCategory,
    pub is_mixed_cart: bool,
    pub value_tier: String,
    pub highest_price_item: Option<LineItem>,
    pub average_item_price: f64,
    pub classified: Vec<ClassifiedItem>,
}

impl CartAnalysis {
    pub fn subtotal(&self, category: ProductCategory) -> f64 {
        self.buckets.get(&category).map_or(0.0, |b| b.subtotal)
    }
}

/// Catalog stand-in for classification without tag lookups.
struct NoCatalog;

#[async_trait]
impl ProductCatalog for NoCatalog {
    async fn fetch_product_tags(&self, _product_id: u64) -> RecoveryResult<Option<Vec<String>>> {
        Ok(None)
    }
}

pub struct CartClassifier {
    catalog: CatalogConfig,
}

impl CartClassifier {
    pub fn new(catalog: CatalogConfig) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &CatalogConfig {
        &self.catalog
    }

    /// Classify using vendor rules only; unmatched items take the default policy.
    pub async fn classify_offline(&self, items: &[LineItem]) -> CartAnalysis {
        self.classify(items, &NoCatalog).await
    }

    /// Classify a cart, looking up product tags for items no vendor rule claims.
    /// A failed lookup sends that item to the default category and moves on.
    pub async fn classify<C>(&self, items: &[LineItem], products: &C) -> CartAnalysis
    where
        C: ProductCatalog + ?Sized,
    {
        let mut buckets: BTreeMap<ProductCategory, CategoryBucket> = ProductCategory::ALL
            .iter()
            .map(|c| (*c, CategoryBucket::default()))
            .collect();
        let mut classified = Vec::with_capacity(items.len());
        let mut tag_cache: HashMap<u64, Option<Vec<String>>> = HashMap::new();

        for item in items {
            let (category, source) = self.categorize(item, products, &mut tag_cache).await;
            let bucket = buckets.entry(category).or_default();
            bucket.subtotal += item.line_total();
            bucket.item_count += item.quantity;
            bucket.items.push(item.clone());
            classified.push(ClassifiedItem {
                title: item.title.clone(),
                category,
                source,
            });
        }

        let total_value: f64 = items.iter().map(LineItem::line_total).sum();
        let item_count: u32 = items.iter().map(|i| i.quantity).sum();
        let average_item_price = if item_count > 0 {
            total_value / f64::from(item_count)
        } else {
            0.0
        };
        let highest_price_item = items
            .iter()
            .max_by(|a, b| a.price.total_cmp(&b.price))
            .cloned();

        let extraction = buckets
            .get(&ProductCategory::Extraction)
            .map_or(0.0, |b| b.subtotal);
        let smokeshop = buckets
            .get(&ProductCategory::Smokeshop)
            .map_or(0.0, |b| b.subtotal);
        let is_mixed_cart = extraction > 0.0 && smokeshop > 0.0;
        let dominant_category = self.dominant(extraction, smokeshop);

        let analysis = CartAnalysis {
            total_value,
            item_count,
            buckets,
            dominant_category,
            is_mixed_cart,
            value_tier: self.value_tier(total_value),
            highest_price_item,
            average_item_price,
            classified,
        };
        debug!(
            total = analysis.total_value,
            dominant = %analysis.dominant_category,
            mixed = analysis.is_mixed_cart,
            tier = %analysis.value_tier,
            "Cart classified"
        );
        analysis
    }

    /// Larger primary subtotal wins; exact ties go to the configured primary category.
    fn dominant(&self, extraction: f64, smokeshop: f64) -> ProductCategory {
        match (extraction > 0.0, smokeshop > 0.0) {
            (false, false) => ProductCategory::Unknown,
            (true, false) => ProductCategory::Extraction,
            (false, true) => ProductCategory::Smokeshop,
            (true, true) => {
                if extraction > smokeshop {
                    ProductCategory::Extraction
                } else if smokeshop > extraction {
                    ProductCategory::Smokeshop
                } else {
                    self.catalog.primary_category
                }
            }
        }
    }

    async fn categorize<C>(
        &self,
        item: &LineItem,
        products: &C,
        tag_cache: &mut HashMap<u64, Option<Vec<String>>>,
    ) -> (ProductCategory, MatchSource)
    where
        C: ProductCatalog + ?Sized,
    {
        if let Some(category) = item.vendor.as_deref().and_then(|v| self.match_vendor(v)) {
            return (category, MatchSource::Vendor);
        }

        if let Some(product_id) = item.product_id {
            if !tag_cache.contains_key(&product_id) {
                let tags = match products.fetch_product_tags(product_id).await {
                    Ok(tags) => tags,
                    Err(e) => {
                        warn!(product_id, error = %e, "Product tag lookup failed; using default category");
                        metrics::counter!("recovery.catalog_lookup_failures").increment(1);
                        None
                    }
                };
                tag_cache.insert(product_id, tags);
            }
            let matched = tag_cache
                .get(&product_id)
                .and_then(|tags| tags.as_deref())
                .and_then(|tags| self.match_tags(tags));
            if let Some(category) = matched {
                return (category, MatchSource::Tag);
            }
        }

        (self.catalog.fallback_category(), MatchSource::Default)
    }

    /// Case-insensitive substring match of the vendor against each rule, in rule order.
    pub fn match_vendor(&self, vendor: &str) -> Option<ProductCategory> {
        let vendor = vendor.trim().to_lowercase();
        if vendor.is_empty() {
            return None;
        }
        self.catalog
            .categories
            .iter()
            .find(|rule| {
                rule.vendors
                    .iter()
                    .any(|v| !v.trim().is_empty() && vendor.contains(&v.trim().to_lowercase()))
            })
            .map(|rule| rule.category)
    }

    pub fn match_tags(&self, tags: &[String]) -> Option<ProductCategory> {
        self.catalog
            .categories
            .iter()
            .find(|rule| {
                rule.tags.iter().any(|wanted| {
                    tags.iter()
                        .any(|t| t.trim().eq_ignore_ascii_case(wanted.trim()))
                })
            })
            .map(|rule| rule.category)
    }

    /// Ordered range scan, `min <= total < max`. Falls back to the last tier.
    pub fn value_tier(&self, total: f64) -> String {
        self.catalog
            .value_tiers
            .iter()
            .find(|tier| tier.contains(total))
            .or_else(|| self.catalog.value_tiers.last())
            .map(|tier| tier.name.clone())
            .unwrap_or_default()
    }
}

impl Default for CartClassifier {
    fn default() -> Self {
        Self::new(CatalogConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use recovery_core::config::DefaultCategoryPolicy;
    use recovery_core::RecoveryError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedCatalog {
        tags: HashMap<u64, Vec<String>>,
        failing: Vec<u64>,
        calls: AtomicUsize,
    }

    impl ScriptedCatalog {
        fn new() -> Self {
            Self {
                tags: HashMap::new(),
                failing: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProductCatalog for ScriptedCatalog {
        async fn fetch_product_tags(&self, product_id: u64) -> RecoveryResult<Option<Vec<String>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&product_id) {
                return Err(RecoveryError::Commerce("HTTP 502".into()));
            }
            Ok(self.tags.get(&product_id).cloned())
        }
    }

    fn item(product_id: u64, vendor: Option<&str>, price: f64, quantity: u32) -> LineItem {
        LineItem {
            product_id: Some(product_id),
            variant_id: None,
            title: format!("Product {product_id}"),
            vendor: vendor.map(str::to_string),
            quantity,
            price,
        }
    }

    #[tokio::test]
    async fn test_vendor_match_is_case_insensitive_substring() {
        let classifier = CartClassifier::default();
        let cart = vec![item(1, Some("CLOUD YHS Wholesale"), 90.0, 1)];
        let analysis = classifier.classify_offline(&cart).await;

        assert_eq!(analysis.dominant_category, ProductCategory::Smokeshop);
        assert_eq!(analysis.classified[0].source, MatchSource::Vendor);
        assert!(!analysis.is_mixed_cart);
        assert_eq!(analysis.value_tier, "medium");
    }

    #[tokio::test]
    async fn test_tag_lookup_when_vendor_unmatched() {
        let classifier = CartClassifier::default();
        let mut catalog = ScriptedCatalog::new();
        catalog
            .tags
            .insert(7, vec!["Pillar:Extraction-Packaging".to_string()]);
        let cart = vec![item(7, Some("Generic Supplier"), 12.0, 3)];

        let analysis = classifier.classify(&cart, &catalog).await;
        assert_eq!(analysis.dominant_category, ProductCategory::Extraction);
        assert_eq!(analysis.classified[0].source, MatchSource::Tag);
        assert_eq!(analysis.item_count, 3);
    }

    #[tokio::test]
    async fn test_lookup_failure_falls_through_without_aborting() {
        let classifier = CartClassifier::default();
        let mut catalog = ScriptedCatalog::new();
        catalog.failing.push(1);
        catalog
            .tags
            .insert(2, vec!["pillar:smokeshop-device".to_string()]);
        let cart = vec![item(1, None, 10.0, 1), item(2, None, 40.0, 1)];

        let analysis = classifier.classify(&cart, &catalog).await;
        assert_eq!(analysis.classified[0].category, ProductCategory::Unknown);
        assert_eq!(analysis.classified[0].source, MatchSource::Default);
        assert_eq!(analysis.classified[1].category, ProductCategory::Smokeshop);
        assert_eq!(analysis.subtotal(ProductCategory::Unknown), 10.0);
    }

    #[tokio::test]
    async fn test_tags_fetched_once_per_product() {
        let classifier = CartClassifier::default();
        let catalog = ScriptedCatalog::new();
        let cart = vec![item(9, None, 5.0, 1), item(9, None, 6.0, 1)];

        classifier.classify(&cart, &catalog).await;
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_to_primary_policy() {
        let catalog = CatalogConfig {
            default_policy: DefaultCategoryPolicy::DefaultToPrimaryCategory,
            ..Default::default()
        };
        let classifier = CartClassifier::new(catalog);
        let analysis = classifier
            .classify_offline(&[item(3, Some("Unbranded"), 30.0, 1)])
            .await;
        assert_eq!(analysis.dominant_category, ProductCategory::Extraction);
        assert_eq!(analysis.subtotal(ProductCategory::Unknown), 0.0);
    }

    #[tokio::test]
    async fn test_mixed_cart_tie_breaks_to_primary_category() {
        let classifier = CartClassifier::default();
        let cart = vec![
            item(1, Some("Oil Slick"), 50.0, 1),
            item(2, Some("What You Need"), 25.0, 2),
        ];
        let analysis = classifier.classify_offline(&cart).await;
        assert!(analysis.is_mixed_cart);
        assert_eq!(analysis.dominant_category, ProductCategory::Extraction);

        let smokeshop_first = CatalogConfig {
            primary_category: ProductCategory::Smokeshop,
            ..Default::default()
        };
        let analysis = CartClassifier::new(smokeshop_first)
            .classify_offline(&cart)
            .await;
        assert_eq!(analysis.dominant_category, ProductCategory::Smokeshop);
    }

    #[tokio::test]
    async fn test_larger_subtotal_dominates() {
        let classifier = CartClassifier::default();
        let cart = vec![
            item(1, Some("Oil Slick"), 20.0, 1),
            item(2, Some("What You Need"), 80.0, 1),
        ];
        let analysis = classifier.classify_offline(&cart).await;
        assert!(analysis.is_mixed_cart);
        assert_eq!(analysis.dominant_category, ProductCategory::Smokeshop);
        assert_eq!(analysis.highest_price_item.unwrap().price, 80.0);
        assert_eq!(analysis.average_item_price, 50.0);
    }

    #[tokio::test]
    async fn test_empty_cart() {
        let analysis = CartClassifier::default().classify_offline(&[]).await;
        assert_eq!(analysis.total_value, 0.0);
        assert_eq!(analysis.average_item_price, 0.0);
        assert_eq!(analysis.dominant_category, ProductCategory::Unknown);
        assert_eq!(analysis.value_tier, "micro");
        assert_eq!(analysis.buckets.len(), 3);
    }

    #[test]
    fn test_value_tier_boundaries() {
        let classifier = CartClassifier::default();
        assert_eq!(classifier.value_tier(24.99), "micro");
        assert_eq!(classifier.value_tier(25.0), "small");
        assert_eq!(classifier.value_tier(299.99), "large");
        assert_eq!(classifier.value_tier(300.0), "premium");
        assert_eq!(classifier.value_tier(1_000_000.0), "premium");
    }

    fn vendor_strategy() -> impl Strategy<Value = Option<String>> {
        prop_oneof![
            Just(None),
            Just(Some("Oil Slick".to_string())),
            Just(Some("What You Need".to_string())),
            Just(Some("Cloud YHS".to_string())),
            Just(Some("Someone Else".to_string())),
        ]
    }

    fn cart_strategy() -> impl Strategy<Value = Vec<LineItem>> {
        proptest::collection::vec(
            (vendor_strategy(), 0.0f64..500.0, 1u32..6).prop_map(|(vendor, price, quantity)| {
                LineItem {
                    product_id: None,
                    variant_id: None,
                    title: "item".to_string(),
                    vendor,
                    quantity,
                    price: (price * 100.0).round() / 100.0,
                }
            }),
            0..10,
        )
    }

    proptest! {
        #[test]
        fn property_subtotals_sum_to_total_and_one_tier_matches(cart in cart_strategy()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");
            let classifier = CartClassifier::default();
            let analysis = rt.block_on(classifier.classify_offline(&cart));

            let sum: f64 = analysis.buckets.values().map(|b| b.subtotal).sum();
            prop_assert!((sum - analysis.total_value).abs() < 1e-6);

            let matching = classifier
                .catalog()
                .value_tiers
                .iter()
                .filter(|t| t.contains(analysis.total_value))
                .count();
            prop_assert_eq!(matching, 1);
        }
    }
}
