//! Recovery email content: subject, preheader, HTML and plain-text bodies
//! built from the discount decision, cart analysis and A/B variants.

use recovery_core::config::{ContentStrategy, DeliveryConfig};
use recovery_core::types::{Checkout, Customer, CustomerSegment, ProductCategory};
use recovery_experimentation::SelectedVariant;
use recovery_journey::SequencePosition;
use recovery_offers::DiscountDecision;
use recovery_segmentation::CartAnalysis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::debug;

/// A/B elements the renderer knows how to override.
pub const SUBJECT_LINE: &str = "subject_line";
pub const PREHEADER: &str = "preheader";
pub const CTA_TEXT: &str = "cta_text";

const NAME_FALLBACK: &str = "Hi there";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailContent {
    pub subject: String,
    pub preheader: String,
    pub headline: String,
    pub cta_text: String,
    pub cta_url: String,
    pub html: String,
    pub text: String,
    pub strategy: ContentStrategy,
    /// test id -> variant id actually shown.
    pub variants: BTreeMap<String, String>,
}

/// Everything one email is rendered from.
pub struct RenderContext<'a> {
    pub checkout: &'a Checkout,
    pub customer: Option<&'a Customer>,
    pub analysis: &'a CartAnalysis,
    pub segment: CustomerSegment,
    pub position: &'a SequencePosition,
    pub decision: &'a DiscountDecision,
    pub variants: &'a BTreeMap<String, SelectedVariant>,
}

struct StrategyCopy {
    subject: &'static str,
    preheader: &'static str,
    headline: &'static str,
    body: &'static str,
    cta: &'static str,
}

fn strategy_copy(strategy: ContentStrategy) -> StrategyCopy {
    match strategy {
        ContentStrategy::Reminder => StrategyCopy {
            subject: "You left something in your cart",
            preheader: "Your cart is saved and ready when you are.",
            headline: "Still thinking it over?",
            body: "We saved your cart so you can pick up right where you left off.",
            cta: "Return to my cart",
        },
        ContentStrategy::SocialProof => StrategyCopy {
            subject: "{first_name}, other customers love what's in your cart",
            preheader: "Thousands of orders shipped from {store_name}.",
            headline: "Good choice.",
            body: "The items in your cart are some of our most reordered products.",
            cta: "Complete your order",
        },
        ContentStrategy::Incentive => StrategyCopy {
            subject: "A little something to help you decide",
            preheader: "An offer on the cart you left at {store_name}.",
            headline: "Here's a reason to finish checking out.",
            body: "Your cart is still waiting, and this time it comes with an offer.",
            cta: "Claim my offer",
        },
        ContentStrategy::Urgency => StrategyCopy {
            subject: "Your offer is about to expire",
            preheader: "Your cart and your code won't wait forever.",
            headline: "Time is running out.",
            body: "Your offer expires soon. Stock on popular items moves fast.",
            cta: "Use my code now",
        },
        ContentStrategy::LastChance => StrategyCopy {
            subject: "Last chance: your cart is about to expire",
            preheader: "This is the final reminder about your cart.",
            headline: "Last call.",
            body: "After this we'll clear your cart. Here is our best offer.",
            cta: "Finish my order",
        },
    }
}

fn category_line(analysis: &CartAnalysis) -> &'static str {
    if analysis.is_mixed_cart {
        return "Your extraction supplies and smokeshop gear are still in your cart.";
    }
    match analysis.dominant_category {
        ProductCategory::Extraction => "Your extraction supplies are still in your cart.",
        ProductCategory::Smokeshop => "Your glass and smokeshop gear are still in your cart.",
        ProductCategory::Unknown => "Your items are still in your cart.",
    }
}

/// Offer sentence, or `None` when the email carries no offer.
pub fn offer_line(decision: &DiscountDecision) -> Option<String> {
    if !decision.should_discount {
        return None;
    }
    let code = decision.code.as_deref().unwrap_or_default();
    let mut line = if decision.discount_percent > 0 {
        format!("Take {}% off your order with code {}", decision.discount_percent, code)
    } else {
        format!("Get free shipping on your order with code {}", code)
    };
    if decision.expiry_hours > 0 {
        let _ = write!(line, ", valid for {} hours", decision.expiry_hours);
    }
    line.push('.');
    Some(line)
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

pub struct EmailRenderer {
    config: DeliveryConfig,
}

impl EmailRenderer {
    pub fn new(config: DeliveryConfig) -> Self {
        Self { config }
    }

    fn fill(&self, template: &str, first_name: Option<&str>) -> String {
        let name = first_name.map(str::trim).filter(|n| !n.is_empty());
        let mut filled = template.replace("{store_name}", &self.config.store_name);
        if template.starts_with("{first_name}") && name.is_none() {
            filled = filled.replacen("{first_name}", NAME_FALLBACK, 1);
        }
        filled.replace("{first_name}", name.unwrap_or("there"))
    }

    /// Link back into the checkout, carrying the discount code when there is one.
    pub fn cart_url(&self, checkout: &Checkout, decision: &DiscountDecision) -> String {
        let base = checkout
            .recovery_url
            .clone()
            .unwrap_or_else(|| format!("{}/cart", self.config.storefront_url.trim_end_matches('/')));
        let Some(code) = decision.code.as_deref().filter(|_| decision.should_discount) else {
            return base;
        };
        match url::Url::parse(&base) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("discount", code);
                url.to_string()
            }
            Err(_) => base,
        }
    }

    pub fn render(&self, ctx: &RenderContext<'_>) -> EmailContent {
        let strategy = ctx.position.touchpoint.strategy;
        let copy = strategy_copy(strategy);
        let first_name = ctx.customer.and_then(|c| c.first_name.as_deref());

        let pick = |element: &str, default: &str| -> String {
            let template = ctx
                .variants
                .get(element)
                .map(|v| v.content.as_str())
                .unwrap_or(default);
            self.fill(template, first_name)
        };
        let subject = pick(SUBJECT_LINE, copy.subject);
        let preheader = pick(PREHEADER, copy.preheader);
        let cta_text = pick(CTA_TEXT, copy.cta);
        let headline = self.fill(copy.headline, first_name);
        let body = self.fill(copy.body, first_name);
        let cta_url = self.cart_url(ctx.checkout, ctx.decision);
        let offer = offer_line(ctx.decision);
        let category = category_line(ctx.analysis);

        let variants: BTreeMap<String, String> = ctx
            .variants
            .values()
            .map(|v| (v.test_id.clone(), v.variant_id.clone()))
            .collect();

        let html = self.render_html(ctx, &headline, &body, category, offer.as_deref(), &cta_text, &cta_url);
        let text = self.render_text(ctx, &headline, &body, category, offer.as_deref(), &cta_text, &cta_url);

        debug!(
            checkout_id = %ctx.checkout.id,
            strategy = strategy.as_str(),
            segment = %ctx.segment,
            variants = variants.len(),
            "Email rendered"
        );

        EmailContent {
            subject,
            preheader,
            headline,
            cta_text,
            cta_url,
            html,
            text,
            strategy,
            variants,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn render_html(
        &self,
        ctx: &RenderContext<'_>,
        headline: &str,
        body: &str,
        category: &str,
        offer: Option<&str>,
        cta_text: &str,
        cta_url: &str,
    ) -> String {
        let mut html = String::new();
        let _ = write!(
            html,
            "<html><body><div class=\"recovery-email\"><h1>{}</h1><p>{}</p><p>{}</p>",
            escape_html(headline),
            escape_html(body),
            escape_html(category)
        );
        html.push_str("<table class=\"cart-items\">");
        for item in &ctx.checkout.line_items {
            let _ = write!(
                html,
                "<tr><td>{}</td><td>x{}</td><td>${:.2}</td></tr>",
                escape_html(&item.title),
                item.quantity,
                item.line_total()
            );
        }
        let _ = write!(
            html,
            "</table><p class=\"cart-total\">Cart total: ${:.2}</p>",
            ctx.analysis.total_value
        );
        if let Some(offer) = offer {
            let _ = write!(html, "<p class=\"offer\"><strong>{}</strong></p>", escape_html(offer));
        }
        let _ = write!(
            html,
            "<p><a class=\"cta\" href=\"{}\">{}</a></p><p class=\"footer\">{} &middot; {}</p></div></body></html>",
            escape_html(cta_url),
            escape_html(cta_text),
            escape_html(&self.config.store_name),
            escape_html(&self.config.support_email)
        );
        html
    }

    #[allow(clippy::too_many_arguments)]
    fn render_text(
        &self,
        ctx: &RenderContext<'_>,
        headline: &str,
        body: &str,
        category: &str,
        offer: Option<&str>,
        cta_text: &str,
        cta_url: &str,
    ) -> String {
        let mut text = format!("{headline}\n\n{body}\n{category}\n\n");
        for item in &ctx.checkout.line_items {
            let _ = writeln!(text, "- {} x{}: ${:.2}", item.title, item.quantity, item.line_total());
        }
        let _ = writeln!(text, "\nCart total: ${:.2}", ctx.analysis.total_value);
        if let Some(offer) = offer {
            let _ = writeln!(text, "\n{offer}");
        }
        let _ = write!(
            text,
            "\n{cta_text}: {cta_url}\n\n{} | {}\n",
            self.config.store_name, self.config.support_email
        );
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use recovery_core::config::CatalogConfig;
    use recovery_core::types::LineItem;
    use recovery_journey::SequenceResolver;
    use recovery_segmentation::CartClassifier;

    fn checkout() -> Checkout {
        let now = Utc::now();
        Checkout {
            id: "c-1".into(),
            token: None,
            email: Some("rae@example.com".into()),
            customer_id: Some(7),
            created_at: now,
            updated_at: now,
            completed_at: None,
            recovery_url: Some("https://oilslickpad.com/checkouts/abc/recover".into()),
            currency: "USD".into(),
            subtotal: 90.0,
            line_items: vec![LineItem {
                product_id: Some(1),
                variant_id: None,
                title: "Glass <Beaker> Bong".into(),
                vendor: Some("What You Need".into()),
                quantity: 1,
                price: 90.0,
            }],
        }
    }

    fn position(step: usize) -> SequencePosition {
        let resolver = SequenceResolver::default();
        let touchpoint = resolver.touchpoints()[step].clone();
        let abandoned = Utc::now() - chrono::Duration::minutes(touchpoint.delay_minutes + 1);
        resolver.resolve(abandoned, Utc::now()).unwrap()
    }

    fn decision(percent: u32, code: Option<&str>) -> DiscountDecision {
        DiscountDecision {
            should_discount: code.is_some(),
            discount_percent: percent,
            free_shipping: false,
            code: code.map(str::to_string),
            expiry_hours: 48,
            savings_amount: 0.0,
            reason: None,
            step_id: "step_3_incentive".into(),
            base_percent: f64::from(percent),
            multiplier: 1.0,
            ceiling_percent: 35.0,
            clamped: false,
        }
    }

    #[tokio::test]
    async fn test_render_incentive_with_code() {
        let checkout = checkout();
        let analysis = CartClassifier::new(CatalogConfig::default())
            .classify_offline(&checkout.line_items)
            .await;
        let position = position(2);
        let decision = decision(25, Some("COMEBACK-BACK-ABC234"));
        let variants = BTreeMap::new();
        let renderer = EmailRenderer::new(DeliveryConfig::default());

        let content = renderer.render(&RenderContext {
            checkout: &checkout,
            customer: None,
            analysis: &analysis,
            segment: CustomerSegment::ReturningCustomer,
            position: &position,
            decision: &decision,
            variants: &variants,
        });

        assert_eq!(content.strategy, ContentStrategy::Incentive);
        assert!(content.text.contains("Take 25% off your order with code COMEBACK-BACK-ABC234"));
        assert!(content.html.contains("Glass &lt;Beaker&gt; Bong"));
        assert!(content.cta_url.ends_with("recover?discount=COMEBACK-BACK-ABC234"));
        assert!(content.text.contains("smokeshop gear"));
    }

    #[tokio::test]
    async fn test_variant_overrides_and_name_fill() {
        let checkout = checkout();
        let analysis = CartClassifier::new(CatalogConfig::default())
            .classify_offline(&checkout.line_items)
            .await;
        let position = position(0);
        let decision = decision(0, None);
        let mut variants = BTreeMap::new();
        variants.insert(
            SUBJECT_LINE.to_string(),
            SelectedVariant {
                test_id: "subject_line_v1".into(),
                variant_id: "personal".into(),
                content: "{first_name}, your cart is still waiting".into(),
            },
        );
        let customer = Customer {
            id: 7,
            first_name: Some("Rae".into()),
            ..Default::default()
        };
        let renderer = EmailRenderer::new(DeliveryConfig::default());

        let ctx = RenderContext {
            checkout: &checkout,
            customer: Some(&customer),
            analysis: &analysis,
            segment: CustomerSegment::NewCustomer,
            position: &position,
            decision: &decision,
            variants: &variants,
        };
        let content = renderer.render(&ctx);
        assert_eq!(content.subject, "Rae, your cart is still waiting");
        assert_eq!(content.variants.get("subject_line_v1").map(String::as_str), Some("personal"));
        assert_eq!(content.cta_url, "https://oilslickpad.com/checkouts/abc/recover");
        assert!(!content.text.contains("code"));

        let anonymous = renderer.render(&RenderContext { customer: None, ..ctx });
        assert_eq!(anonymous.subject, "Hi there, your cart is still waiting");
    }

    #[test]
    fn test_free_shipping_offer_line() {
        let mut d = decision(0, Some("COMEBACK-NEW-XYZ234"));
        d.free_shipping = true;
        d.expiry_hours = 72;
        assert_eq!(
            offer_line(&d).as_deref(),
            Some("Get free shipping on your order with code COMEBACK-NEW-XYZ234, valid for 72 hours.")
        );
        assert_eq!(offer_line(&decision(10, None)), None);
    }
}
