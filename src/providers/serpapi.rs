//! Google Shopping search through SerpApi.
//!
//! Converts a [`ShoppingQuery`] into SerpApi parameters. Filters the engine
//! understands natively go into `tbs`; descriptive filters (brand, color,
//! size, store, ...) are folded into the query string itself:
//!
//! ```text
//! [gender] [age_group] <query> [category] [brand] [color] [material] [Size <size>] [from <store>]
//! tbs = mr:1,price:1,ppr_min:<min>,ppr_max:<max>,avg_rating:<r*100>,sales:1,shipping:1,new:1,sort:p
//! ```
//!
//! Requires `SERPAPI_API_KEY`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::SearchConfig;
use crate::models::{Candidate, ShoppingQuery};

use super::{env_key, send_json_with_retry, ProductSearch};

pub struct SerpApiSearch {
    client: reqwest::Client,
    api_key: String,
    defaults: SearchConfig,
}

impl SerpApiSearch {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let api_key = env_key("SERPAPI_API_KEY")
            .ok_or_else(|| anyhow::anyhow!("SERPAPI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            defaults: config.clone(),
        })
    }
}

#[async_trait]
impl ProductSearch for SerpApiSearch {
    async fn search(&self, query: &ShoppingQuery) -> Result<Vec<Candidate>> {
        let Some(mut params) = build_params(query, &self.defaults) else {
            bail!("search query must not be empty");
        };
        if let Some((_, q)) = params.iter().find(|(k, _)| k == "q") {
            tracing::info!(%q, "searching Google Shopping");
        }
        params.push(("api_key".to_string(), self.api_key.clone()));

        let url = format!("{}/search.json", self.defaults.api_base.trim_end_matches('/'));
        let results =
            send_json_with_retry("SerpApi", 2, || self.client.get(&url).query(&params)).await?;

        if let Some(err) = results.get("error").and_then(Value::as_str) {
            bail!("SerpApi error: {}", err);
        }

        let (candidates, skipped) = parse_results(&results);
        if skipped > 0 {
            tracing::debug!(skipped, "skipped results missing image, price or link");
        }
        Ok(candidates)
    }
}

/// Maps a category to the term appended to the query.
fn category_term(category: &str) -> String {
    let clean = category.trim().to_lowercase();
    let term = match clean.as_str() {
        "shoe" | "shoes" => "shoes",
        "pant" | "pants" => "pants",
        "trouser" | "trousers" => "trousers",
        "shirt" | "shirts" => "shirt",
        "sunglass" | "sunglasses" => "sunglasses",
        "dress" | "dresses" => "dress",
        "jacket" | "jackets" => "jacket",
        "t-shirt" | "tshirt" => "t-shirt",
        "top" | "tops" => "top",
        "jean" | "jeans" => "jeans",
        other => other,
    };
    term.to_string()
}

/// Builds the final free-text query, or `None` if there is nothing to search for.
pub fn build_query_string(q: &ShoppingQuery) -> Option<String> {
    let base = q.query_text()?;

    let mut parts: Vec<String> = Vec::new();
    for prefix in [&q.gender, &q.age_group].into_iter().flatten() {
        if !prefix.trim().is_empty() {
            parts.push(prefix.trim().to_string());
        }
    }
    parts.push(base.to_string());
    let mut out = parts.join(" ");

    if let Some(category) = q.category.as_deref().filter(|c| !c.trim().is_empty()) {
        let clean = category.trim().to_lowercase();
        let term = category_term(category);
        let mut variants = vec![term.clone(), clean.clone()];
        if term.ends_with('s') && !clean.ends_with('s') {
            variants.push(term[..term.len() - 1].to_string());
        } else if !term.ends_with('s') && clean.ends_with('s') {
            variants.push(format!("{}s", term));
        }
        let lower = out.to_lowercase();
        if !variants.iter().any(|v| !v.is_empty() && lower.contains(v.as_str())) {
            out.push(' ');
            out.push_str(&term);
        }
    }

    for extra in [&q.brand, &q.color, &q.material].into_iter().flatten() {
        if !extra.trim().is_empty() {
            out.push(' ');
            out.push_str(extra.trim());
        }
    }
    if let Some(size) = q.size.as_deref().filter(|s| !s.trim().is_empty()) {
        out.push_str(&format!(" Size {}", size.trim()));
    }
    if let Some(store) = q.store.as_deref().filter(|s| !s.trim().is_empty()) {
        out.push_str(&format!(" from {}", store.trim()));
    }

    Some(out)
}

/// Builds the `tbs` filter string, or `None` when no native filter applies.
pub fn build_tbs(q: &ShoppingQuery) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();

    if q.min_price.is_some() || q.max_price.is_some() {
        let mut price = "price:1".to_string();
        if let Some(min) = q.min_price {
            price.push_str(&format!(",ppr_min:{}", min as i64));
        }
        if let Some(max) = q.max_price {
            price.push_str(&format!(",ppr_max:{}", max as i64));
        }
        parts.push(price);
    }
    if let Some(rating) = q.min_rating {
        parts.push(format!("avg_rating:{}", (rating * 100.0) as i64));
    }
    if q.on_sale == Some(true) {
        parts.push("sales:1".to_string());
    }
    if q.free_shipping == Some(true) {
        parts.push("shipping:1".to_string());
    }
    match q.condition.as_deref().map(|c| c.trim().to_lowercase()).as_deref() {
        Some("new") => parts.push("new:1".to_string()),
        Some("used") => parts.push("used:1".to_string()),
        _ => {}
    }
    match q.sort.as_deref().map(|s| s.trim().to_lowercase()).as_deref() {
        Some("price_low") => parts.push("sort:p".to_string()),
        Some("price_high") => parts.push("sort:pd".to_string()),
        Some("rating_high") => parts.push("sort:rv".to_string()),
        _ => {}
    }

    if parts.is_empty() {
        None
    } else {
        Some(format!("mr:1,{}", parts.join(",")))
    }
}

/// All request parameters except the API key.
pub fn build_params(q: &ShoppingQuery, defaults: &SearchConfig) -> Option<Vec<(String, String)>> {
    let final_query = build_query_string(q)?;
    let engine = if q.use_light_api == Some(true) {
        "google_shopping_light"
    } else {
        "google_shopping"
    };
    let pick = |value: &Option<String>, fallback: &str| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(fallback)
            .to_string()
    };

    let mut params = vec![
        ("engine".to_string(), engine.to_string()),
        ("q".to_string(), final_query),
        ("google_domain".to_string(), pick(&q.google_domain, &defaults.google_domain)),
        ("gl".to_string(), pick(&q.gl, &defaults.gl)),
        ("hl".to_string(), pick(&q.hl, &defaults.hl)),
        ("location".to_string(), pick(&q.location, &defaults.location)),
        ("num".to_string(), q.num.unwrap_or(defaults.num).to_string()),
    ];
    if let Some(tbs) = build_tbs(q) {
        params.push(("tbs".to_string(), tbs));
    }
    if let Some(start) = q.start {
        params.push(("start".to_string(), start.to_string()));
    }
    if let Some(device) = q.device.as_deref().filter(|d| !d.trim().is_empty()) {
        params.push(("device".to_string(), device.trim().to_string()));
    }
    if q.no_cache == Some(true) {
        params.push(("no_cache".to_string(), "true".to_string()));
    }
    Some(params)
}

fn first_str(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| item.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Extracts usable candidates and counts the skipped ones.
///
/// Looks in `shopping_results`, then `organic_results`, then `products`.
pub fn parse_results(results: &Value) -> (Vec<Candidate>, usize) {
    let items = ["shopping_results", "organic_results", "products"]
        .iter()
        .filter_map(|k| results.get(*k).and_then(Value::as_array))
        .find(|a| !a.is_empty())
        .cloned()
        .unwrap_or_default();

    let mut out = Vec::with_capacity(items.len());
    let mut skipped = 0;
    for item in &items {
        let candidate = Candidate {
            image_ref: first_str(item, &["thumbnail", "image"]).unwrap_or_default(),
            price: first_str(item, &["price"]).unwrap_or_default(),
            link: first_str(item, &["link", "product_link"]).unwrap_or_default(),
            rating: item.get("rating").and_then(Value::as_f64),
            title: first_str(item, &["title"]).unwrap_or_default(),
            source: first_str(item, &["source"]).unwrap_or_default(),
            review_count: item.get("reviews").and_then(Value::as_u64),
        };
        if candidate.is_complete() {
            out.push(candidate);
        } else {
            skipped += 1;
        }
    }
    (out, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(text: &str) -> ShoppingQuery {
        ShoppingQuery {
            query: Some(text.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn query_string_folds_descriptive_filters() {
        let q = ShoppingQuery {
            gender: Some("women".into()),
            category: Some("dresses".into()),
            brand: Some("Biba".into()),
            color: Some("maroon".into()),
            size: Some("M".into()),
            store: Some("Myntra".into()),
            ..query("party wear")
        };
        assert_eq!(
            build_query_string(&q).unwrap(),
            "women party wear dress Biba maroon Size M from Myntra"
        );
    }

    #[test]
    fn category_not_repeated() {
        let q = ShoppingQuery {
            category: Some("shoe".into()),
            ..query("running shoes")
        };
        assert_eq!(build_query_string(&q).unwrap(), "running shoes");
    }

    #[test]
    fn empty_query_builds_nothing() {
        assert!(build_query_string(&query("  ")).is_none());
        assert!(build_params(&ShoppingQuery::default(), &SearchConfig::default()).is_none());
    }

    #[test]
    fn tbs_encodes_native_filters() {
        let q = ShoppingQuery {
            min_price: Some(500.0),
            max_price: Some(1500.5),
            min_rating: Some(4.5),
            free_shipping: Some(true),
            condition: Some("New".into()),
            sort: Some("price_high".into()),
            ..query("kurta")
        };
        assert_eq!(
            build_tbs(&q).unwrap(),
            "mr:1,price:1,ppr_min:500,ppr_max:1500,avg_rating:450,shipping:1,new:1,sort:pd"
        );
        assert!(build_tbs(&query("kurta")).is_none());
    }

    #[test]
    fn params_fall_back_to_configured_defaults() {
        let q = ShoppingQuery {
            gl: Some("us".into()),
            use_light_api: Some(true),
            ..query("loafers")
        };
        let params = build_params(&q, &SearchConfig::default()).unwrap();
        let get = |k: &str| params.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("engine"), Some("google_shopping_light"));
        assert_eq!(get("gl"), Some("us"));
        assert_eq!(get("google_domain"), Some("google.co.in"));
        assert_eq!(get("tbs"), None);
    }

    #[test]
    fn parses_and_validates_results() {
        let results = json!({
            "shopping_results": [
                {"title": "A", "thumbnail": "https://i/a.jpg", "price": "₹999", "link": "https://s/a", "rating": 4.3, "reviews": 120, "source": "Myntra"},
                {"title": "B", "image": "https://i/b.jpg", "price": "₹1,299", "product_link": "https://s/b"},
                {"title": "no price", "thumbnail": "https://i/c.jpg", "link": "https://s/c"},
            ]
        });
        let (items, skipped) = parse_results(&results);
        assert_eq!(items.len(), 2);
        assert_eq!(skipped, 1);
        assert_eq!(items[0].rating, Some(4.3));
        assert_eq!(items[0].review_count, Some(120));
        assert_eq!(items[1].link, "https://s/b");
    }

    #[test]
    fn falls_back_to_organic_results() {
        let results = json!({
            "shopping_results": [],
            "organic_results": [
                {"title": "A", "thumbnail": "https://i/a.jpg", "price": "$5", "link": "https://s/a"}
            ]
        });
        assert_eq!(parse_results(&results).0.len(), 1);
    }
}
