//! Client-side filtering and sorting of search results.
//!
//! The catalog API honours price and rating filters only loosely, so the
//! research stage re-applies them locally before anything is styled.

use std::cmp::Ordering;

use crate::models::{Candidate, ShoppingQuery};

/// How many candidates each filter removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub input: usize,
    pub price_filtered: usize,
    pub rating_filtered: usize,
    pub output: usize,
}

/// Parses a display price like `"₹1,299.00"` or `"Rs. 450"`.
///
/// Currency symbols, thousands separators and whitespace are ignored.
/// Anything unparseable is `0.0`.
pub fn parse_price(raw: &str) -> f64 {
    let mut s = raw.trim().to_string();
    for token in ["Rs.", "Rs", "rs.", "rs", "₹", "$", "€", "£", "¥"] {
        s = s.replace(token, "");
    }
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    cleaned.parse::<f64>().unwrap_or(0.0)
}

/// Keeps candidates whose price lies in `[min_price, max_price]` (either bound optional).
pub fn filter_by_price(
    candidates: Vec<Candidate>,
    min_price: Option<f64>,
    max_price: Option<f64>,
) -> Vec<Candidate> {
    if min_price.is_none() && max_price.is_none() {
        return candidates;
    }
    candidates
        .into_iter()
        .filter(|c| {
            let price = parse_price(&c.price);
            min_price.map_or(true, |min| price >= min) && max_price.map_or(true, |max| price <= max)
        })
        .collect()
}

/// Keeps candidates rated at least `min_rating`. Unrated candidates are
/// dropped whenever a minimum is set.
pub fn filter_by_rating(candidates: Vec<Candidate>, min_rating: Option<f64>) -> Vec<Candidate> {
    let Some(min) = min_rating else {
        return candidates;
    };
    candidates
        .into_iter()
        .filter(|c| c.rating.is_some_and(|r| r >= min))
        .collect()
}

/// Stable sort by `sort`: `price_low` ascending price, `price_high`
/// descending price, `rating_high` descending rating (unrated last).
/// Any other value keeps the input order.
pub fn sort_candidates(candidates: &mut [Candidate], sort: Option<&str>) {
    match sort {
        Some("price_low") => candidates.sort_by(|a, b| {
            parse_price(&a.price)
                .partial_cmp(&parse_price(&b.price))
                .unwrap_or(Ordering::Equal)
        }),
        Some("price_high") => candidates.sort_by(|a, b| {
            parse_price(&b.price)
                .partial_cmp(&parse_price(&a.price))
                .unwrap_or(Ordering::Equal)
        }),
        Some("rating_high") => candidates.sort_by(|a, b| {
            let ra = a.rating.unwrap_or(f64::NEG_INFINITY);
            let rb = b.rating.unwrap_or(f64::NEG_INFINITY);
            rb.partial_cmp(&ra).unwrap_or(Ordering::Equal)
        }),
        _ => {}
    }
}

/// Applies the price filter, the rating filter and the sort from `query`.
pub fn apply_filters(candidates: Vec<Candidate>, query: &ShoppingQuery) -> (Vec<Candidate>, FilterStats) {
    let input = candidates.len();

    let after_price = filter_by_price(candidates, query.min_price, query.max_price);
    let price_filtered = input - after_price.len();

    let before_rating = after_price.len();
    let mut out = filter_by_rating(after_price, query.min_rating);
    let rating_filtered = before_rating - out.len();

    sort_candidates(&mut out, query.sort.as_deref());

    let stats = FilterStats {
        input,
        price_filtered,
        rating_filtered,
        output: out.len(),
    };
    (out, stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, price: &str, rating: Option<f64>) -> Candidate {
        Candidate {
            image_ref: format!("https://img/{}.jpg", title),
            price: price.to_string(),
            link: format!("https://shop/{}", title),
            rating,
            title: title.to_string(),
            source: "shop".to_string(),
            review_count: None,
        }
    }

    fn titles(items: &[Candidate]) -> Vec<&str> {
        items.iter().map(|c| c.title.as_str()).collect()
    }

    #[test]
    fn parses_currency_tagged_prices() {
        assert_eq!(parse_price("₹1,299.00"), 1299.0);
        assert_eq!(parse_price("$ 45.50"), 45.5);
        assert_eq!(parse_price("Rs. 450"), 450.0);
        assert_eq!(parse_price("€12"), 12.0);
        assert_eq!(parse_price("call for price"), 0.0);
        assert_eq!(parse_price(""), 0.0);
    }

    #[test]
    fn price_bounds_are_inclusive() {
        let items = vec![item("a", "₹500", None), item("b", "₹1,000", None), item("c", "₹1,500", None)];
        let kept = filter_by_price(items, Some(500.0), Some(1000.0));
        assert_eq!(titles(&kept), vec!["a", "b"]);
    }

    #[test]
    fn rating_filter_drops_unrated() {
        let items = vec![item("a", "$1", Some(4.5)), item("b", "$1", None), item("c", "$1", Some(3.9))];
        let kept = filter_by_rating(items, Some(4.0));
        assert_eq!(titles(&kept), vec!["a"]);
    }

    #[test]
    fn no_rating_bound_keeps_unrated() {
        let items = vec![item("a", "$1", None)];
        assert_eq!(filter_by_rating(items, None).len(), 1);
    }

    #[test]
    fn sorts_by_price_and_rating() {
        let base = vec![
            item("mid", "$20", Some(4.0)),
            item("cheap", "$10", None),
            item("dear", "$30", Some(4.8)),
        ];

        let mut v = base.clone();
        sort_candidates(&mut v, Some("price_low"));
        assert_eq!(titles(&v), vec!["cheap", "mid", "dear"]);

        let mut v = base.clone();
        sort_candidates(&mut v, Some("price_high"));
        assert_eq!(titles(&v), vec!["dear", "mid", "cheap"]);

        let mut v = base.clone();
        sort_candidates(&mut v, Some("rating_high"));
        assert_eq!(titles(&v), vec!["dear", "mid", "cheap"]);

        let mut v = base.clone();
        sort_candidates(&mut v, Some("relevance"));
        assert_eq!(titles(&v), vec!["mid", "cheap", "dear"]);
    }

    #[test]
    fn apply_filters_reports_stats() {
        let items = vec![
            item("a", "$5", Some(4.2)),
            item("b", "$50", Some(4.9)),
            item("c", "$15", None),
            item("d", "$12", Some(4.6)),
        ];
        let query = ShoppingQuery {
            max_price: Some(20.0),
            min_rating: Some(4.0),
            sort: Some("price_high".into()),
            ..Default::default()
        };
        let (out, stats) = apply_filters(items, &query);
        assert_eq!(titles(&out), vec!["d", "a"]);
        assert_eq!(
            stats,
            FilterStats {
                input: 4,
                price_filtered: 1,
                rating_filtered: 1,
                output: 2
            }
        );
    }
}
