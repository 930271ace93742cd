//! Request counters scraped from the reverse proxy's text exposition.

use std::{collections::HashMap, time::Duration};

use once_cell::sync::Lazy;
use regex::Regex;

static SAMPLE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z_:][a-zA-Z0-9_:]*)\{([^}]*)\}\s+(\S+)").expect("valid sample regex")
});

static SERVICE_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:^|,)\s*service="([^"@]+)@[^"]*""#).expect("valid label regex"));

/// Sums every `metric{..,service="<slug>@<kind>",..} value` line per slug.
pub fn parse_request_counters(body: &str, metric: &str) -> HashMap<String, f64> {
    let mut counters = HashMap::new();
    for line in body.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(captures) = SAMPLE_LINE.captures(line) else {
            continue;
        };
        if &captures[1] != metric {
            continue;
        }
        let Some(service) = SERVICE_LABEL.captures(&captures[2]) else {
            continue;
        };
        let Ok(value) = captures[3].parse::<f64>() else {
            continue;
        };
        if !value.is_finite() {
            continue;
        }
        *counters.entry(service[1].to_string()).or_insert(0.0) += value;
    }
    counters
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestRates {
    pub per_app: HashMap<String, f64>,
    pub total: f64,
}

impl RequestRates {
    pub fn for_app(&self, app_id: &str) -> f64 {
        self.per_app.get(app_id).copied().unwrap_or(0.0)
    }
}

/// Requests per minute between two counter scrapes taken `interval` apart. `None` without a
/// previous scrape; slugs absent from the previous scrape are treated as new baselines.
pub fn request_rates(
    previous: Option<&HashMap<String, f64>>,
    current: &HashMap<String, f64>,
    registry: &HashMap<String, String>,
    interval: Duration,
) -> Option<RequestRates> {
    let previous = previous?;
    let minutes = (interval.as_millis() as f64 / 60_000.0).max(f64::EPSILON);
    let mut rates = RequestRates::default();
    for (slug, value) in current {
        let Some(before) = previous.get(slug) else {
            continue;
        };
        let rate = (value - before).max(0.0) / minutes;
        rates.total += rate;
        if let Some(app_id) = registry.get(slug) {
            *rates.per_app.entry(app_id.clone()).or_insert(0.0) += rate;
        }
    }
    Some(rates)
}
