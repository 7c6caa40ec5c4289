//! Minimal Prometheus text-format ingestion for consumer-service scraping.
//!
//! Only the bare metric name and the value survive: labels are stripped and
//! HELP/TYPE lines skipped, because the charts key on the name alone. Two
//! series differing only by labels therefore collide by name.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct PromMetric {
    pub name: String,
    pub value: f64,
}

/// Parses Prometheus text exposition into ordered `(name, value)` pairs.
/// Lines that don't parse are silently dropped.
pub fn parse_prometheus_metrics(data: &str) -> Vec<PromMetric> {
    let mut metrics = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(first) = fields.next() else {
            continue;
        };
        let Some(last) = fields.last() else {
            // single token, no value
            continue;
        };
        let name = match first.find('{') {
            Some(idx) if idx > 0 => &first[..idx],
            _ => first,
        };
        if let Ok(value) = last.parse::<f64>() {
            metrics.push(PromMetric {
                name: name.to_string(),
                value,
            });
        }
    }
    metrics
}

/// Fetches and parses metrics from a consumer endpoint, appending
/// `/metrics` when the URL doesn't already point at one.
pub async fn fetch_consumer_metrics(url: &str) -> anyhow::Result<Vec<PromMetric>> {
    let mut url = url.to_string();
    if !url.contains("/metrics") {
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str("metrics");
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    let resp = client.get(&url).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("HTTP {}", resp.status().as_u16());
    }
    let body = resp.text().await?;
    Ok(parse_prometheus_metrics(&body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labels_comments_and_bad_lines() {
        let input = "# HELP x\nfoo_total{a=\"b\"} 42\nbar 3.14\nbad line\n";
        let out = parse_prometheus_metrics(input);
        assert_eq!(
            out,
            vec![
                PromMetric { name: "foo_total".into(), value: 42. },
                PromMetric { name: "bar".into(), value: 3.14 },
            ]
        );
    }

    #[test]
    fn takes_last_token_as_value() {
        // timestamped exposition: value is the second field, timestamp last;
        // the last-token rule keeps the original's behavior of picking the
        // final parseable field
        let out = parse_prometheus_metrics("m 1.5 1700000000\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "m");
        assert!((out[0].value - 1_700_000_000.).abs() < 1.);
    }

    #[test]
    fn empty_and_whitespace_input() {
        assert!(parse_prometheus_metrics("").is_empty());
        assert!(parse_prometheus_metrics("   \n\t\n").is_empty());
        assert!(parse_prometheus_metrics("lonely_token\n").is_empty());
    }

    #[test]
    fn name_starting_with_brace_kept_whole() {
        let out = parse_prometheus_metrics("{weird} 1\n");
        assert_eq!(out[0].name, "{weird}");
    }

    #[test]
    fn negative_and_scientific_values() {
        let out = parse_prometheus_metrics("a -4\nb 1e3\n");
        assert_eq!(out[0].value, -4.);
        assert_eq!(out[1].value, 1000.);
    }
}
