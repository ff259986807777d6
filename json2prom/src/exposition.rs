//! Text exposition of a scrape through `prometheus-client`.
//!
//! Samples are collected fresh on every request, so they are handed to a
//! per-request [`Registry`] as an unchecked [`Collector`] rather than as
//! registered metrics.

use std::collections::BTreeMap;

use prometheus_client::collector::Collector;
use prometheus_client::encoding::DescriptorEncoder;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::MetricType;
use prometheus_client::registry::Registry;

use crate::collector::ExporterMetrics;
use crate::sample::Sample;

/// Content type of the rendered exposition.
pub const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// The samples of one scrape, encoded as gauge families.
#[derive(Debug)]
pub struct ScrapeBatch {
    samples: Vec<Sample>,
}

impl ScrapeBatch {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl Collector for ScrapeBatch {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), std::fmt::Error> {
        // One descriptor per metric name, series grouped beneath it
        let mut families: BTreeMap<&str, Vec<&Sample>> = BTreeMap::new();
        for sample in &self.samples {
            families.entry(&sample.name).or_default().push(sample);
        }

        for (name, series) in families {
            let help = series
                .first()
                .map(|s| escape_help(&s.help))
                .unwrap_or_default();
            let mut metric = encoder.encode_descriptor(name, &help, None, MetricType::Gauge)?;

            for sample in series {
                if sample.labels.is_empty() {
                    metric.encode_gauge(&sample.value)?;
                } else {
                    let labels: Vec<(&str, String)> = sample
                        .labels
                        .iter()
                        .map(|(name, value)| (name.as_str(), escape_label_value(value)))
                        .collect();
                    metric.encode_family(&labels)?.encode_gauge(&sample.value)?;
                }
            }
        }

        Ok(())
    }
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape special characters in help text. Quotes are left as they are.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Render the exporter self-metrics followed by a scrape's samples.
pub fn render(samples: Vec<Sample>, metrics: &ExporterMetrics) -> Result<String, std::fmt::Error> {
    let mut registry = Registry::default();
    registry.register_collector(Box::new(ScrapeBatch::new(samples)));
    metrics.register(&mut registry);

    let mut body = String::new();
    encode(&mut body, &registry)?;
    Ok(body)
}
