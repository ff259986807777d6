//! Gauge samples produced by a scrape and the sinks that receive them.

use std::fmt;

use tokio::sync::mpsc;
use tracing::trace;

use crate::mapping::{build_fq_name, sanitize_label_name, sanitize_metric_name};

/// One gauge observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Fully qualified metric name (`namespace_subsystem_path`).
    pub name: String,
    /// Help text: the key path joined with `.`.
    pub help: String,
    /// Label pairs in scope order: static labels first, then the ones
    /// introduced while descending.
    pub labels: Vec<(String, String)>,
    /// The observed value.
    pub value: f64,
}

impl Sample {
    /// Build a gauge sample for a numeric leaf.
    ///
    /// Returns `None` when the key path is empty, since such a leaf has no
    /// metric name.
    pub fn gauge(
        namespace: &str,
        subsystem: &str,
        key_path: &[String],
        labels: &[(String, String)],
        value: f64,
    ) -> Option<Self> {
        let fq_name = build_fq_name(namespace, subsystem, &key_path.join("_"));
        if fq_name.is_empty() {
            return None;
        }

        Some(Self {
            name: sanitize_metric_name(&fq_name),
            help: key_path.join("."),
            labels: labels
                .iter()
                .map(|(name, value)| (sanitize_label_name(name), value.clone()))
                .collect(),
            value,
        })
    }

    /// Value of the named label, if present.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(label, _)| label == name)
            .map(|(_, value)| value.as_str())
    }

    /// Descriptor identifying this sample's metric.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            name: self.name.clone(),
            help: self.help.clone(),
            label_names: self.labels.iter().map(|(name, _)| name.clone()).collect(),
        }
    }
}

/// Metric identity without a value: name, help and label names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Descriptor {
    pub name: String,
    pub help: String,
    pub label_names: Vec<String>,
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.label_names.is_empty() {
            write!(f, "{{{}}}", self.label_names.join(","))?;
        }
        write!(f, " gauge {}", self.help)
    }
}

/// Destination for samples emitted during traversal.
pub trait SampleSink {
    /// Push one sample.
    fn emit(&mut self, sample: Sample);
}

impl SampleSink for Vec<Sample> {
    fn emit(&mut self, sample: Sample) {
        self.push(sample);
    }
}

impl SampleSink for mpsc::UnboundedSender<Sample> {
    fn emit(&mut self, sample: Sample) {
        if let Err(e) = self.send(sample) {
            trace!(metric = %e.0.name, "Scrape receiver gone, discarding sample");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_gauge_name_and_help() {
        let sample = Sample::gauge(
            "n",
            "s",
            &path(&["disks", "used"]),
            &labels(&[("dev", "sda")]),
            10.0,
        )
        .unwrap();

        assert_eq!(sample.name, "n_s_disks_used");
        assert_eq!(sample.help, "disks.used");
        assert_eq!(sample.label("dev"), Some("sda"));
        assert_eq!(sample.value, 10.0);
    }

    #[test]
    fn test_gauge_without_prefixes() {
        let sample = Sample::gauge("", "", &path(&["state"]), &[], 1.0).unwrap();
        assert_eq!(sample.name, "state");
        assert!(sample.labels.is_empty());
    }

    #[test]
    fn test_gauge_empty_path() {
        assert!(Sample::gauge("n", "s", &[], &[], 1.0).is_none());
    }

    #[test]
    fn test_gauge_sanitizes_names() {
        let sample = Sample::gauge(
            "my-app",
            "",
            &path(&["cpu.load", "1m"]),
            &labels(&[("host-name", "a")]),
            0.5,
        )
        .unwrap();

        assert_eq!(sample.name, "my_app_cpu_load_1m");
        assert_eq!(sample.help, "cpu.load.1m");
        assert_eq!(sample.label("host_name"), Some("a"));
    }

    #[test]
    fn test_descriptor() {
        let sample = Sample::gauge(
            "",
            "",
            &path(&["ifs", "rx"]),
            &labels(&[("env", "t"), ("iface", "eth0")]),
            100.0,
        )
        .unwrap();

        let desc = sample.descriptor();
        assert_eq!(desc.name, "ifs_rx");
        assert_eq!(desc.label_names, vec!["env", "iface"]);
        assert_eq!(desc.to_string(), "ifs_rx{env,iface} gauge ifs.rx");
    }

    #[test]
    fn test_vec_sink() {
        let mut sink = Vec::new();
        let sample = Sample::gauge("", "", &path(&["a"]), &[], 1.0).unwrap();
        sink.emit(sample.clone());
        assert_eq!(sink, vec![sample]);
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (mut tx, mut rx) = mpsc::unbounded_channel();
        let sample = Sample::gauge("", "", &path(&["a"]), &[], 2.0).unwrap();

        tx.emit(sample.clone());
        drop(tx);

        assert_eq!(rx.recv().await, Some(sample));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_channel_sink_after_receiver_dropped() {
        let (mut tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        // Must not panic
        tx.emit(Sample::gauge("", "", &path(&["a"]), &[], 1.0).unwrap());
    }
}
