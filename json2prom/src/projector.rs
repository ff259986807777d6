//! Projection of a JSON document onto gauge samples.
//!
//! The [`Projector`] walks a document depth-first. Objects extend the key
//! path with each (underscore-trimmed) key, non-zero numbers become samples
//! named after the path, and everything else is ignored. Per-key [`Action`]s
//! rewrite the walk on the way down:
//!
//! - `Skip` drops a subtree.
//! - `MapValue` turns a string into a number.
//! - `MakeLabel` turns the children of an object into label values instead of
//!   path segments, optionally reading the value from `LabelKey`.
//!
//! Traversal state is a stack: the key path and the label scope are pushed
//! before descending and popped on return, so siblings never see each
//! other's segments or labels.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{Action, NO_ACTION, Source};
use crate::mapping::{sanitize_label_name, trim_key};
use crate::sample::{Sample, SampleSink};

/// Walks one document of one source and emits its samples into a sink.
pub struct Projector<'a, S: SampleSink + ?Sized> {
    source: &'a Source,
    sink: &'a mut S,
    path: Vec<String>,
    labels: Vec<(String, String)>,
    emitted: usize,
}

impl<'a, S: SampleSink + ?Sized> Projector<'a, S> {
    /// Create a projector seeded with the source's static labels.
    pub fn new(source: &'a Source, sink: &'a mut S) -> Self {
        let labels = source
            .labels
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Self {
            source,
            sink,
            path: Vec::new(),
            labels,
            emitted: 0,
        }
    }

    /// Project a whole document, starting with the root action.
    ///
    /// Returns the number of samples emitted.
    pub fn project(mut self, document: &Value) -> usize {
        let source = self.source;
        self.visit(document, source.root_action());
        self.emitted
    }

    fn visit(&mut self, value: &Value, action: &Action) {
        if action.skip {
            return;
        }

        if let Some(map) = &action.map_value {
            let Some(number) = self.map_value(value, map) else {
                return;
            };
            if let Some(label) = action.make_label_name() {
                warn!(
                    source = %self.source.url,
                    path = %self.path.join("."),
                    label,
                    "MakeLabel applied to a mapped number, dropping subtree"
                );
                return;
            }
            self.emit(number);
            return;
        }

        if let Some(label) = action.make_label_name() {
            self.visit_labelled(value, label, action.label_key_name());
            return;
        }

        match value {
            Value::Object(children) => {
                let source = self.source;
                for (key, child) in children {
                    self.path.push(trim_key(key).to_string());
                    self.visit(child, source.action_for(key));
                    self.path.pop();
                }
            }
            Value::Number(number) => {
                if let Some(number) = number.as_f64() {
                    self.emit(number);
                }
            }
            // Strings, booleans, nulls and arrays carry no gauge
            _ => {}
        }
    }

    /// Number that `map` assigns to the string `value`, if any.
    fn map_value(&self, value: &Value, map: &HashMap<String, f64>) -> Option<f64> {
        let Some(text) = value.as_str() else {
            warn!(
                source = %self.source.url,
                path = %self.path.join("."),
                "MapValue applied to a non-string value, dropping subtree"
            );
            return None;
        };

        let number = map.get(text).copied();
        if number.is_none() {
            debug!(
                source = %self.source.url,
                path = %self.path.join("."),
                value = text,
                "No MapValue entry for value, skipping"
            );
        }
        number
    }

    fn visit_labelled(&mut self, value: &Value, label: &str, label_key: Option<&str>) {
        let Value::Object(children) = value else {
            warn!(
                source = %self.source.url,
                path = %self.path.join("."),
                label,
                "MakeLabel applied to a non-object value, dropping subtree"
            );
            return;
        };

        let exposed = sanitize_label_name(label);
        if self
            .labels
            .iter()
            .any(|(name, _)| sanitize_label_name(name) == exposed)
        {
            warn!(
                source = %self.source.url,
                path = %self.path.join("."),
                label,
                "Label already in scope, dropping subtree"
            );
            return;
        }

        for (key, child) in children {
            let label_value = match label_key {
                None => key.as_str(),
                Some(inner) => match child.get(inner).and_then(Value::as_str) {
                    Some(label_value) => label_value,
                    None => {
                        warn!(
                            source = %self.source.url,
                            path = %self.path.join("."),
                            child = %key,
                            label_key = inner,
                            "LabelKey missing or not a string, dropping child"
                        );
                        continue;
                    }
                },
            };

            self.labels.push((label.to_string(), label_value.to_string()));
            self.visit(child, &NO_ACTION);
            self.labels.pop();
        }
    }

    fn emit(&mut self, value: f64) {
        // Zero reads as "absent"
        if value == 0.0 {
            return;
        }

        let source = self.source;
        match Sample::gauge(
            &source.namespace,
            &source.subsystem,
            &self.path,
            &self.labels,
            value,
        ) {
            Some(sample) => {
                self.sink.emit(sample);
                self.emitted += 1;
            }
            None => debug!(
                source = %source.url,
                "Number at document root has no metric name, ignoring"
            ),
        }
    }
}

/// Project `document` for `source` into `sink`, returning the sample count.
pub fn project<S: SampleSink + ?Sized>(source: &Source, document: &Value, sink: &mut S) -> usize {
    Projector::new(source, sink).project(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn source(config: Value) -> Source {
        let mut config = config;
        config["URL"] = json!("http://upstream.test/");
        serde_json::from_value(config).unwrap()
    }

    fn run(source: &Source, document: Value) -> Vec<Sample> {
        let mut samples = Vec::new();
        let emitted = project(source, &document, &mut samples);
        assert_eq!(emitted, samples.len());
        samples
    }

    fn find<'s>(samples: &'s [Sample], name: &str, labels: &[(&str, &str)]) -> Option<&'s Sample> {
        samples.iter().find(|s| {
            s.name == name
                && s.labels.len() == labels.len()
                && labels.iter().all(|(k, v)| s.label(k) == Some(*v))
        })
    }

    #[test]
    fn test_flat_numeric_map() {
        let source = source(json!({
            "Namespace": "n",
            "Subsystem": "s",
            "Labels": {"env": "t"},
            "Keys": {}
        }));
        let samples = run(&source, json!({"a": 1, "b": 0, "c": 2.5}));

        assert_eq!(samples.len(), 2);
        assert_eq!(find(&samples, "n_s_a", &[("env", "t")]).unwrap().value, 1.0);
        assert_eq!(find(&samples, "n_s_c", &[("env", "t")]).unwrap().value, 2.5);
        assert!(samples.iter().all(|s| s.name != "n_s_b"));
    }

    #[test]
    fn test_nested_make_label() {
        let source = source(json!({"Keys": {"disks": {"MakeLabel": "dev"}}}));
        let samples = run(
            &source,
            json!({"disks": {"sda": {"used": 10}, "sdb": {"used": 20}}}),
        );

        assert_eq!(samples.len(), 2);
        assert_eq!(
            find(&samples, "disks_used", &[("dev", "sda")]).unwrap().value,
            10.0
        );
        assert_eq!(
            find(&samples, "disks_used", &[("dev", "sdb")]).unwrap().value,
            20.0
        );
        assert_eq!(samples[0].help, "disks.used");
    }

    #[test]
    fn test_make_label_with_label_key() {
        let source = source(json!({
            "Keys": {
                "ifs": {"MakeLabel": "iface", "LabelKey": "name"},
                "name": {"Skip": true}
            }
        }));
        let samples = run(
            &source,
            json!({"ifs": {
                "0": {"name": "eth0", "rx": 100},
                "1": {"name": "eth1", "rx": 200}
            }}),
        );

        assert_eq!(samples.len(), 2);
        assert_eq!(
            find(&samples, "ifs_rx", &[("iface", "eth0")]).unwrap().value,
            100.0
        );
        assert_eq!(
            find(&samples, "ifs_rx", &[("iface", "eth1")]).unwrap().value,
            200.0
        );
        for sample in &samples {
            assert!(!sample.name.contains("name"));
            assert!(!sample.name.contains('0') && !sample.name.contains('1'));
            assert!(sample.labels.iter().all(|(_, v)| v != "0" && v != "1"));
        }
    }

    #[test]
    fn test_map_value() {
        let source = source(json!({"Keys": {"state": {"MapValue": {"up": 1, "down": 0}}}}));

        let samples = run(&source, json!({"state": "up"}));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "state");
        assert_eq!(samples[0].value, 1.0);

        // Mapped zero is suppressed like any other zero
        assert!(run(&source, json!({"state": "down"})).is_empty());
    }

    #[test]
    fn test_map_value_miss_skips() {
        let source = source(json!({"Keys": {"state": {"MapValue": {"up": 1}}}}));
        let samples = run(&source, json!({"state": "degraded", "other": 3}));

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "other");
    }

    #[test]
    fn test_map_value_on_non_string_drops_subtree() {
        let source = source(json!({"Keys": {"state": {"MapValue": {"up": 1}}}}));
        let samples = run(&source, json!({"state": {"nested": 5}, "ok": 1}));

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "ok");
    }

    #[test]
    fn test_map_value_on_array_drops_subtree() {
        let source = source(json!({"Keys": {"state": {"MapValue": {"up": 1}}}}));
        let samples = run(&source, json!({"state": ["up", "down"], "ok": 1}));

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "ok");
    }

    #[test]
    fn test_map_value_non_finite_numbers_are_emitted() {
        let mut source = source(json!({}));
        source.keys.insert(
            "state".to_string(),
            Action {
                map_value: Some(HashMap::from([
                    ("overload".to_string(), f64::INFINITY),
                    ("unknown".to_string(), f64::NAN),
                ])),
                ..Default::default()
            },
        );

        let samples = run(&source, json!({"state": "overload"}));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, f64::INFINITY);

        let samples = run(&source, json!({"state": "unknown"}));
        assert_eq!(samples.len(), 1);
        assert!(samples[0].value.is_nan());
    }

    #[test]
    fn test_underscore_trimming() {
        let source = source(json!({}));
        let samples = run(&source, json!({"__count__": 7, "_outer_": {"__inner": 2}}));

        assert!(find(&samples, "count", &[]).is_some());
        assert!(find(&samples, "outer_inner", &[]).is_some());
    }

    #[test]
    fn test_trimmed_and_plain_keys_collide() {
        let source = source(json!({}));
        let trimmed = run(&source, json!({"__foo__": 1}));
        let plain = run(&source, json!({"foo": 1}));

        assert_eq!(trimmed[0].name, plain[0].name);
    }

    #[test]
    fn test_actions_use_raw_keys() {
        let source = source(json!({"Keys": {"__skip_me": {"Skip": true}}}));
        let samples = run(&source, json!({"__skip_me": 1, "skip_me": 2}));

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 2.0);
    }

    #[test]
    fn test_skip_closure() {
        let source = source(json!({"Keys": {"internal": {"Skip": true}}}));
        let samples = run(
            &source,
            json!({
                "internal": {"a": 1, "b": {"c": 2}},
                "public": {"a": 3, "internal": {"d": 4}}
            }),
        );

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "public_a");
        assert!(samples.iter().all(|s| !s.help.contains("internal")));
    }

    #[test]
    fn test_label_scoping() {
        let source = source(json!({"Keys": {"disks": {"MakeLabel": "dev"}}}));
        let samples = run(
            &source,
            json!({
                "disks": {"sda": {"used": 1, "io": {"reads": 5}}},
                "uptime": 99
            }),
        );

        assert_eq!(samples.len(), 3);
        assert!(find(&samples, "disks_used", &[("dev", "sda")]).is_some());
        assert!(find(&samples, "disks_io_reads", &[("dev", "sda")]).is_some());
        assert!(find(&samples, "uptime", &[]).is_some());
    }

    #[test]
    fn test_nested_make_labels() {
        let source = source(json!({
            "Keys": {
                "hosts": {"MakeLabel": "host"},
                "disks": {"MakeLabel": "dev"}
            }
        }));
        let samples = run(
            &source,
            json!({"hosts": {
                "h1": {"disks": {"sda": {"used": 1}}},
                "h2": {"disks": {"sdb": {"used": 2}}}
            }}),
        );

        assert_eq!(samples.len(), 2);
        assert!(find(&samples, "hosts_disks_used", &[("host", "h1"), ("dev", "sda")]).is_some());
        assert!(find(&samples, "hosts_disks_used", &[("host", "h2"), ("dev", "sdb")]).is_some());
    }

    #[test]
    fn test_make_label_children_get_no_action() {
        // The children of a MakeLabel object are not looked up in Keys
        let source = source(json!({
            "Keys": {
                "disks": {"MakeLabel": "dev"},
                "sda": {"Skip": true}
            }
        }));
        let samples = run(&source, json!({"disks": {"sda": {"used": 1}}}));

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].label("dev"), Some("sda"));
    }

    #[test]
    fn test_make_label_on_non_object_drops_subtree() {
        let source = source(json!({"Keys": {"disks": {"MakeLabel": "dev"}}}));
        let samples = run(&source, json!({"disks": 5, "other": 1}));

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "other");
    }

    #[test]
    fn test_make_label_collision_drops_subtree() {
        let source = source(json!({
            "Keys": {
                "outer": {"MakeLabel": "x"},
                "inner": {"MakeLabel": "x"}
            }
        }));
        let samples = run(
            &source,
            json!({"outer": {"a": {"inner": {"b": {"v": 1}}, "w": 2}}}),
        );

        assert_eq!(samples.len(), 1);
        assert!(find(&samples, "outer_w", &[("x", "a")]).is_some());
    }

    #[test]
    fn test_make_label_collision_after_sanitizing_drops_subtree() {
        let source = source(json!({
            "Keys": {
                "hosts": {"MakeLabel": "host-name"},
                "disks": {"MakeLabel": "host_name"}
            }
        }));
        let samples = run(
            &source,
            json!({"hosts": {"h1": {"disks": {"sda": {"v": 1}}, "up": 1}}}),
        );

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "hosts_up");
        assert_eq!(samples[0].labels, vec![("host_name".to_string(), "h1".to_string())]);
    }

    #[test]
    fn test_label_key_missing_drops_child() {
        let source = source(json!({"Keys": {"ifs": {"MakeLabel": "iface", "LabelKey": "name"}}}));
        let samples = run(
            &source,
            json!({"ifs": {
                "0": {"name": "eth0", "rx": 1},
                "1": {"rx": 2},
                "2": {"name": 7, "rx": 3}
            }}),
        );

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].label("iface"), Some("eth0"));
    }

    #[test]
    fn test_root_action() {
        let source = source(json!({"Keys": {"^": {"MakeLabel": "node"}}}));
        let samples = run(&source, json!({"n1": {"load": 0.5}, "n2": {"load": 1.5}}));

        assert_eq!(samples.len(), 2);
        assert_eq!(
            find(&samples, "load", &[("node", "n1")]).unwrap().value,
            0.5
        );
        assert_eq!(
            find(&samples, "load", &[("node", "n2")]).unwrap().value,
            1.5
        );
    }

    #[test]
    fn test_root_skip() {
        let source = source(json!({"Keys": {"^": {"Skip": true}}}));
        assert!(run(&source, json!({"a": 1})).is_empty());
    }

    #[test]
    fn test_root_number_has_no_name() {
        let source = source(json!({"Namespace": "n"}));
        assert!(run(&source, json!(42)).is_empty());
    }

    #[test]
    fn test_non_numeric_leaves_ignored() {
        let source = source(json!({}));
        let samples = run(
            &source,
            json!({
                "s": "text",
                "b": true,
                "n": null,
                "arr": [1, 2, 3],
                "x": -3
            }),
        );

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "x");
        assert_eq!(samples[0].value, -3.0);
    }

    #[test]
    fn test_sibling_state_isolated() {
        let source = source(json!({
            "Labels": {"env": "t"},
            "Keys": {"a": {"MakeLabel": "k"}}
        }));
        let samples = run(
            &source,
            json!({
                "a": {"x": {"deep": {"v": 1}}},
                "b": {"v": 2}
            }),
        );

        let b = find(&samples, "b_v", &[("env", "t")]).unwrap();
        assert_eq!(b.help, "b.v");
        assert_eq!(b.labels, vec![("env".to_string(), "t".to_string())]);
        assert!(find(&samples, "a_deep_v", &[("env", "t"), ("k", "x")]).is_some());
    }

    #[test]
    fn test_projection_is_deterministic() {
        let source = source(json!({"Keys": {"disks": {"MakeLabel": "dev"}}}));
        let document = json!({"disks": {"sda": {"used": 10}, "sdb": {"used": 20}}, "x": 1});

        let as_set = |samples: Vec<Sample>| {
            samples
                .into_iter()
                .map(|s| (s.name, s.labels, s.value.to_bits()))
                .collect::<std::collections::BTreeSet<_>>()
        };

        assert_eq!(
            as_set(run(&source, document.clone())),
            as_set(run(&source, document))
        );
    }

    #[test]
    fn test_static_labels_sorted() {
        let mut labels = BTreeMap::new();
        labels.insert("zone".to_string(), "z".to_string());
        labels.insert("app".to_string(), "a".to_string());
        let source = Source {
            url: "http://upstream.test/".to_string(),
            labels,
            ..Default::default()
        };

        let samples = run(&source, json!({"v": 1}));
        let names: Vec<_> = samples[0].labels.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["app", "zone"]);
    }
}
