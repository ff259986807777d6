//! Naming rules for turning JSON key paths into Prometheus metric and label names.

/// Strip leading and trailing underscores from a JSON key.
pub fn trim_key(key: &str) -> &str {
    key.trim_matches('_')
}

/// Join namespace, subsystem and name with `_`, skipping empty parts.
///
/// An empty `name` yields an empty result regardless of the prefixes, so a
/// number at the document root never produces a metric named after its
/// namespace alone.
pub fn build_fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }

    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// Replace characters outside `[a-zA-Z0-9_]` (plus `:` when `colons`) with
/// `_`, and prefix a leading digit with `_`.
fn sanitize(name: &str, colons: bool) -> String {
    let leading_digit = name.starts_with(|c: char| c.is_ascii_digit());

    let mut out = String::with_capacity(name.len() + 1);
    if leading_digit {
        out.push('_');
    }
    out.extend(name.chars().map(|c| {
        if c.is_ascii_alphanumeric() || c == '_' || (colons && c == ':') {
            c
        } else {
            '_'
        }
    }));
    out
}

/// Metric name in `[a-zA-Z_:][a-zA-Z0-9_:]*` form.
///
/// Existing underscores are kept as they are, so `a__b` stays `a__b`.
pub fn sanitize_metric_name(name: &str) -> String {
    sanitize(name, true)
}

/// Label name in `[a-zA-Z_][a-zA-Z0-9_]*` form.
///
/// Names in the reserved `__` namespace get a `z` prefix; an empty name
/// becomes `label`.
pub fn sanitize_label_name(name: &str) -> String {
    if name.is_empty() {
        return "label".to_string();
    }

    let mut out = sanitize(name, false);
    if out.starts_with("__") {
        out.insert(0, 'z');
    }
    out
}
