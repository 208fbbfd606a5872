//! In-place edits of quota manifests.
//!
//! The edit keeps every untouched line byte-identical: the document is
//! parsed only to learn which mapping keys actually exist, and the
//! rewrite itself is line-oriented so comments, ordering and indentation
//! survive. When the document does not parse as YAML the rewrite runs
//! unrestricted over matching `<key>:` lines.

use std::collections::BTreeSet;

use super::NewLimits;

/// Apply new limits to a manifest, returning the edited content.
pub fn apply_new_limits(content: &str, limits: &NewLimits) -> String {
    let known_keys = match serde_yaml::from_str::<serde_yaml::Value>(content) {
        Ok(doc) => {
            let mut keys = BTreeSet::new();
            collect_matching_keys(&doc, limits, &mut keys);
            Some(keys)
        }
        Err(_) => None,
    };
    rewrite_lines(content, limits, known_keys.as_ref())
}

/// Does a mapping key refer to this resource? Short and prefixed request
/// names alias each other; `limits.*` keys only match exactly.
pub fn matches_resource_key(key: &str, res: &str) -> bool {
    if key == res {
        return true;
    }
    for (long, short) in
        [("requests.cpu", "cpu"), ("requests.memory", "memory")]
    {
        if (key == long && res == short) || (key == short && res == long) {
            return true;
        }
    }
    false
}

fn collect_matching_keys(
    node: &serde_yaml::Value,
    limits: &NewLimits,
    out: &mut BTreeSet<String>,
) {
    match node {
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                if let serde_yaml::Value::String(key) = k {
                    if limits
                        .keys()
                        .any(|res| matches_resource_key(key, res))
                    {
                        out.insert(key.clone());
                    }
                }
                collect_matching_keys(v, limits, out);
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for v in seq {
                collect_matching_keys(v, limits, out);
            }
        }
        _ => {}
    }
}

fn rewrite_lines(
    content: &str,
    limits: &NewLimits,
    known_keys: Option<&BTreeSet<String>>,
) -> String {
    let mut out = Vec::new();
    for line in content.lines() {
        out.push(rewrite_line(line, limits, known_keys));
    }
    let mut result = out.join("\n");
    if content.ends_with('\n') {
        result.push('\n');
    }
    result
}

fn rewrite_line(
    line: &str,
    limits: &NewLimits,
    known_keys: Option<&BTreeSet<String>>,
) -> String {
    let Some(colon) = line.find(':') else {
        return line.to_string();
    };
    let (key_part, _) = line.split_at(colon);
    let key = key_part.trim().trim_matches(|c| c == '"' || c == '\'');
    if key.is_empty() || key.starts_with('#') {
        return line.to_string();
    }
    if let Some(keys) = known_keys {
        if !keys.contains(key) {
            return line.to_string();
        }
    }
    for (res, qty) in limits {
        if matches_resource_key(key, res) {
            return format!("{}: \"{}\"", key_part, qty);
        }
    }
    line.to_string()
}
