//! Placeholder interpolation for catalog templates
//!
//! Catalog URLs and header values may reference per-connection settings as
//! `${connectionConfig.key}`. Unresolved placeholders are left literal so a
//! misconfigured connection produces a visible artifact instead of a
//! silently mangled URL.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{connectionConfig\.([^}]+)\}").expect("placeholder regex is valid")
});

fn config_str<'a>(config: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

/// Replace every `${connectionConfig.key}` with the matching config value.
pub fn interpolate(input: &str, config: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match config_str(config, &caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Resolve an `a||b` base-URL alternation, then interpolate.
///
/// The first branch is chosen when the connection config defines the key its
/// first placeholder references; otherwise the second branch applies.
pub fn resolve_base_url(base_url: &str, config: &Map<String, Value>) -> String {
    let chosen = match base_url.split_once("||") {
        Some((primary, fallback)) => {
            let primary = primary.trim();
            let fallback = fallback.trim();
            let primary_applies = PLACEHOLDER
                .captures(primary)
                .map(|caps| config_str(config, &caps[1]).is_some())
                // A branch without placeholders always applies.
                .unwrap_or(true);
            if primary_applies { primary } else { fallback }
        }
        None => base_url,
    };
    interpolate(chosen, config)
}

/// Keys of all placeholders left unresolved after interpolation.
pub fn unresolved_keys(input: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn interpolates_known_keys() {
        let cfg = config(&[("subdomain", "acme")]);
        assert_eq!(
            interpolate("https://${connectionConfig.subdomain}.example.com/v1", &cfg),
            "https://acme.example.com/v1"
        );
    }

    #[test]
    fn unknown_keys_stay_literal() {
        let cfg = Map::new();
        let out = interpolate("https://${connectionConfig.missing}.example.com", &cfg);
        assert_eq!(out, "https://${connectionConfig.missing}.example.com");
        assert_eq!(unresolved_keys(&out), vec!["missing".to_string()]);
    }

    #[test]
    fn alternation_prefers_first_branch_when_key_present() {
        let cfg = config(&[("subdomain", "acme")]);
        let url = resolve_base_url(
            "https://${connectionConfig.subdomain}.gorgias.com||https://api.gorgias.com",
            &cfg,
        );
        assert_eq!(url, "https://acme.gorgias.com");
    }

    #[test]
    fn alternation_falls_back_when_key_absent() {
        let cfg = Map::new();
        let url = resolve_base_url(
            "https://${connectionConfig.subdomain}.gorgias.com||https://api.gorgias.com",
            &cfg,
        );
        assert_eq!(url, "https://api.gorgias.com");
    }

    #[test]
    fn plain_base_url_passes_through() {
        let cfg = Map::new();
        assert_eq!(
            resolve_base_url("https://api.github.com", &cfg),
            "https://api.github.com"
        );
    }
}
