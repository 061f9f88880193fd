//! Domain label parsing and desired-set extraction.
//!
//! Apps declare the domains they want certificates for through app-level
//! labels: `MARATHON_ACME_{n}_DOMAIN` names the domain(s) for port index `n`,
//! and `HAPROXY_{n}_GROUP` (falling back to `HAPROXY_GROUP`) decides which
//! load-balancer fleet the port belongs to. Only ports in the configured
//! group contribute to the desired set.

use std::collections::BTreeSet;

use crate::marathon::App;

/// Split a domain label value into individual domain names.
///
/// Values may separate entries with commas, whitespace, or both. Empty
/// entries vanish; surviving entries are lowercased.
pub fn parse_domain_label(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|entry| !entry.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Syntactic DNS name validation on an already-lowercased name.
///
/// Labels are 1-63 characters of `[a-z0-9-]` with no leading or trailing
/// hyphen, the whole name is at most 253 characters and contains at least
/// one dot.
pub fn valid_dns_name(name: &str) -> bool {
    if name.len() > 253 || !name.contains('.') {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    })
}

/// Compute the desired certificate set for a list of applications.
///
/// In single-cert mode only the first entry of each domain label counts;
/// with `allow_multiple` every entry does. Invalid names are dropped with a
/// warning and never fail the batch. Duplicates across apps collapse.
pub fn extract(apps: &[App], group: &str, allow_multiple: bool) -> BTreeSet<String> {
    let mut desired = BTreeSet::new();

    for app in apps {
        let app_group = app.labels.get("HAPROXY_GROUP").map(String::as_str);

        for port in 0..app.port_count() {
            let effective_group = app
                .labels
                .get(&format!("HAPROXY_{port}_GROUP"))
                .map(String::as_str)
                .or(app_group);
            if effective_group != Some(group) {
                continue;
            }

            let Some(label) = app.labels.get(&format!("MARATHON_ACME_{port}_DOMAIN")) else {
                continue;
            };

            let mut names = parse_domain_label(label);
            if !allow_multiple {
                names.truncate(1);
            }

            for name in names {
                if !valid_dns_name(&name) {
                    tracing::warn!(
                        app = %app.id,
                        port,
                        domain = %name,
                        "Ignoring invalid domain in label"
                    );
                    continue;
                }
                if !desired.insert(name.clone()) {
                    tracing::debug!(
                        app = %app.id,
                        domain = %name,
                        "Domain already claimed by another app or port"
                    );
                }
            }
        }
    }

    desired
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(json: serde_json::Value) -> App {
        serde_json::from_value(json).unwrap()
    }

    fn simple_app(labels: serde_json::Value) -> App {
        app(serde_json::json!({
            "id": "/my-app_1",
            "labels": labels,
            "portDefinitions": [{"port": 9000, "protocol": "tcp", "labels": {}}],
        }))
    }

    #[test]
    fn parse_single_domain() {
        assert_eq!(parse_domain_label("example.com"), vec!["example.com"]);
    }

    #[test]
    fn parse_whitespace_only_is_empty() {
        assert!(parse_domain_label(" ").is_empty());
        assert!(parse_domain_label("").is_empty());
    }

    #[test]
    fn parse_multiple_domains() {
        assert_eq!(
            parse_domain_label("example.com,example2.com"),
            vec!["example.com", "example2.com"]
        );
    }

    #[test]
    fn parse_multiple_domains_with_whitespace() {
        assert_eq!(
            parse_domain_label(" example.com, example2.com "),
            vec!["example.com", "example2.com"]
        );
    }

    #[test]
    fn parse_lowercases_entries() {
        assert_eq!(parse_domain_label("Example.COM"), vec!["example.com"]);
    }

    #[test]
    fn dns_name_rules() {
        assert!(valid_dns_name("example.com"));
        assert!(valid_dns_name("a.b.c.example.com"));
        assert!(valid_dns_name("xn--bcher-kva.example"));

        // No dot, empty labels, bad characters, hyphen placement.
        assert!(!valid_dns_name("localhost"));
        assert!(!valid_dns_name(".example.com"));
        assert!(!valid_dns_name("example..com"));
        assert!(!valid_dns_name("example.com."));
        assert!(!valid_dns_name("exa_mple.com"));
        assert!(!valid_dns_name("-example.com"));
        assert!(!valid_dns_name("example-.com"));
    }

    #[test]
    fn dns_name_length_limits() {
        let label_63 = "a".repeat(63);
        let label_64 = "a".repeat(64);
        assert!(valid_dns_name(&format!("{label_63}.com")));
        assert!(!valid_dns_name(&format!("{label_64}.com")));

        let long = format!("{}.{}.{}.{}.com", label_63, label_63, label_63, label_63);
        assert!(long.len() > 253);
        assert!(!valid_dns_name(&long));
    }

    #[test]
    fn extract_matching_app() {
        let apps = [simple_app(serde_json::json!({
            "HAPROXY_GROUP": "external",
            "MARATHON_ACME_0_DOMAIN": "example.com",
        }))];
        let desired = extract(&apps, "external", false);
        assert_eq!(desired.into_iter().collect::<Vec<_>>(), ["example.com"]);
    }

    #[test]
    fn extract_group_mismatch() {
        let apps = [simple_app(serde_json::json!({
            "HAPROXY_GROUP": "internal",
            "MARATHON_ACME_0_DOMAIN": "example.com",
        }))];
        assert!(extract(&apps, "external", false).is_empty());
    }

    #[test]
    fn extract_port_group_overrides_app_group() {
        let apps = [simple_app(serde_json::json!({
            "HAPROXY_GROUP": "external",
            "HAPROXY_0_GROUP": "internal",
            "MARATHON_ACME_0_DOMAIN": "example.com",
        }))];
        assert!(extract(&apps, "external", false).is_empty());
    }

    #[test]
    fn extract_no_domain_label() {
        let apps = [simple_app(serde_json::json!({
            "HAPROXY_GROUP": "external",
            "HAPROXY_0_VHOST": "example.com",
        }))];
        assert!(extract(&apps, "external", false).is_empty());
    }

    #[test]
    fn extract_single_cert_mode_takes_first_entry() {
        let apps = [simple_app(serde_json::json!({
            "HAPROXY_GROUP": "external",
            "MARATHON_ACME_0_DOMAIN": "a.example.com, b.example.com",
        }))];
        let desired = extract(&apps, "external", false);
        assert_eq!(desired.into_iter().collect::<Vec<_>>(), ["a.example.com"]);
    }

    #[test]
    fn extract_multi_cert_mode_takes_all_entries() {
        let apps = [simple_app(serde_json::json!({
            "HAPROXY_GROUP": "external",
            "MARATHON_ACME_0_DOMAIN": "a.example.com, b.example.com",
        }))];
        let desired = extract(&apps, "external", true);
        assert_eq!(
            desired.into_iter().collect::<Vec<_>>(),
            ["a.example.com", "b.example.com"]
        );
    }

    #[test]
    fn extract_second_port_uses_indexed_label() {
        let apps = [app(serde_json::json!({
            "id": "/two-ports",
            "labels": {
                "HAPROXY_GROUP": "external",
                "MARATHON_ACME_1_DOMAIN": "b.example.com",
            },
            "portDefinitions": [
                {"port": 9000, "protocol": "tcp"},
                {"port": 9001, "protocol": "tcp"},
            ],
        }))];
        let desired = extract(&apps, "external", false);
        assert_eq!(desired.into_iter().collect::<Vec<_>>(), ["b.example.com"]);
    }

    #[test]
    fn extract_counts_container_port_mappings() {
        let apps = [app(serde_json::json!({
            "id": "/bridged",
            "labels": {
                "HAPROXY_GROUP": "external",
                "MARATHON_ACME_0_DOMAIN": "c.example.com",
            },
            "container": {
                "type": "DOCKER",
                "portMappings": [{"containerPort": 80, "hostPort": 0}],
            },
        }))];
        let desired = extract(&apps, "external", false);
        assert_eq!(desired.into_iter().collect::<Vec<_>>(), ["c.example.com"]);
    }

    #[test]
    fn extract_deduplicates_across_apps() {
        let apps = [
            simple_app(serde_json::json!({
                "HAPROXY_GROUP": "external",
                "MARATHON_ACME_0_DOMAIN": "example.com",
            })),
            simple_app(serde_json::json!({
                "HAPROXY_GROUP": "external",
                "MARATHON_ACME_0_DOMAIN": "example.com",
            })),
        ];
        assert_eq!(extract(&apps, "external", false).len(), 1);
    }

    #[test]
    fn extract_drops_invalid_names_without_failing_batch() {
        let apps = [simple_app(serde_json::json!({
            "HAPROXY_GROUP": "external",
            "MARATHON_ACME_0_DOMAIN": "not_a_domain, good.example.com",
        }))];
        let desired = extract(&apps, "external", true);
        assert_eq!(
            desired.into_iter().collect::<Vec<_>>(),
            ["good.example.com"]
        );
    }

    #[test]
    fn extract_is_deterministic() {
        let apps = [
            simple_app(serde_json::json!({
                "HAPROXY_GROUP": "external",
                "MARATHON_ACME_0_DOMAIN": "b.example.com",
            })),
            simple_app(serde_json::json!({
                "HAPROXY_GROUP": "external",
                "MARATHON_ACME_0_DOMAIN": "a.example.com",
            })),
        ];
        let first = extract(&apps, "external", false);
        let second = extract(&apps, "external", false);
        assert_eq!(first, second);
        assert_eq!(
            first.into_iter().collect::<Vec<_>>(),
            ["a.example.com", "b.example.com"]
        );
    }
}
