//! Effective access resolution and client directive synthesis.
//!
//! For a (user, node) pair the effective rule set is the union of the
//! user's own rules and the rules of every group the user belongs to,
//! keeping only active rules, deduplicated by rule id, and restricted to
//! rules whose network scope the node can reach. Everything outside that
//! set is denied; the deny is stated explicitly in every output.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::access::rule::{AccessRule, Destination, FirewallRule};
use crate::model::{Assignee, Node, NodeSettings, User};
use crate::store::Stores;
use crate::Result;

/// Directive sent instead of per-network routes in full-tunnel mode.
pub const REDIRECT_GATEWAY: &str = "push \"redirect-gateway def1 bypass-dhcp\"";

// ─────────────────────────────────────────────────────────────────────────────
// Decisions
// ─────────────────────────────────────────────────────────────────────────────

/// Policy applied to traffic no rule grants. There is only one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    /// Drop.
    #[default]
    Deny,
}

/// Result of evaluating one destination against a resolved rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Some rule grants the destination.
    Allow,
    /// No rule grants it.
    Deny,
}

/// Effective access for one (user, node) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAccess {
    /// Granted rules, user rules first, then group rules in membership order.
    pub rules: Vec<AccessRule>,
    /// Always [`DefaultPolicy::Deny`].
    pub default_policy: DefaultPolicy,
}

impl ResolvedAccess {
    /// Wrap an already-filtered rule list.
    #[must_use]
    pub fn new(rules: Vec<AccessRule>) -> Self {
        Self {
            rules,
            default_policy: DefaultPolicy::Deny,
        }
    }

    /// Evaluate a destination: allow when any rule matches, otherwise deny.
    #[must_use]
    pub fn evaluate(&self, dest: &Destination) -> PolicyDecision {
        if self.rules.iter().any(|r| r.matches(dest)) {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny
        }
    }

    /// Firewall allow-list for the node to apply around the default deny.
    #[must_use]
    pub fn firewall_rules(&self) -> Vec<FirewallRule> {
        self.rules.iter().map(AccessRule::firewall_rule).collect()
    }

    /// Client directives: routes (or the redirect-gateway directive in
    /// full-tunnel mode) followed by DNS pushes.
    ///
    /// `default_dns` is used when the node pushes DNS without listing servers.
    #[must_use]
    pub fn client_directives(&self, settings: &NodeSettings, default_dns: &[String]) -> Vec<String> {
        let mut directives = if settings.full_tunnel {
            vec![REDIRECT_GATEWAY.to_string()]
        } else {
            self.rules
                .iter()
                .filter_map(AccessRule::route_directive)
                .collect()
        };

        if settings.push_dns {
            let servers = if settings.dns_servers.is_empty() {
                default_dns
            } else {
                settings.dns_servers.as_slice()
            };
            directives.extend(
                servers
                    .iter()
                    .map(|dns| format!("push \"dhcp-option DNS {dns}\"")),
            );
        }

        directives
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolver
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves effective access from the injected rule store.
#[derive(Debug, Clone)]
pub struct AccessResolver {
    stores: Stores,
}

impl AccessResolver {
    /// Create a resolver over `stores`.
    #[must_use]
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Effective rules for `user` on `node`.
    ///
    /// # Errors
    ///
    /// Propagates store failures; a failed lookup never yields a partial
    /// grant.
    pub async fn resolve(&self, user: &User, node: &Node) -> Result<ResolvedAccess> {
        let mut candidates = self
            .stores
            .call("rules.rules_for_user", self.stores.rules.rules_for_user(&user.id))
            .await?;
        for group in &user.groups {
            candidates.extend(
                self.stores
                    .call("rules.rules_for_group", self.stores.rules.rules_for_group(group))
                    .await?,
            );
        }

        let rules = effective(candidates, node);
        tracing::debug!(
            user_id = %user.id,
            node_id = %node.id,
            rules = rules.len(),
            "Resolved effective access"
        );
        Ok(ResolvedAccess::new(rules))
    }

    /// Content hash of the access `node` enforces: the effective rule set of
    /// every user who can reach it, directly or through a group, plus the
    /// rules granted to its assignees themselves.
    ///
    /// Nodes poll this to learn that their firewall needs refreshing.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn node_rules_version(&self, node: &Node) -> Result<String> {
        let mut candidates = Vec::new();
        let mut users: BTreeMap<String, User> = BTreeMap::new();
        for assignee in &node.assignments {
            match assignee {
                Assignee::User(id) => {
                    candidates.extend(
                        self.stores
                            .call("rules.rules_for_user", self.stores.rules.rules_for_user(id))
                            .await?,
                    );
                    if let Some(user) = self
                        .stores
                        .call("users.find_by_id", self.stores.users.find_by_id(id))
                        .await?
                    {
                        users.insert(user.id.clone(), user);
                    }
                }
                Assignee::Group(id) => {
                    candidates.extend(
                        self.stores
                            .call("rules.rules_for_group", self.stores.rules.rules_for_group(id))
                            .await?,
                    );
                    for user in self
                        .stores
                        .call("users.users_in_group", self.stores.users.users_in_group(id))
                        .await?
                    {
                        users.insert(user.id.clone(), user);
                    }
                }
            }
        }

        let assigned = effective(candidates, node);
        let mut lines = vec![format!("assignees\t{}", ruleset_version(&assigned))];
        for (id, user) in &users {
            let access = self.resolve(user, node).await?;
            lines.push(format!("user\t{id}\t{}", ruleset_version(&access.rules)));
        }
        Ok(digest_lines(lines))
    }
}

/// Keep active rules reachable from `node`, first occurrence of each id wins.
fn effective(candidates: Vec<AccessRule>, node: &Node) -> Vec<AccessRule> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|r| r.active)
        .filter(|r| match &r.network {
            None => true,
            Some(net) => node.networks.iter().any(|n| n == net),
        })
        .filter(|r| seen.insert(r.id.clone()))
        .collect()
}

/// SHA-256 over the sorted canonical forms of `rules`, lowercase hex.
///
/// Independent of input order; any change to any rule field changes it.
#[must_use]
pub fn ruleset_version(rules: &[AccessRule]) -> String {
    digest_lines(rules.iter().map(AccessRule::canonical).collect())
}

fn digest_lines(mut lines: Vec<String>) -> String {
    lines.sort();
    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::rule::{RuleSpec, RuleType};
    use crate::model::NodeSettings;

    fn rule(id: &str, rule_type: RuleType, value: &str, network: Option<&str>) -> AccessRule {
        AccessRule::try_from(RuleSpec {
            id: id.to_string(),
            rule_type,
            value: value.to_string(),
            port_range: None,
            protocol: None,
            network: network.map(str::to_string),
            active: true,
            description: None,
        })
        .unwrap()
    }

    fn node(networks: &[&str]) -> Node {
        Node {
            id: "gw-1".into(),
            name: "gw-1".into(),
            role: crate::model::NodeRole::Gateway,
            token: "t".into(),
            endpoint: "vpn.example.com".into(),
            settings: NodeSettings::default(),
            networks: networks.iter().map(|n| (*n).to_string()).collect(),
            assignments: Vec::new(),
            reported_config_version: String::new(),
            last_ca_fingerprint: None,
            last_heartbeat: None,
            public_ip: None,
            active_clients: 0,
            service_running: false,
        }
    }

    #[test]
    fn effective_filters_inactive_out_of_scope_and_duplicates() {
        // GIVEN: a duplicate id, an inactive rule and a rule scoped elsewhere
        let mut inactive = rule("r3", RuleType::Ip, "10.0.0.3", None);
        inactive.active = false;
        let candidates = vec![
            rule("r1", RuleType::Cidr, "10.0.0.0/16", Some("prod")),
            rule("r1", RuleType::Cidr, "10.0.0.0/16", Some("prod")),
            rule("r2", RuleType::Hostname, "git.internal", None),
            inactive,
            rule("r4", RuleType::Cidr, "172.16.0.0/12", Some("staging")),
        ];

        // WHEN: filtering for a node that reaches only "prod"
        let out = effective(candidates, &node(&["prod"]));

        // THEN: r1 once and r2 remain
        let ids: Vec<_> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[test]
    fn evaluate_denies_by_default() {
        let access = ResolvedAccess::new(vec![rule("r1", RuleType::Cidr, "10.0.0.0/16", None)]);
        assert_eq!(access.default_policy, DefaultPolicy::Deny);
        assert_eq!(access.evaluate(&Destination::new("10.0.1.1")), PolicyDecision::Allow);
        assert_eq!(access.evaluate(&Destination::new("8.8.8.8")), PolicyDecision::Deny);
        assert_eq!(
            ResolvedAccess::new(Vec::new()).evaluate(&Destination::new("10.0.1.1")),
            PolicyDecision::Deny
        );
    }

    #[test]
    fn split_tunnel_emits_one_route_per_network_rule() {
        let access = ResolvedAccess::new(vec![
            rule("r1", RuleType::Cidr, "10.0.0.0/16", None),
            rule("r2", RuleType::Hostname, "git.internal", None),
        ]);
        let directives = access.client_directives(&NodeSettings::default(), &[]);
        assert_eq!(directives, vec!["push \"route 10.0.0.0 255.255.0.0\"".to_string()]);
    }

    #[test]
    fn full_tunnel_suppresses_routes_but_keeps_firewall() {
        // GIVEN: full tunnel with DNS push and no servers listed
        let settings = NodeSettings {
            full_tunnel: true,
            push_dns: true,
            ..NodeSettings::default()
        };
        let access = ResolvedAccess::new(vec![rule("r1", RuleType::Cidr, "10.0.0.0/16", None)]);
        let defaults = vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()];

        // WHEN: synthesizing
        let directives = access.client_directives(&settings, &defaults);

        // THEN: redirect-gateway plus the default DNS pair, no routes
        assert_eq!(
            directives,
            vec![
                REDIRECT_GATEWAY.to_string(),
                "push \"dhcp-option DNS 1.1.1.1\"".to_string(),
                "push \"dhcp-option DNS 8.8.8.8\"".to_string(),
            ]
        );
        assert_eq!(access.firewall_rules().len(), 1);
    }

    #[test]
    fn configured_dns_servers_override_defaults() {
        let settings = NodeSettings {
            push_dns: true,
            dns_servers: vec!["10.0.0.53".into()],
            ..NodeSettings::default()
        };
        let directives = ResolvedAccess::new(Vec::new())
            .client_directives(&settings, &["1.1.1.1".to_string()]);
        assert_eq!(directives, vec!["push \"dhcp-option DNS 10.0.0.53\"".to_string()]);
    }

    #[test]
    fn ruleset_version_is_order_independent_and_content_sensitive() {
        let a = rule("r1", RuleType::Cidr, "10.0.0.0/16", None);
        let b = rule("r2", RuleType::Ip, "10.1.0.1", None);
        let v1 = ruleset_version(&[a.clone(), b.clone()]);
        let v2 = ruleset_version(&[b.clone(), a.clone()]);
        assert_eq!(v1, v2);

        // Same count, different content
        let c = rule("r2", RuleType::Ip, "10.1.0.2", None);
        assert_ne!(v1, ruleset_version(&[a, c]));
        assert_eq!(v1.len(), 64);
    }
}
