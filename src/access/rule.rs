//! Access rules: what a user or group may reach through a node.
//!
//! Rules are stored in a flat wire form ([`RuleSpec`]: `type` + `value` +
//! optional port range / protocol / network scope) and parsed once into
//! [`AccessRule`], whose [`RuleTarget`] is a tagged enum. A value that does
//! not parse for its declared type is rejected with
//! [`Error::MalformedSetting`] instead of being silently skipped.
//!
//! | `type` | `value` example | Produces a route |
//! |--------|-----------------|------------------|
//! | `ip` | `10.0.5.7` | yes (host route) |
//! | `cidr` | `10.0.0.0/16` | yes |
//! | `hostname` | `git.internal` | no |
//! | `hostname_wildcard` | `*.corp.internal` | no |

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Rule parts
// ─────────────────────────────────────────────────────────────────────────────

/// Declared rule type in the wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Single address.
    Ip,
    /// Network in CIDR notation.
    Cidr,
    /// Exact hostname.
    Hostname,
    /// Glob over hostnames (`*.corp.internal`).
    HostnameWildcard,
}

impl RuleType {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Cidr => "cidr",
            Self::Hostname => "hostname",
            Self::HostnameWildcard => "hostname_wildcard",
        }
    }
}

/// Parsed rule target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    /// Single address.
    Ip(IpAddr),
    /// Network; host bits are cleared on parse.
    Cidr(IpNet),
    /// Exact hostname, lowercased.
    Hostname(String),
    /// Hostname glob, lowercased.
    HostnameWildcard(glob::Pattern),
}

impl RuleTarget {
    /// Parse `value` as a target of type `rule_type`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSetting`] if the value does not parse.
    pub fn parse(rule_type: RuleType, value: &str) -> Result<Self> {
        let value = value.trim();
        let malformed =
            |detail: String| Error::MalformedSetting(format!("{} rule '{value}': {detail}", rule_type.as_str()));

        match rule_type {
            RuleType::Ip => IpAddr::from_str(value)
                .map(Self::Ip)
                .map_err(|e| malformed(e.to_string())),
            RuleType::Cidr => IpNet::from_str(value)
                .map(|net| Self::Cidr(net.trunc()))
                .map_err(|e| malformed(e.to_string())),
            RuleType::Hostname => {
                if value.is_empty() || value.contains(char::is_whitespace) || value.contains('*') {
                    Err(malformed("not a hostname".to_string()))
                } else {
                    Ok(Self::Hostname(value.to_ascii_lowercase()))
                }
            }
            RuleType::HostnameWildcard => {
                if value.is_empty() || value.contains(char::is_whitespace) {
                    return Err(malformed("not a hostname pattern".to_string()));
                }
                glob::Pattern::new(&value.to_ascii_lowercase())
                    .map(Self::HostnameWildcard)
                    .map_err(|e| malformed(e.to_string()))
            }
        }
    }

    /// Declared type of this target.
    #[must_use]
    pub fn rule_type(&self) -> RuleType {
        match self {
            Self::Ip(_) => RuleType::Ip,
            Self::Cidr(_) => RuleType::Cidr,
            Self::Hostname(_) => RuleType::Hostname,
            Self::HostnameWildcard(_) => RuleType::HostnameWildcard,
        }
    }

    /// Canonical textual value.
    #[must_use]
    pub fn value(&self) -> String {
        match self {
            Self::Ip(ip) => ip.to_string(),
            Self::Cidr(net) => net.to_string(),
            Self::Hostname(host) => host.clone(),
            Self::HostnameWildcard(pattern) => pattern.as_str().to_string(),
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    /// First port.
    pub start: u16,
    /// Last port (inclusive).
    pub end: u16,
}

impl PortRange {
    /// Whether `port` falls inside the range.
    #[must_use]
    pub fn contains(self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::MalformedSetting(format!("port range '{s}'"));
        let parse_port = |p: &str| p.trim().parse::<u16>().map_err(|_| malformed());

        let (start, end) = match s.split_once('-') {
            Some((a, b)) => (parse_port(a)?, parse_port(b)?),
            None => {
                let p = parse_port(s)?;
                (p, p)
            }
        };
        if start == 0 || start > end {
            return Err(malformed());
        }
        Ok(Self { start, end })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Transport protocol a rule is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP.
    Icmp,
}

impl RuleProtocol {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }
}

impl FromStr for RuleProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            other => Err(Error::MalformedSetting(format!("protocol '{other}'"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rule
// ─────────────────────────────────────────────────────────────────────────────

/// Flat wire / storage form of an access rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Stable rule identifier.
    pub id: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    /// Value interpreted according to `rule_type`.
    pub value: String,
    /// `"443"` or `"8000-8100"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<String>,
    /// `"tcp"`, `"udp"` or `"icmp"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Network the rule is scoped to; unscoped rules apply on every node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Inactive rules are ignored by resolution.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Free-form note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_active() -> bool {
    true
}

/// A parsed access rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RuleSpec", into = "RuleSpec")]
pub struct AccessRule {
    /// Stable rule identifier; resolution deduplicates on it.
    pub id: String,
    /// What the rule grants.
    pub target: RuleTarget,
    /// Optional port restriction.
    pub port_range: Option<PortRange>,
    /// Optional protocol restriction.
    pub protocol: Option<RuleProtocol>,
    /// Optional network scope.
    pub network: Option<String>,
    /// Inactive rules are ignored by resolution.
    pub active: bool,
    /// Free-form note.
    pub description: Option<String>,
}

impl TryFrom<RuleSpec> for AccessRule {
    type Error = Error;

    fn try_from(raw: RuleSpec) -> Result<Self> {
        let target = RuleTarget::parse(raw.rule_type, &raw.value)?;
        let port_range = raw
            .port_range
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(str::parse)
            .transpose()?;
        let protocol = raw
            .protocol
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(str::parse)
            .transpose()?;

        Ok(Self {
            id: raw.id,
            target,
            port_range,
            protocol,
            network: raw.network,
            active: raw.active,
            description: raw.description,
        })
    }
}

impl From<AccessRule> for RuleSpec {
    fn from(rule: AccessRule) -> Self {
        Self {
            id: rule.id,
            rule_type: rule.target.rule_type(),
            value: rule.target.value(),
            port_range: rule.port_range.map(|p| p.to_string()),
            protocol: rule.protocol.map(|p| p.as_str().to_string()),
            network: rule.network,
            active: rule.active,
            description: rule.description,
        }
    }
}

/// Host part of a destination being evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationHost {
    /// Numeric address.
    Ip(IpAddr),
    /// DNS name.
    Name(String),
}

/// A destination a client wants to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Address or name.
    pub host: DestinationHost,
    /// Destination port, when known.
    pub port: Option<u16>,
    /// Transport protocol, when known.
    pub protocol: Option<RuleProtocol>,
}

impl Destination {
    /// Destination from a host string; numeric hosts become addresses.
    #[must_use]
    pub fn new(host: &str) -> Self {
        let host = match IpAddr::from_str(host) {
            Ok(ip) => DestinationHost::Ip(ip),
            Err(_) => DestinationHost::Name(host.to_ascii_lowercase()),
        };
        Self {
            host,
            port: None,
            protocol: None,
        }
    }

    /// Builder: set the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Builder: set the protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: RuleProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }
}

impl AccessRule {
    /// Whether this rule grants `dest`. Inactive rules grant nothing.
    ///
    /// Port and protocol restrictions only match destinations that state a
    /// port / protocol.
    #[must_use]
    pub fn matches(&self, dest: &Destination) -> bool {
        if !self.active {
            return false;
        }

        let host_ok = match (&self.target, &dest.host) {
            (RuleTarget::Ip(ip), DestinationHost::Ip(d)) => ip == d,
            (RuleTarget::Cidr(net), DestinationHost::Ip(d)) => net.contains(d),
            (RuleTarget::Hostname(h), DestinationHost::Name(d)) => h == d,
            (RuleTarget::HostnameWildcard(p), DestinationHost::Name(d)) => p.matches(d),
            _ => false,
        };
        if !host_ok {
            return false;
        }

        if let Some(range) = self.port_range {
            match dest.port {
                Some(port) if range.contains(port) => {}
                _ => return false,
            }
        }

        match self.protocol {
            Some(proto) => dest.protocol == Some(proto),
            None => true,
        }
    }

    /// Client routing directive for this rule, if it produces one.
    ///
    /// Hostname rules route nothing; name resolution happens on the client.
    #[must_use]
    pub fn route_directive(&self) -> Option<String> {
        match &self.target {
            RuleTarget::Ip(IpAddr::V4(ip)) => Some(format!("push \"route {ip} 255.255.255.255\"")),
            RuleTarget::Ip(IpAddr::V6(ip)) => Some(format!("push \"route-ipv6 {ip}/128\"")),
            RuleTarget::Cidr(IpNet::V4(net)) => Some(format!(
                "push \"route {} {}\"",
                net.network(),
                net.netmask()
            )),
            RuleTarget::Cidr(IpNet::V6(net)) => Some(format!("push \"route-ipv6 {net}\"")),
            RuleTarget::Hostname(_) | RuleTarget::HostnameWildcard(_) => None,
        }
    }

    /// Firewall entry for this rule.
    #[must_use]
    pub fn firewall_rule(&self) -> FirewallRule {
        FirewallRule {
            action: FirewallAction::Allow,
            rule_type: self.target.rule_type(),
            value: self.target.value(),
            port_range: self.port_range.map(|p| p.to_string()),
            protocol: self.protocol,
        }
    }

    /// Stable textual form used for content hashing.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.target.rule_type().as_str(),
            self.target.value(),
            self.port_range.map(|p| p.to_string()).unwrap_or_default(),
            self.protocol.map(RuleProtocol::as_str).unwrap_or_default(),
            self.network.as_deref().unwrap_or_default(),
            self.active
        )
    }
}

/// Firewall action. Only allow entries are ever emitted; deny is the
/// default policy around them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallAction {
    /// Permit matching traffic.
    Allow,
}

/// Firewall entry shipped to nodes at Connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Always `allow`.
    pub action: FirewallAction,
    /// Rule type.
    pub rule_type: RuleType,
    /// Canonical value.
    pub value: String,
    /// Port restriction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<String>,
    /// Protocol restriction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<RuleProtocol>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(rule_type: RuleType, value: &str) -> AccessRule {
        AccessRule::try_from(RuleSpec {
            id: format!("r-{value}"),
            rule_type,
            value: value.to_string(),
            port_range: None,
            protocol: None,
            network: None,
            active: true,
            description: None,
        })
        .unwrap()
    }

    // ─── Parsing ──────────────────────────────────────────────────────────────

    #[test]
    fn cidr_host_bits_are_cleared() {
        let r = rule(RuleType::Cidr, "10.0.7.9/16");
        assert_eq!(r.target.value(), "10.0.0.0/16");
    }

    #[test]
    fn malformed_values_are_rejected() {
        for (t, v) in [
            (RuleType::Ip, "10.0.0.256"),
            (RuleType::Cidr, "10.0.0.0/33"),
            (RuleType::Hostname, "has space.example"),
            (RuleType::HostnameWildcard, "[unclosed"),
        ] {
            let result = RuleTarget::parse(t, v);
            assert!(
                matches!(result, Err(Error::MalformedSetting(_))),
                "{v} should be malformed"
            );
        }
    }

    #[test]
    fn port_range_parsing() {
        assert_eq!("443".parse::<PortRange>().unwrap(), PortRange { start: 443, end: 443 });
        assert_eq!(
            "8000-8100".parse::<PortRange>().unwrap(),
            PortRange { start: 8000, end: 8100 }
        );
        assert!("9000-8000".parse::<PortRange>().is_err());
        assert!("0".parse::<PortRange>().is_err());
        assert!("http".parse::<PortRange>().is_err());
    }

    #[test]
    fn yaml_rule_deserializes_and_validates() {
        let yaml = r#"
id: r-db
type: cidr
value: 10.20.0.0/24
port_range: "5432"
protocol: tcp
network: prod
"#;
        let r: AccessRule = serde_yaml::from_str(yaml).unwrap();
        assert!(r.active);
        assert_eq!(r.port_range, Some(PortRange { start: 5432, end: 5432 }));
        assert_eq!(r.protocol, Some(RuleProtocol::Tcp));
        assert_eq!(r.network.as_deref(), Some("prod"));
    }

    #[test]
    fn yaml_rule_with_bad_value_fails_to_deserialize() {
        let yaml = "id: r\ntype: ip\nvalue: not-an-ip\n";
        assert!(serde_yaml::from_str::<AccessRule>(yaml).is_err());
    }

    // ─── Matching ─────────────────────────────────────────────────────────────

    #[test]
    fn cidr_matches_contained_addresses_only() {
        let r = rule(RuleType::Cidr, "10.0.0.0/16");
        assert!(r.matches(&Destination::new("10.0.200.1")));
        assert!(!r.matches(&Destination::new("10.1.0.1")));
        assert!(!r.matches(&Destination::new("db.internal")));
    }

    #[test]
    fn wildcard_matches_subdomains_case_insensitively() {
        let r = rule(RuleType::HostnameWildcard, "*.Corp.Internal");
        assert!(r.matches(&Destination::new("wiki.corp.internal")));
        assert!(r.matches(&Destination::new("WIKI.corp.internal")));
        assert!(!r.matches(&Destination::new("corp.internal.evil.com")));
    }

    #[test]
    fn port_and_protocol_restrictions_apply() {
        // GIVEN: a tcp/443 rule for one host
        let mut r = rule(RuleType::Ip, "10.0.0.5");
        r.port_range = Some(PortRange { start: 443, end: 443 });
        r.protocol = Some(RuleProtocol::Tcp);

        // THEN: only tcp/443 to that host matches
        let base = Destination::new("10.0.0.5");
        assert!(r.matches(&base.clone().port(443).protocol(RuleProtocol::Tcp)));
        assert!(!r.matches(&base.clone().port(22).protocol(RuleProtocol::Tcp)));
        assert!(!r.matches(&base.clone().port(443).protocol(RuleProtocol::Udp)));
        assert!(!r.matches(&base));
    }

    #[test]
    fn inactive_rule_matches_nothing() {
        let mut r = rule(RuleType::Ip, "10.0.0.5");
        r.active = false;
        assert!(!r.matches(&Destination::new("10.0.0.5")));
    }

    // ─── Directives ───────────────────────────────────────────────────────────

    #[test]
    fn route_directives_by_rule_type() {
        assert_eq!(
            rule(RuleType::Cidr, "10.0.0.0/16").route_directive().as_deref(),
            Some("push \"route 10.0.0.0 255.255.0.0\"")
        );
        assert_eq!(
            rule(RuleType::Ip, "192.168.1.10").route_directive().as_deref(),
            Some("push \"route 192.168.1.10 255.255.255.255\"")
        );
        assert_eq!(
            rule(RuleType::Cidr, "fd00:1::/64").route_directive().as_deref(),
            Some("push \"route-ipv6 fd00:1::/64\"")
        );
        assert!(rule(RuleType::Hostname, "git.internal").route_directive().is_none());
        assert!(rule(RuleType::HostnameWildcard, "*.corp").route_directive().is_none());
    }

    #[test]
    fn firewall_rule_serializes_wire_form() {
        let mut r = rule(RuleType::Cidr, "10.0.0.0/16");
        r.port_range = Some(PortRange { start: 8000, end: 8100 });
        let json = serde_json::to_value(r.firewall_rule()).unwrap();
        assert_eq!(json["action"], "allow");
        assert_eq!(json["rule_type"], "cidr");
        assert_eq!(json["value"], "10.0.0.0/16");
        assert_eq!(json["port_range"], "8000-8100");
        assert!(json.get("protocol").is_none());
    }
}
