//! Access rules and their resolution into firewall and routing output.

pub mod resolver;
pub mod rule;

pub use resolver::{
    AccessResolver, DefaultPolicy, PolicyDecision, REDIRECT_GATEWAY, ResolvedAccess,
    ruleset_version,
};
pub use rule::{
    AccessRule, Destination, DestinationHost, FirewallAction, FirewallRule, PortRange,
    RuleProtocol, RuleSpec, RuleTarget, RuleType,
};
