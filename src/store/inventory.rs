//! Inventory file: YAML seed data for the in-memory stores.
//!
//! ```yaml
//! users:
//!   - id: u-alice
//!     email: alice@example.com
//!     groups: [engineering]
//! nodes:
//!   - id: gw-eu-1
//!     name: gw-eu-1
//!     token: ${GW_EU_1_TOKEN}
//!     endpoint: vpn-eu.example.com
//!     networks: [prod]
//!     assignments:
//!       - { kind: group, id: engineering }
//! grants:
//!   - assignee: { kind: group, id: engineering }
//!     rules:
//!       - { id: r-prod, type: cidr, value: 10.0.0.0/16, network: prod }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::access::AccessRule;
use crate::model::{Assignee, Node, User};
use crate::store::InMemoryStore;
use crate::{Error, Result};

/// Rules granted to one user or group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    /// Grantee.
    pub assignee: Assignee,
    /// Granted rules.
    #[serde(default)]
    pub rules: Vec<AccessRule>,
}

/// Parsed inventory file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    /// Users.
    pub users: Vec<User>,
    /// Nodes.
    pub nodes: Vec<Node>,
    /// Rule grants.
    pub grants: Vec<Grant>,
}

impl Inventory {
    /// Read and parse an inventory file. `${VAR}` references are expanded
    /// from the environment before parsing, so node tokens can stay out of
    /// the file.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the file cannot be read or parsed; rule values
    /// that do not parse are reported rather than skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read inventory '{}': {e}", path.display())))?;
        Self::parse(&expand_env(&raw))
    }

    /// Parse inventory YAML.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] on malformed YAML, duplicate ids or malformed rules.
    pub fn parse(yaml: &str) -> Result<Self> {
        let inventory: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Invalid inventory: {e}")))?;
        inventory.validate()?;
        Ok(inventory)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(Error::Config(format!("Duplicate node id '{}'", node.id)));
            }
            if node.token.trim().is_empty() {
                return Err(Error::Config(format!("Node '{}' has an empty token", node.id)));
            }
        }
        seen.clear();
        for user in &self.users {
            if !seen.insert(user.id.as_str()) {
                return Err(Error::Config(format!("Duplicate user id '{}'", user.id)));
            }
        }
        Ok(())
    }

    /// Load everything into `store`.
    pub fn seed(self, store: &InMemoryStore) {
        let (users, nodes, grants) = (self.users.len(), self.nodes.len(), self.grants.len());
        for user in self.users {
            store.upsert_user(user);
        }
        for node in self.nodes {
            store.upsert_node(node);
        }
        for grant in self.grants {
            for rule in grant.rules {
                store.grant(grant.assignee.clone(), rule);
            }
        }
        info!(users, nodes, grants, "Seeded stores from inventory");
    }
}

fn expand_env(raw: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("static regex is valid");
    re.replace_all(raw, |caps: &regex::Captures<'_>| {
        let default = caps.get(2).map_or("", |m| m.as_str());
        std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}
