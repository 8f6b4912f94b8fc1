//! Core role vocabulary: `AgentRole`, `RoleTemplate`, `RoleCatalog`.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// The five categories of change an issue can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Frontend,
    Backend,
    Database,
    Devops,
    Documentation,
}

impl AgentRole {
    /// All roles, in the order the classifier tests them.
    pub const ALL: [AgentRole; 5] = [
        AgentRole::Frontend,
        AgentRole::Backend,
        AgentRole::Database,
        AgentRole::Devops,
        AgentRole::Documentation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Frontend => "frontend",
            AgentRole::Backend => "backend",
            AgentRole::Database => "database",
            AgentRole::Devops => "devops",
            AgentRole::Documentation => "documentation",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        AgentRole::ALL
            .into_iter()
            .find(|r| r.as_str() == lower)
            .ok_or_else(|| DispatchError::UnknownAgent(s.to_string()))
    }
}

/// Static description of a role: what it waits for, what it locks, how
/// often it may be retried.
///
/// Templates do not execute; the coordinator reads them.
#[derive(Debug, Clone)]
pub struct RoleTemplate {
    pub role: AgentRole,
    /// Roles that must complete first when they are part of the same issue.
    pub depends_on: Vec<AgentRole>,
    /// Global resource names held while the role executes.
    pub resources: Vec<String>,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Lower runs earlier among roles that are ready at the same time.
    pub priority: u8,
    pub description: &'static str,
}

impl RoleTemplate {
    pub fn new(role: AgentRole, priority: u8, description: &'static str) -> Self {
        Self {
            role,
            depends_on: Vec::new(),
            resources: Vec::new(),
            max_retries: 0,
            priority,
            description,
        }
    }

    pub fn depends_on(mut self, roles: &[AgentRole]) -> Self {
        self.depends_on = roles.to_vec();
        self
    }

    pub fn resources(mut self, names: &[&str]) -> Self {
        self.resources = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }
}

/// The role table consulted for ordering, locking and retry decisions.
///
/// Construction rejects dependency cycles, so ordering never loops.
#[derive(Debug, Clone)]
pub struct RoleCatalog {
    templates: BTreeMap<AgentRole, RoleTemplate>,
}

impl RoleCatalog {
    /// The standard five-role table.
    pub fn standard() -> Self {
        let templates = vec![
            RoleTemplate::new(
                AgentRole::Database,
                1,
                "Schema, migration and query changes",
            )
            .resources(&["database-schema"])
            .max_retries(1),
            RoleTemplate::new(AgentRole::Backend, 2, "API, server and auth changes")
                .depends_on(&[AgentRole::Database])
                .resources(&["backend-api", "shared-config"])
                .max_retries(2),
            RoleTemplate::new(AgentRole::Frontend, 3, "UI, component and styling changes")
                .depends_on(&[AgentRole::Backend])
                .resources(&["frontend-ui"])
                .max_retries(2),
            RoleTemplate::new(AgentRole::Devops, 4, "CI, build and deployment changes")
                .depends_on(&[AgentRole::Database, AgentRole::Backend, AgentRole::Frontend])
                .resources(&["ci-pipeline", "shared-config"])
                .max_retries(1),
            RoleTemplate::new(AgentRole::Documentation, 5, "README and guide updates")
                .resources(&["docs"])
                .max_retries(3),
        ];
        Self {
            templates: templates.into_iter().map(|t| (t.role, t)).collect(),
        }
    }

    /// Build a catalog from custom templates.
    ///
    /// Returns [`DispatchError::DependencyCycle`] if the dependency table is cyclic.
    pub fn from_templates(templates: Vec<RoleTemplate>) -> Result<Self> {
        let catalog = Self {
            templates: templates.into_iter().map(|t| (t.role, t)).collect(),
        };
        let all: Vec<AgentRole> = catalog.templates.keys().copied().collect();
        crate::graph::topological_order(&catalog, &all)?;
        Ok(catalog)
    }

    pub fn template(&self, role: AgentRole) -> Option<&RoleTemplate> {
        self.templates.get(&role)
    }

    pub fn dependencies(&self, role: AgentRole) -> &[AgentRole] {
        self.template(role)
            .map(|t| t.depends_on.as_slice())
            .unwrap_or_default()
    }

    pub fn resources(&self, role: AgentRole) -> &[String] {
        self.template(role)
            .map(|t| t.resources.as_slice())
            .unwrap_or_default()
    }

    pub fn max_retries(&self, role: AgentRole) -> u32 {
        self.template(role).map(|t| t.max_retries).unwrap_or(0)
    }

    pub fn priority(&self, role: AgentRole) -> u8 {
        self.template(role).map(|t| t.priority).unwrap_or(u8::MAX)
    }

    /// Sort roles by priority, keeping input order for ties.
    pub fn sort_by_priority(&self, roles: &mut [AgentRole]) {
        roles.sort_by_key(|r| self.priority(*r));
    }
}

impl Default for RoleCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
