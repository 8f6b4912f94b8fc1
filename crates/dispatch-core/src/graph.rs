//! Execution ordering over the role dependency table.
//!
//! An edge `A → B` means "B depends on A": A must complete before B may run.
//! Only dependencies inside the requested role set count; roles an issue does
//! not need are treated as already satisfied.
//!
//! Ordering is computed via Kahn's algorithm. Among roles that become ready
//! at the same time, the lower catalog priority goes first, so the result is
//! deterministic.

use std::collections::{HashMap, HashSet};

use crate::classifier::{Complexity, IssueAnalysis, IssueType};
use crate::error::{DispatchError, Result};
use crate::roles::{AgentRole, RoleCatalog};

/// Issue attributes that influence ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderHints {
    pub issue_type: Option<IssueType>,
    pub complexity: Option<Complexity>,
}

impl From<&IssueAnalysis> for OrderHints {
    fn from(analysis: &IssueAnalysis) -> Self {
        Self {
            issue_type: Some(analysis.issue_type),
            complexity: Some(analysis.complexity),
        }
    }
}

/// Deduplicate `roles`, keeping the first occurrence of each.
pub fn dedup_roles(roles: &[AgentRole]) -> Vec<AgentRole> {
    let mut seen = HashSet::new();
    roles.iter().copied().filter(|r| seen.insert(*r)).collect()
}

/// Return `roles` in dependency order (dependencies before dependents).
///
/// Returns [`DispatchError::DependencyCycle`] naming the roles left over when
/// the induced subgraph is cyclic.
pub fn topological_order(catalog: &RoleCatalog, roles: &[AgentRole]) -> Result<Vec<AgentRole>> {
    let roles = dedup_roles(roles);
    let members: HashSet<AgentRole> = roles.iter().copied().collect();

    let mut in_degree: HashMap<AgentRole, usize> = roles.iter().map(|r| (*r, 0)).collect();
    let mut downstream: HashMap<AgentRole, Vec<AgentRole>> = HashMap::new();

    for role in &roles {
        for dep in catalog.dependencies(*role) {
            if members.contains(dep) {
                *in_degree.entry(*role).or_default() += 1;
                downstream.entry(*dep).or_default().push(*role);
            }
        }
    }

    let input_pos: HashMap<AgentRole, usize> =
        roles.iter().enumerate().map(|(i, r)| (*r, i)).collect();
    let rank = |r: &AgentRole| (catalog.priority(*r), input_pos[r]);

    let mut ready: Vec<AgentRole> = roles
        .iter()
        .copied()
        .filter(|r| in_degree[r] == 0)
        .collect();
    let mut sorted = Vec::with_capacity(roles.len());

    while !ready.is_empty() {
        ready.sort_by_key(|r| rank(r));
        let next = ready.remove(0);
        sorted.push(next);

        if let Some(dependents) = downstream.get(&next) {
            for dependent in dependents {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(*dependent);
                    }
                }
            }
        }
    }

    if sorted.len() != roles.len() {
        let placed: HashSet<AgentRole> = sorted.iter().copied().collect();
        let mut leftover: Vec<String> = roles
            .iter()
            .filter(|r| !placed.contains(r))
            .map(|r| r.to_string())
            .collect();
        leftover.sort();
        return Err(DispatchError::DependencyCycle { roles: leftover });
    }

    Ok(sorted)
}

/// Decide the execution order for an issue's required roles.
///
/// - A simple issue needing exactly one role runs that role.
/// - Otherwise the roles are topologically sorted.
/// - Documentation issues run the documentation role first whenever it has
///   no in-set dependencies.
pub fn determine_agent_order(
    catalog: &RoleCatalog,
    required: &[AgentRole],
    hints: OrderHints,
) -> Result<Vec<AgentRole>> {
    let roles = dedup_roles(required);
    if roles.is_empty() {
        return Err(DispatchError::NoAgents("empty role set".to_string()));
    }

    if hints.complexity == Some(Complexity::Simple) && roles.len() == 1 {
        return Ok(roles);
    }

    let mut order = topological_order(catalog, &roles)?;

    if hints.issue_type == Some(IssueType::Documentation) {
        if let Some(pos) = order.iter().position(|r| *r == AgentRole::Documentation) {
            let blocked = catalog
                .dependencies(AgentRole::Documentation)
                .iter()
                .any(|d| roles.contains(d));
            if !blocked {
                let doc = order.remove(pos);
                order.insert(0, doc);
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::RoleTemplate;

    fn catalog() -> RoleCatalog {
        RoleCatalog::standard()
    }

    fn position(order: &[AgentRole], role: AgentRole) -> usize {
        order.iter().position(|r| *r == role).unwrap()
    }

    /// Every subset of the five roles: each in-set dependency precedes its dependent.
    #[test]
    fn test_every_subset_respects_dependencies() {
        let cat = catalog();
        for mask in 1u32..(1 << 5) {
            let subset: Vec<AgentRole> = AgentRole::ALL
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, r)| *r)
                .collect();

            let order = determine_agent_order(&cat, &subset, OrderHints::default()).unwrap();
            assert_eq!(order.len(), subset.len(), "not a permutation: {order:?}");
            for role in &subset {
                assert!(order.contains(role));
                for dep in cat.dependencies(*role) {
                    if subset.contains(dep) {
                        assert!(
                            position(&order, *dep) < position(&order, *role),
                            "{dep} must precede {role} in {order:?}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_full_stack_order() {
        let order = determine_agent_order(
            &catalog(),
            &[
                AgentRole::Frontend,
                AgentRole::Devops,
                AgentRole::Backend,
                AgentRole::Database,
            ],
            OrderHints::default(),
        )
        .unwrap();
        assert_eq!(
            order,
            vec![
                AgentRole::Database,
                AgentRole::Backend,
                AgentRole::Frontend,
                AgentRole::Devops
            ]
        );
    }

    #[test]
    fn test_documentation_issue_moves_docs_first() {
        let hints = OrderHints {
            issue_type: Some(IssueType::Documentation),
            complexity: Some(Complexity::Moderate),
        };
        let order = determine_agent_order(
            &catalog(),
            &[AgentRole::Backend, AgentRole::Documentation],
            hints,
        )
        .unwrap();
        assert_eq!(order, vec![AgentRole::Documentation, AgentRole::Backend]);
    }

    #[test]
    fn test_simple_single_role_is_returned_as_is() {
        let hints = OrderHints {
            issue_type: Some(IssueType::Bug),
            complexity: Some(Complexity::Simple),
        };
        let order = determine_agent_order(&catalog(), &[AgentRole::Frontend], hints).unwrap();
        assert_eq!(order, vec![AgentRole::Frontend]);
    }

    #[test]
    fn test_duplicates_are_collapsed() {
        let order = determine_agent_order(
            &catalog(),
            &[AgentRole::Backend, AgentRole::Backend, AgentRole::Database],
            OrderHints::default(),
        )
        .unwrap();
        assert_eq!(order, vec![AgentRole::Database, AgentRole::Backend]);
    }

    #[test]
    fn test_empty_role_set_is_rejected() {
        let result = determine_agent_order(&catalog(), &[], OrderHints::default());
        assert!(matches!(result, Err(DispatchError::NoAgents(_))));
    }

    #[test]
    fn test_cycle_is_reported_with_leftover_roles() {
        let cat = RoleCatalog::from_templates(vec![
            RoleTemplate::new(AgentRole::Backend, 1, "b"),
            RoleTemplate::new(AgentRole::Frontend, 2, "f").depends_on(&[AgentRole::Backend]),
        ])
        .unwrap();
        assert!(topological_order(&cat, &[AgentRole::Frontend, AgentRole::Backend]).is_ok());

        let cyclic = RoleCatalog::from_templates(vec![
            RoleTemplate::new(AgentRole::Database, 1, "d").depends_on(&[AgentRole::Devops]),
            RoleTemplate::new(AgentRole::Devops, 2, "o").depends_on(&[AgentRole::Database]),
        ]);
        match cyclic {
            Err(DispatchError::DependencyCycle { roles }) => {
                assert_eq!(roles, vec!["database".to_string(), "devops".to_string()]);
            }
            other => panic!("expected DependencyCycle, got {other:?}"),
        }
    }
}
