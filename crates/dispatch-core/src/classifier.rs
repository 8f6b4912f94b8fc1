//! Keyword classification of tracked issues.
//!
//! [`classify`] is a pure function of `(title, body, labels)`: matching is
//! case-insensitive substring search against fixed keyword tables.

use serde::{Deserialize, Serialize};

use crate::roles::AgentRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Bug,
    Enhancement,
    Feature,
    Documentation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

macro_rules! impl_lowercase_display {
    ($($ty:ty => { $($variant:path => $name:literal),+ $(,)? }),+ $(,)?) => {
        $(
            impl std::fmt::Display for $ty {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    let s = match self {
                        $($variant => $name),+
                    };
                    f.write_str(s)
                }
            }
        )+
    };
}

impl_lowercase_display! {
    IssueType => {
        IssueType::Bug => "bug",
        IssueType::Enhancement => "enhancement",
        IssueType::Feature => "feature",
        IssueType::Documentation => "documentation",
    },
    Complexity => {
        Complexity::Simple => "simple",
        Complexity::Moderate => "moderate",
        Complexity::Complex => "complex",
    },
    Risk => {
        Risk::Low => "low",
        Risk::Medium => "medium",
        Risk::High => "high",
    },
}

/// Classifier verdict for one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueAnalysis {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub complexity: Complexity,
    pub risk: Risk,
    /// Roles in fixed test order, not execution order.
    pub agents: Vec<AgentRole>,
    pub auto_implement: bool,
}

struct TypeRule {
    issue_type: IssueType,
    label: &'static str,
    title_keywords: &'static [&'static str],
}

const TYPE_RULES: &[TypeRule] = &[
    TypeRule {
        issue_type: IssueType::Bug,
        label: "bug",
        title_keywords: &["bug", "fix", "error", "broken"],
    },
    TypeRule {
        issue_type: IssueType::Enhancement,
        label: "enhancement",
        title_keywords: &["improve", "enhance", "update"],
    },
    TypeRule {
        issue_type: IssueType::Feature,
        label: "feature",
        title_keywords: &["feature", "implement", "add "],
    },
    TypeRule {
        issue_type: IssueType::Documentation,
        label: "documentation",
        title_keywords: &["docs", "documentation", "readme"],
    },
];

const SIMPLE_KEYWORDS: &[&str] = &["typo", "color", "text", "button", "style", "css", "readme"];
const COMPLEX_KEYWORDS: &[&str] = &[
    "architecture",
    "refactor",
    "migration",
    "authentication",
    "database",
];

const HIGH_RISK_KEYWORDS: &[&str] = &[
    "breaking",
    "migration",
    "security",
    "authentication",
    "database",
    "payment",
];
const LOW_RISK_KEYWORDS: &[&str] = &["documentation", "readme", "typo", "color", "css", "style"];

fn agent_keywords(role: AgentRole) -> &'static [&'static str] {
    match role {
        AgentRole::Frontend => &[
            "ui",
            "button",
            "color",
            "style",
            "css",
            "component",
            "page",
            "layout",
            "frontend",
            "display",
            "dashboard",
        ],
        AgentRole::Backend => &[
            "api",
            "server",
            "endpoint",
            "backend",
            "route",
            "auth",
            "controller",
        ],
        AgentRole::Database => &["database", "schema", "migration", "mongo", "query", "index"],
        AgentRole::Devops => &[
            "deploy",
            "docker",
            "pipeline",
            "workflow",
            "ci/cd",
            "github action",
            "kubernetes",
        ],
        AgentRole::Documentation => &["readme", "documentation", "docs", "guide"],
    }
}

fn contains_any(haystack: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| haystack.contains(k))
}

/// Classify an issue from its title, body and label names.
pub fn classify<S: AsRef<str>>(title: &str, body: &str, labels: &[S]) -> IssueAnalysis {
    let title_lc = title.to_lowercase();
    let text = format!("{} {}", title_lc, body.to_lowercase());
    let labels: Vec<String> = labels.iter().map(|l| l.as_ref().to_lowercase()).collect();

    let issue_type = TYPE_RULES
        .iter()
        .find(|rule| {
            labels.iter().any(|l| l == rule.label) || contains_any(&title_lc, rule.title_keywords)
        })
        .map(|rule| rule.issue_type)
        .unwrap_or(IssueType::Feature);

    let complexity = if contains_any(&text, SIMPLE_KEYWORDS) {
        Complexity::Simple
    } else if contains_any(&text, COMPLEX_KEYWORDS) {
        Complexity::Complex
    } else {
        Complexity::Moderate
    };

    let risk = if contains_any(&text, HIGH_RISK_KEYWORDS) {
        Risk::High
    } else if contains_any(&text, LOW_RISK_KEYWORDS) {
        Risk::Low
    } else {
        Risk::Medium
    };

    let mut agents: Vec<AgentRole> = AgentRole::ALL
        .into_iter()
        .filter(|role| contains_any(&text, agent_keywords(*role)))
        .collect();
    if agents.is_empty() {
        agents.push(AgentRole::Frontend);
    }

    let auto_implement = matches!(
        (complexity, risk),
        (Complexity::Simple, Risk::Low) | (Complexity::Moderate, Risk::Low)
    );

    IssueAnalysis {
        issue_type,
        complexity,
        risk,
        agents,
        auto_implement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_ui_bug_is_auto_implementable() {
        let a = classify("Fix button color in dashboard", "", &["bug"]);
        assert_eq!(a.issue_type, IssueType::Bug);
        assert_eq!(a.complexity, Complexity::Simple);
        assert_eq!(a.risk, Risk::Low);
        assert_eq!(a.agents, vec![AgentRole::Frontend]);
        assert!(a.auto_implement);
    }

    #[test]
    fn test_authentication_feature_is_complex_and_high_risk() {
        let a = classify(
            "Implement user authentication system",
            "Add OAuth",
            &["feature"],
        );
        assert_eq!(a.issue_type, IssueType::Feature);
        assert_eq!(a.complexity, Complexity::Complex);
        assert_eq!(a.risk, Risk::High);
        assert!(a.agents.contains(&AgentRole::Backend));
        assert!(!a.auto_implement);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let first = classify("Refactor API routes", "touches the database", &["enhancement"]);
        let second = classify("Refactor API routes", "touches the database", &["enhancement"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_type_defaults_to_feature() {
        let a = classify("Something odd happens", "", &[] as &[&str]);
        assert_eq!(a.issue_type, IssueType::Feature);
        assert_eq!(a.complexity, Complexity::Moderate);
        assert_eq!(a.risk, Risk::Medium);
        assert_eq!(a.agents, vec![AgentRole::Frontend]);
        assert!(!a.auto_implement);
    }

    #[test]
    fn test_type_rules_follow_declared_order() {
        // Both bug and documentation labels: bug is tested first.
        let a = classify("Readme is out of date", "", &["documentation", "bug"]);
        assert_eq!(a.issue_type, IssueType::Bug);

        let b = classify("Improve the docs", "", &[] as &[&str]);
        assert_eq!(b.issue_type, IssueType::Enhancement);
    }

    #[test]
    fn test_simple_takes_precedence_over_complex() {
        let a = classify("Database button text", "", &[] as &[&str]);
        assert_eq!(a.complexity, Complexity::Simple);
        // High-risk check runs before low-risk.
        assert_eq!(a.risk, Risk::High);
        assert!(!a.auto_implement);
    }

    #[test]
    fn test_agents_follow_fixed_test_order() {
        let a = classify(
            "Update docs for deploy pipeline",
            "new api endpoint and schema change, plus a dashboard page",
            &[] as &[&str],
        );
        assert_eq!(
            a.agents,
            vec![
                AgentRole::Frontend,
                AgentRole::Backend,
                AgentRole::Database,
                AgentRole::Devops,
                AgentRole::Documentation,
            ]
        );
    }

    #[test]
    fn test_moderate_low_risk_is_auto_implementable() {
        let a = classify("Write documentation for setup", "", &[] as &[&str]);
        assert_eq!(a.complexity, Complexity::Moderate);
        assert_eq!(a.risk, Risk::Low);
        assert!(a.auto_implement);
    }

    #[test]
    fn test_analysis_serializes_type_field() {
        let a = classify("Fix typo", "", &["bug"]);
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["type"], "bug");
        assert_eq!(json["autoImplement"], true);
    }
}
