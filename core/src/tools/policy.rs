//! Per-send allow/deny rules for tool invocation.

use regex::Regex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Enable,
    Disable,
}

#[derive(Debug, Clone)]
struct PolicyRule {
    pattern: Regex,
    action: PolicyAction,
}

/// Ordered rules; the first whose pattern matches the tool name wins.
/// No match means enabled.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    rules: Vec<PolicyRule>,
}

impl ToolPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Invalid patterns are dropped with a warning rather than failing the
    /// whole send.
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = (&'a str, PolicyAction)>) -> Self {
        let rules = rules
            .into_iter()
            .filter_map(|(pattern, action)| match Regex::new(pattern) {
                Ok(regex) => Some(PolicyRule {
                    pattern: regex,
                    action,
                }),
                Err(e) => {
                    warn!(pattern, error = %e, "dropping invalid tool policy rule");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    pub fn allows(&self, tool_name: &str) -> bool {
        for rule in &self.rules {
            if rule.pattern.is_match(tool_name) {
                return rule.action == PolicyAction::Enable;
            }
        }
        true
    }
}
