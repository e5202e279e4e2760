//! Placement of provider cache breakpoints.
//!
//! Pure function of the request shape: nothing here inspects message
//! contents or talks to a provider. Providers without the prompt-cache
//! capability get an empty plan.

/// Providers cap the number of cache markers per request; 4 is the common
/// budget and we never exceed it.
pub const MAX_CACHE_BREAKPOINTS: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePlan {
    /// Mark the (conceptual) system message.
    pub system: bool,
    /// Mark the last tool definition, which caches every tool up to and
    /// including it.
    pub last_tool: bool,
    /// Indices into the outgoing message array. Holds at most the
    /// second-to-last message, so the current user turn stays uncached.
    pub message_indices: Vec<usize>,
}

impl CachePlan {
    pub fn breakpoint_count(&self) -> usize {
        usize::from(self.system) + usize::from(self.last_tool) + self.message_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoint_count() == 0
    }
}

pub fn plan_cache_breakpoints(
    message_count: usize,
    tool_count: usize,
    supports_prompt_cache: bool,
) -> CachePlan {
    if !supports_prompt_cache {
        return CachePlan::default();
    }
    let mut plan = CachePlan {
        system: true,
        last_tool: tool_count > 0,
        message_indices: Vec::new(),
    };
    if message_count >= 2 {
        plan.message_indices.push(message_count - 2);
    }
    debug_assert!(plan.breakpoint_count() <= MAX_CACHE_BREAKPOINTS);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn no_capability_means_no_breakpoints() {
        assert!(plan_cache_breakpoints(10, 5, false).is_empty());
    }

    #[test]
    fn caches_system_tools_and_history_prefix() {
        let plan = plan_cache_breakpoints(6, 3, true);
        assert!(plan.system);
        assert!(plan.last_tool);
        assert_eq!(plan.message_indices, vec![4]);
        assert!(plan.breakpoint_count() <= MAX_CACHE_BREAKPOINTS);
    }

    #[test]
    fn single_message_history_gets_no_message_breakpoint() {
        let plan = plan_cache_breakpoints(1, 0, true);
        assert!(plan.system);
        assert!(!plan.last_tool);
        assert!(plan.message_indices.is_empty());
    }
}
