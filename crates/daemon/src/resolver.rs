//! Agent resolver: which of a project's agents must run for an event.

use tenex_domain::agent::AgentDefinition;
use tenex_domain::event::Event;
use tenex_domain::kind;

/// Compute the agents that must execute for `event`.
///
/// - p-tagged project agents win outright.
/// - A thread root on the project, or any otherwise-unaddressed event,
///   routes to the PM.
/// - Delegation responses never reach this function (the delegation
///   registry intercepts them upstream and re-activates the delegator
///   itself).
///
/// The self-reply filter removes an agent whose pubkey signed the event,
/// unless that agent holds the `delegate` tool: a delegator must see the
/// completions that p-tag it back, and those arrive under its own
/// conversation chain.
///
/// Targets run concurrently; order carries no meaning.
pub fn resolve_targets<'a>(
    event: &Event,
    agents: &'a [AgentDefinition],
) -> Vec<&'a AgentDefinition> {
    let mentioned: Vec<&AgentDefinition> = event
        .p_tags()
        .iter()
        .filter_map(|pk| agents.iter().find(|a| a.pubkey == *pk))
        .collect();

    let targets: Vec<&AgentDefinition> = if !mentioned.is_empty() {
        mentioned
    } else {
        agents.iter().filter(|a| a.is_pm).collect()
    };

    targets
        .into_iter()
        .filter(|agent| agent.pubkey != event.pubkey || agent.has_tool("delegate"))
        .collect()
}

/// Events of these kinds go through target resolution at all; the rest
/// of the pipeline (project updates, metadata, stop requests, lessons)
/// is handled without agent dispatch.
pub fn is_dispatchable(event: &Event) -> bool {
    matches!(
        event.kind,
        kind::THREAD_ROOT | kind::GENERIC_REPLY | kind::SPEC_REPLY | kind::DELEGATION_TASK
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn agent(slug: &str, pubkey: &str, is_pm: bool, tools: &[&str]) -> AgentDefinition {
        AgentDefinition {
            slug: slug.into(),
            pubkey: pubkey.into(),
            name: String::new(),
            role: String::new(),
            instructions: String::new(),
            tools: tools.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            llm_config: None,
            is_pm,
        }
    }

    fn roster() -> Vec<AgentDefinition> {
        vec![
            agent("pm", "pm-pk", true, &["delegate"]),
            agent("dev", "dev-pk", false, &["shell"]),
        ]
    }

    fn event(kind: u16, pubkey: &str, p_tags: &[&str]) -> Event {
        Event {
            id: "e".into(),
            pubkey: pubkey.into(),
            created_at: 1,
            kind,
            tags: p_tags.iter().map(|p| vec!["p".to_string(), p.to_string()]).collect(),
            content: "hi".into(),
            sig: String::new(),
        }
    }

    #[test]
    fn mentions_win_over_pm_default() {
        let roster = roster();
        let targets = resolve_targets(&event(kind::GENERIC_REPLY, "user", &["dev-pk"]), &roster);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].slug, "dev");
    }

    #[test]
    fn unaddressed_thread_root_routes_to_pm() {
        let roster = roster();
        let targets = resolve_targets(&event(kind::THREAD_ROOT, "user", &[]), &roster);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].slug, "pm");
    }

    #[test]
    fn foreign_mentions_fall_back_to_pm() {
        let roster = roster();
        let targets = resolve_targets(
            &event(kind::GENERIC_REPLY, "user", &["somebody-else"]),
            &roster,
        );
        assert_eq!(targets[0].slug, "pm");
    }

    #[test]
    fn self_reply_suppressed_without_delegate_tool() {
        let roster = roster();
        // dev replies and p-tags itself: suppressed.
        let targets = resolve_targets(&event(kind::GENERIC_REPLY, "dev-pk", &["dev-pk"]), &roster);
        assert!(targets.is_empty());
    }

    #[test]
    fn delegator_may_process_its_own_events() {
        let roster = roster();
        // pm holds `delegate`, so a completion p-tagging pm back runs pm
        // even though pm signed an event in the same chain.
        let targets = resolve_targets(&event(kind::GENERIC_REPLY, "pm-pk", &["pm-pk"]), &roster);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].slug, "pm");
    }

    #[test]
    fn pm_default_also_honors_self_reply_rule() {
        let mut roster = roster();
        // Strip delegate from the PM: its own unaddressed reply must not
        // route back to it.
        roster[0].tools.clear();
        let targets = resolve_targets(&event(kind::GENERIC_REPLY, "pm-pk", &[]), &roster);
        assert!(targets.is_empty());
    }

    #[test]
    fn multiple_mentions_fan_out() {
        let roster = roster();
        let targets = resolve_targets(
            &event(kind::GENERIC_REPLY, "user", &["pm-pk", "dev-pk"]),
            &roster,
        );
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn dispatchable_kinds() {
        assert!(is_dispatchable(&event(kind::THREAD_ROOT, "u", &[])));
        assert!(is_dispatchable(&event(kind::DELEGATION_TASK, "u", &[])));
        assert!(!is_dispatchable(&event(kind::STOP_REQUEST, "u", &[])));
        assert!(!is_dispatchable(&event(kind::METADATA_REPLY, "u", &[])));
    }
}
