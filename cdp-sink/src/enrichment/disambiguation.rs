//! Picking the right profile among scraper candidates

use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::arbiter::Arbiter;
use super::source::NormalizedProfile;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSelection {
    pub selected: Option<NormalizedProfile>,
    pub discarded: Vec<NormalizedProfile>,
}

async fn choose(
    arbiter: Option<&Arbiter>,
    member_id: Uuid,
    member_context: &Value,
    candidates: &[NormalizedProfile],
) -> Option<usize> {
    match arbiter {
        Some(arbiter) => arbiter.select_profile(member_id, member_context, candidates).await,
        None => {
            tracing::debug!(
                member_id = %member_id,
                candidates = candidates.len(),
                "No arbitration configured, cannot choose between profiles"
            );
            None
        }
    }
}

/// Split `candidates` into the member's profile and the rest
///
/// Candidates found through a verified identity win; a lone one is taken
/// without asking. Unverified candidates are only considered when no
/// verified one was selected.
pub async fn select_profile(
    arbiter: Option<&Arbiter>,
    member_id: Uuid,
    member_context: &Value,
    candidates: Vec<NormalizedProfile>,
) -> ProfileSelection {
    let (verified, unverified): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|p| p.from_verified_source);

    let mut selection = ProfileSelection::default();

    for group in [verified, unverified] {
        if group.is_empty() {
            continue;
        }
        if selection.selected.is_some() {
            selection.discarded.extend(group);
            continue;
        }

        let index = if group.len() == 1 && group[0].from_verified_source {
            Some(0)
        } else {
            choose(arbiter, member_id, member_context, &group).await
        };

        for (i, profile) in group.into_iter().enumerate() {
            if Some(i) == index {
                selection.selected = Some(profile);
            } else {
                selection.discarded.push(profile);
            }
        }
    }

    selection
}

/// Drop every source whose profile carries a discarded profile's handle
///
/// Returns the names of the removed sources. Their cache rows are left
/// alone; they age out on their own TTL.
pub fn cascade_discard(
    profiles: &mut BTreeMap<String, NormalizedProfile>,
    discarded: &[NormalizedProfile],
    social_platform: &str,
) -> Vec<String> {
    let handles: Vec<&str> = discarded
        .iter()
        .filter_map(|p| p.handle_on(social_platform))
        .collect();

    let removed: Vec<String> = profiles
        .iter()
        .filter(|(_, profile)| {
            profile.identities.iter().any(|i| {
                i.platform == social_platform && handles.contains(&i.value.as_str())
            })
        })
        .map(|(source, _)| source.clone())
        .collect();

    for source in &removed {
        tracing::info!(source = %source, "Discarding source tied to a rejected profile");
        profiles.remove(source);
    }
    removed
}
