//! Folding several providers' profiles into one

use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::arbiter::Arbiter;
use super::source::{NormalizedProfile, WorkExperience};
use super::timeline;
use crate::attributes::{clean_value, is_empty_value};
use crate::types::{MemberIdentity, Reach};

/// Everything the providers agree on (or the arbiter decided)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SquashedProfile {
    /// New identities only; ones the member already has are left out
    pub identities: Vec<MemberIdentity>,
    pub attributes: BTreeMap<String, Value>,
    pub work_experiences: Vec<WorkExperience>,
    pub reach: Option<Reach>,
    /// The work experiences come from a selected high-confidence profile
    pub replace_automatic_experiences: bool,
}

impl SquashedProfile {
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
            && self.attributes.is_empty()
            && self.work_experiences.is_empty()
            && self.reach.as_ref().map_or(true, |r| r.is_empty())
    }
}

fn squash_identities(
    profiles: &BTreeMap<String, NormalizedProfile>,
    existing: &[MemberIdentity],
) -> Vec<MemberIdentity> {
    let mut identities: Vec<MemberIdentity> = Vec::new();
    for identity in profiles.values().flat_map(|p| p.identities.iter()) {
        if !identities.iter().any(|i| i.same_tuple(identity))
            && !existing.iter().any(|i| i.same_tuple(identity))
        {
            identities.push(identity.clone());
        }
    }
    identities
}

async fn squash_attributes(
    member_id: Uuid,
    profiles: &BTreeMap<String, NormalizedProfile>,
    arbiter: Option<&Arbiter>,
) -> BTreeMap<String, Value> {
    let mut candidates: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for profile in profiles.values() {
        for (name, value) in &profile.attributes {
            if is_empty_value(value) {
                continue;
            }
            candidates
                .entry(name.clone())
                .or_default()
                .push(clean_value(value));
        }
    }

    let mut squashed = BTreeMap::new();
    let mut conflicting: BTreeMap<String, Vec<Value>> = BTreeMap::new();

    for (name, values) in candidates {
        let mut unique: Vec<Value> = Vec::with_capacity(values.len());
        for value in values {
            if !unique.contains(&value) {
                unique.push(value);
            }
        }
        if unique.len() == 1 {
            squashed.insert(name, unique.remove(0));
        } else {
            conflicting.insert(name, unique);
        }
    }

    if conflicting.is_empty() {
        return squashed;
    }

    match arbiter {
        Some(arbiter) => {
            for (name, value) in arbiter.choose_attribute_values(member_id, &conflicting).await {
                squashed.insert(name, clean_value(&value));
            }
        }
        None => tracing::warn!(
            member_id = %member_id,
            attributes = ?conflicting.keys().collect::<Vec<_>>(),
            "Conflicting attribute values and no arbitration configured, leaving them unset"
        ),
    }
    squashed
}

/// Keep a single verified identity per organization
///
/// Several verified identities could point at different stored
/// organizations and force an organization merge.
fn single_verified_identity(experiences: &mut [WorkExperience]) {
    for experience in experiences {
        let mut seen = false;
        for identity in experience.identities.iter_mut().filter(|i| i.verified) {
            if seen {
                identity.verified = false;
            }
            seen = true;
        }
    }
}

/// Squash per-source profiles
///
/// `high_confidence` names the source whose selected profile is trusted
/// for work experiences and reach.
pub async fn squash(
    member_id: Uuid,
    profiles: &BTreeMap<String, NormalizedProfile>,
    existing_identities: &[MemberIdentity],
    high_confidence: Option<&str>,
    arbiter: Option<&Arbiter>,
) -> SquashedProfile {
    let identities = squash_identities(profiles, existing_identities);
    let attributes = squash_attributes(member_id, profiles, arbiter).await;

    let trusted = high_confidence.and_then(|source| profiles.get(source));

    let (work_experiences, replace_automatic_experiences) = match trusted {
        Some(profile) => (profile.work_experiences.clone(), true),
        None => {
            let mut timelines: Vec<Vec<WorkExperience>> = profiles
                .values()
                .map(|p| p.work_experiences.clone())
                .filter(|t| !t.is_empty())
                .collect();
            let mut merged = match timelines.len() {
                0 => Vec::new(),
                1 => timelines.remove(0),
                _ => timeline::reconcile(timelines),
            };
            single_verified_identity(&mut merged);
            (merged, false)
        }
    };

    SquashedProfile {
        identities,
        attributes,
        work_experiences,
        reach: trusted.and_then(|p| p.reach.clone()),
        replace_automatic_experiences,
    }
}
