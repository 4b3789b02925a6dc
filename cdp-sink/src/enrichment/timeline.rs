//! Work-experience timelines
//!
//! `reconcile` folds per-source timelines into one; `diff` turns the result
//! into the smallest set of row changes against what is stored.

use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use uuid::Uuid;

use super::source::WorkExperience;
use crate::types::{MemberOrganization, MANUAL_SOURCE};

/// Missing start sorts first (−∞)
fn cmp_start(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

/// Missing end sorts last (+∞)
fn cmp_end(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

/// Closed ranges with open ends treated as infinite
pub fn dates_intersect(
    start_a: Option<NaiveDate>,
    end_a: Option<NaiveDate>,
    start_b: Option<NaiveDate>,
    end_b: Option<NaiveDate>,
) -> bool {
    let a_starts_before_b_ends = match (start_a, end_b) {
        (Some(s), Some(e)) => s <= e,
        _ => true,
    };
    let b_starts_before_a_ends = match (start_b, end_a) {
        (Some(s), Some(e)) => s <= e,
        _ => true,
    };
    a_starts_before_b_ends && b_starts_before_a_ends
}

fn normalized_title(title: &Option<String>) -> Option<String> {
    title
        .as_deref()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
}

fn same_organization(a: &WorkExperience, b: &WorkExperience) -> bool {
    let shared_identity = a.identities.iter().any(|x| {
        b.identities
            .iter()
            .any(|y| x.identity_type == y.identity_type && x.value.eq_ignore_ascii_case(&y.value))
    });
    if shared_identity {
        return true;
    }
    match (&a.organization_name, &b.organization_name) {
        (Some(x), Some(y)) => {
            let (x, y) = (x.trim(), y.trim());
            !x.is_empty() && x.eq_ignore_ascii_case(y)
        }
        _ => false,
    }
}

struct Segment {
    experience: WorkExperience,
    sources: BTreeSet<String>,
}

impl Segment {
    fn new(experience: WorkExperience) -> Self {
        let sources = BTreeSet::from([experience.source.clone()]);
        Self { experience, sources }
    }

    fn absorb(&mut self, other: &WorkExperience) {
        let this = &mut self.experience;
        if cmp_start(other.start_date, this.start_date) == Ordering::Less {
            this.start_date = other.start_date;
        }
        if cmp_end(other.end_date, this.end_date) == Ordering::Greater {
            this.end_date = other.end_date;
        }
        for identity in &other.identities {
            if !this.identities.iter().any(|i| i.same_tuple(identity)) {
                this.identities.push(identity.clone());
            }
        }
        if this.organization_description.is_none() {
            this.organization_description = other.organization_description.clone();
        }
        self.sources.insert(other.source.clone());
    }
}

/// Merge timelines from different sources into one chronological list
///
/// Entries only combine when they name the same organization, come from
/// different sources and overlap in time. Same title: one entry spanning
/// both ranges. Different titles: the earlier entry ends where the later
/// one starts (and resumes after it when it outlasted it).
pub fn reconcile(timelines: Vec<Vec<WorkExperience>>) -> Vec<WorkExperience> {
    let mut incoming: Vec<WorkExperience> = timelines.into_iter().flatten().collect();
    incoming.sort_by(|a, b| cmp_start(a.start_date, b.start_date).then(cmp_end(a.end_date, b.end_date)));

    let mut segments: Vec<Segment> = Vec::new();

    for entry in incoming {
        let matched = segments.iter().position(|s| {
            !s.sources.contains(&entry.source)
                && same_organization(&s.experience, &entry)
                && dates_intersect(
                    s.experience.start_date,
                    s.experience.end_date,
                    entry.start_date,
                    entry.end_date,
                )
        });

        let Some(index) = matched else {
            segments.push(Segment::new(entry));
            continue;
        };

        if normalized_title(&segments[index].experience.title) == normalized_title(&entry.title) {
            segments[index].absorb(&entry);
            continue;
        }

        let earlier = &segments[index].experience;
        if cmp_start(earlier.start_date, entry.start_date) != Ordering::Less {
            // same start, nothing to split on
            segments.push(Segment::new(entry));
            continue;
        }

        let tail = match entry.end_date {
            Some(end) if cmp_end(earlier.end_date, Some(end)) == Ordering::Greater => {
                let mut rest = earlier.clone();
                rest.start_date = Some(end);
                Some(Segment {
                    experience: rest,
                    sources: segments[index].sources.clone(),
                })
            }
            _ => None,
        };

        segments[index].experience.end_date = entry.start_date;
        segments.push(Segment::new(entry));
        if let Some(tail) = tail {
            segments.push(tail);
        }
    }

    let mut out: Vec<WorkExperience> = segments.into_iter().map(|s| s.experience).collect();
    out.sort_by(|a, b| cmp_start(a.start_date, b.start_date).then(cmp_end(a.end_date, b.end_date)));
    out
}

/// An incoming experience whose organization has been resolved
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedExperience {
    pub organization_id: Uuid,
    pub title: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimelineDiff {
    pub to_create: Vec<ResolvedExperience>,
    pub to_update: Vec<MemberOrganization>,
    pub to_delete: Vec<Uuid>,
}

impl TimelineDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

fn is_manual(row: &MemberOrganization) -> bool {
    row.source.as_deref() == Some(MANUAL_SOURCE)
}

/// Changes turning `existing` rows into `incoming`
///
/// Each stored row claims at most one incoming entry, first by title and
/// organization, then by organization and overlapping dates. Manual rows
/// that match stay untouched; other matched rows take the incoming title
/// and dates. Unmatched manual rows are always kept; unmatched other rows
/// are deleted only when `replace_automatic` is set.
pub fn diff(
    existing: &[MemberOrganization],
    incoming: &[ResolvedExperience],
    replace_automatic: bool,
) -> TimelineDiff {
    let mut remaining: Vec<ResolvedExperience> = incoming.to_vec();
    remaining.sort_by(|a, b| cmp_start(a.start_date, b.start_date));

    let mut ordered: Vec<&MemberOrganization> = existing.iter().collect();
    ordered.sort_by(|a, b| {
        is_manual(b)
            .cmp(&is_manual(a))
            .then(cmp_start(a.date_start, b.date_start))
    });

    let mut result = TimelineDiff::default();

    for row in ordered {
        let by_title = remaining.iter().position(|e| {
            e.organization_id == row.organization_id
                && normalized_title(&e.title) == normalized_title(&row.title)
        });
        let matched = by_title.or_else(|| {
            remaining.iter().position(|e| {
                e.organization_id == row.organization_id
                    && dates_intersect(row.date_start, row.date_end, e.start_date, e.end_date)
            })
        });

        match matched {
            Some(index) => {
                let entry = remaining.remove(index);
                if is_manual(row) {
                    continue;
                }
                if row.title != entry.title
                    || row.date_start != entry.start_date
                    || row.date_end != entry.end_date
                {
                    let mut updated = row.clone();
                    updated.title = entry.title;
                    updated.date_start = entry.start_date;
                    updated.date_end = entry.end_date;
                    result.to_update.push(updated);
                }
            }
            None if replace_automatic && !is_manual(row) => result.to_delete.push(row.id),
            None => {}
        }
    }

    result.to_create = remaining;
    result
}
