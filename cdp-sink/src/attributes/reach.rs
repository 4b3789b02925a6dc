use crate::types::Reach;

const TOTAL: &str = "total";

/// Merge reach maps and re-derive `total` from every known platform
///
/// `total = -1` means unknown and is never added into a sum. The total is
/// recomputed from the merged map on every call rather than adjusted by
/// deltas, so merges from different platforms accumulate correctly.
pub fn calculate_reach(old: &Reach, new: &Reach) -> Reach {
    let mut out: Reach = old
        .iter()
        .filter(|(platform, _)| platform.as_str() != TOTAL)
        .map(|(platform, value)| (platform.clone(), *value))
        .collect();

    for (platform, value) in new {
        if platform != TOTAL {
            out.insert(platform.clone(), *value);
        }
    }

    let known: Vec<i64> = out.values().copied().filter(|v| *v >= 0).collect();
    let total = if known.is_empty() { -1 } else { known.iter().sum() };
    out.insert(TOTAL.to_string(), total);
    out
}
