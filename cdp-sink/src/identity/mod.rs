//! Identity resolution
//!
//! Maps `(tenant, platform, type, value)` tuples to the member that owns
//! them. Verified tuples are strong and unique per tenant; unverified ones
//! are weak hints that get promoted once nobody else owns them.

mod resolver;

pub use resolver::{
    find_member_for, heal_stale_activity, normalize_identities, reconcile_identities, resolve,
    IdentityReconciliation,
};
