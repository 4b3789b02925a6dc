//! Organization resolution
//!
//! Finds or creates organizations from identity-bearing payloads, links
//! members to them, and repairs the legacy organization cache.

mod cache_repair;
mod domain;
mod resolver;

pub use cache_repair::repair_organization_cache;
pub use domain::{email_domain, is_free_email_domain, normalize_domain};
pub use resolver::{
    add_to_member, assign_organization_by_email_domain, find_or_create, normalize_social_fields,
    process_organization_enrich,
};
