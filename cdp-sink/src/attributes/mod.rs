//! Attribute reconciliation
//!
//! Attributes are stored as `name → platform → value` with a computed
//! `default` entry per name. Incoming values are checked against the
//! tenant's schema, deep-merged into what is stored, and the default is
//! re-derived from the tenant's platform priority.

mod defaults;
mod merge;
mod reach;
mod schema;
mod validator;

pub use defaults::{highest_priority_platform, set_defaults, DEFAULT_KEY};
pub use merge::{clean_value, deep_merge, is_empty_value, merge_for_update};
pub use reach::calculate_reach;
pub use schema::{
    default_attribute_bundle, install_attribute_bundle, is_valid_email, AttributeSchema, AttributeSetting,
    AttributeType,
};
pub use validator::{validate, CUSTOM_PLATFORM};
