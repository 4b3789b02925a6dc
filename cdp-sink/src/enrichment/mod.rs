//! Multi-source member enrichment

mod arbiter;
mod disambiguation;
mod scheduler;
mod service;
mod source;
mod squasher;
pub mod timeline;

pub use arbiter::{
    validate_attribute_choices, validate_profile_choice, Arbiter, ArbitrationClient, ArbitrationRequest,
    ArbitrationTask, HttpArbitrationClient,
};
pub use disambiguation::{cascade_discard, select_profile, ProfileSelection};
pub use scheduler::EnrichmentScheduler;
pub use service::EnrichmentService;
pub use source::{EnrichmentInput, EnrichmentSource, NormalizedProfile, WorkExperience};
pub use squasher::{squash, SquashedProfile};
