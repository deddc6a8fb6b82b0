//! Agent profiles: per-tenant policy bundles and their loaders.

mod loader;
mod types;

pub use loader::{HttpProfileStore, ProfileRepository};
pub use types::{
    AgentProfile, CapabilitiesPolicy, CoverageRequirements, DecompositionPolicy, Expectation,
    IdentityPolicy, IntentRule, InteractionPolicy, InteractionThresholds, ModeInteractionPolicy,
    ProfileMeta, ProfileResolution, ProfileSource, ProfileStatus, QueryModeConfig,
    QueryModesPolicy, ReasoningBudget, RetrievalModeConfig, RetrievalPolicy, RouterHeuristics,
    ScopePattern, SearchHint, SynthesisPolicy, ToolPolicy, ValidationPolicy,
};
