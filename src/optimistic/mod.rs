//! Optimistic local updates reconciled against server responses.

pub mod manager;
pub mod state;

pub use manager::{
    shallow_merge, ConflictStrategy, MergeFn, MutationContext, MutationError, MutationManager,
    MutationStatus,
};
pub use state::LocalState;
