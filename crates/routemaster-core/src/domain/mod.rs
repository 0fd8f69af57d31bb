/// Correlation identity value objects
pub mod correlation;

/// Engine events for observability
pub mod events;

/// Collaborator interfaces
pub mod repository;

/// Scoped state access
pub mod state_access;

/// Steps and registered steps
pub mod step;

/// Step results and the pipeline protocol
pub mod step_result;
