/// Inbound dispatch and step result application
pub mod dispatcher;

/// Route construction, builder and starter
pub mod route;

/// Per-instance timeout arming
pub mod timeout_scheduler;
