//! Integration tests for the coordination-and-dispatch roles

#[path = "integration/helpers.rs"]
mod helpers;

#[path = "integration/dispatch_pipeline.rs"]
mod dispatch_pipeline;

#[path = "integration/crash_recovery.rs"]
mod crash_recovery;

#[path = "integration/dead_letter.rs"]
mod dead_letter;

#[path = "integration/api_endpoints.rs"]
mod api_endpoints;
