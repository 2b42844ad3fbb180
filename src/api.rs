//! HTTP API for the companion service
//!
//! A chat endpoint for the user's device plus read and resolve endpoints
//! for caregivers reviewing alerts.

mod handlers;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::interpreter::TurnInterpreter;
use crate::runtime::{CareRuntime, DatabaseStorage};
use std::sync::Arc;

/// Runtime served over HTTP
pub type AppRuntime = CareRuntime<DatabaseStorage, Arc<dyn TurnInterpreter>>;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<AppRuntime>,
}

impl AppState {
    pub fn new(runtime: AppRuntime) -> Self {
        Self {
            runtime: Arc::new(runtime),
        }
    }
}
