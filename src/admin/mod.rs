//! Admin API: read-only view of the admission pools.

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};
use std::sync::Arc;

use crate::throttle::AdmissionController;
use self::auth::admin_auth_middleware;
use self::handlers::*;

/// State shared by the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub controller: Arc<AdmissionController>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(controller: Arc<AdmissionController>, api_key: String) -> Self {
        Self {
            controller,
            api_key: api_key.into(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/throttle", get(get_throttle))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
