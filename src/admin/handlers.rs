use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::throttle::ThrottleStats;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
}

pub async fn get_status() -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
    })
}

pub async fn get_throttle(State(state): State<AdminState>) -> Json<ThrottleStats> {
    Json(state.controller.stats())
}
