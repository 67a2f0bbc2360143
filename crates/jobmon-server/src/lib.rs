//! # Jobmon state server
//!
//! The authoritative task / task-instance state machine. All other
//! components (swarm, distributor, worker node, CLI) are HTTP clients; the
//! server is the only writer of status columns and the meeting point between
//! the swarm and the distributor.
//!
//! Routes live in [`routes`], persistence behind the [`storage::StateStore`]
//! trait with in-memory and PostgreSQL backends.

pub mod error;
pub mod openapi;
pub mod routes;
pub mod storage;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::AppState;
use storage::StateStore;

/// Assemble the full application router over the given store.
pub fn build_app(store: Arc<dyn StateStore>) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/health", get(routes::health))
        .route("/time", get(routes::server_time).with_state(state.clone()))
        .merge(routes::workflow::routes(state.clone()))
        .merge(routes::workflow_run::routes(state.clone()))
        .merge(routes::array::routes(state.clone()))
        .merge(routes::task::routes(state.clone()))
        .merge(routes::task_instance::routes(state.clone()))
        .merge(routes::dag::routes(state.clone()))
        .merge(routes::cli::routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
