pub mod experiments;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use crate::auth::auth_middleware;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    let authed = Router::new()
        .route(
            "/experiments",
            post(experiments::create_experiment).get(experiments::list_experiments),
        )
        .route(
            "/experiments/{name}",
            get(experiments::get_experiment).delete(experiments::delete_experiment),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(authed)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
