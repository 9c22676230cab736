pub mod reply;

use crate::state::AppState;
use axum::Router;

pub fn configure(state: AppState) -> Router {
    Router::new().merge(reply::routes(state))
}
