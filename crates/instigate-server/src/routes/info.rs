use axum::extract::State;
use axum::Json;

use crate::state::AppState;

/// GET /server_info. Doubles as the readiness probe.
pub async fn server_info(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "instigate",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_home": app.home,
    }))
}
