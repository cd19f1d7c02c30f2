use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use instigate_core::definition::{InstigatorDefinition, InstigatorId};
use instigate_core::due::{next_tick_at, preview_context};
use instigate_core::error::InstigateError;
use instigate_core::evaluation::{EvaluationError, EvaluationResult};
use instigate_core::state::{InstigatorState, InstigatorStatus};
use instigate_core::storage::InstigatorStorage;
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;
use crate::state::{AppState, Loaded};

pub const DEFAULT_TICK_LIMIT: usize = 25;
pub const MAX_TICK_LIMIT: usize = 1000;

type InstigatorPath = (String, String, String);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_id((location, repository, name): InstigatorPath) -> Result<InstigatorId, AppError> {
    Ok(InstigatorId::new(location, repository, name)?)
}

/// The loaded definition for `id`. A location that failed to load is
/// reported as such rather than as a missing instigator.
fn require(loaded: &Loaded, id: &InstigatorId) -> Result<InstigatorDefinition, AppError> {
    if let Some(def) = loaded.find(id) {
        return Ok(def.clone());
    }
    if let Some(error) = loaded.location_error(&id.location) {
        return Err(AppError(anyhow::anyhow!(
            "location '{}' failed to load: {error}",
            id.location
        )));
    }
    Err(InstigateError::NotFound(id.key()).into())
}

/// Stored state, or what the state will look like once the daemon first
/// sees the definition.
fn effective_state(
    state: Option<InstigatorState>,
    def: &InstigatorDefinition,
    now: DateTime<Utc>,
) -> InstigatorState {
    state.unwrap_or_else(|| InstigatorState::new(def.id.clone(), def.default_status, now))
}

fn instigator_json(
    storage: &dyn InstigatorStorage,
    def: &InstigatorDefinition,
    now: DateTime<Utc>,
) -> instigate_core::Result<Value> {
    let stored = storage.get_state(&def.id)?;
    let status_changed_at = stored.as_ref().map(|s| s.status_changed_at);
    let state = effective_state(stored, def, now);
    let next_tick_at = if state.is_running() {
        next_tick_at(def, &state, now)?
    } else {
        None
    };
    let latest_tick = storage.ticks(&def.id, 1)?.into_iter().next();
    Ok(serde_json::json!({
        "id": def.id.key(),
        "location": def.id.location,
        "repository": def.id.repository,
        "name": def.id.name,
        "type": def.instigator_type(),
        "kind": def.kind,
        "job_name": def.job_name,
        "skip_cursor_policy": def.skip_cursor_policy,
        "status": state.status.as_str(),
        "cursor": state.cursor,
        "last_evaluated_at": state.last_evaluated_at,
        "status_changed_at": status_changed_at,
        "next_tick_at": next_tick_at,
        "latest_tick": latest_tick,
    }))
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// GET /api/instigators
pub async fn list_instigators(State(app): State<AppState>) -> Result<Json<Value>, AppError> {
    let result = tokio::task::spawn_blocking(move || {
        let now = Utc::now();
        let loaded = Loaded::load(app.source.as_ref());
        let instigators = loaded
            .definitions
            .iter()
            .map(|def| instigator_json(app.storage.as_ref(), def, now))
            .collect::<instigate_core::Result<Vec<_>>>()?;
        let load_errors: Vec<Value> = loaded
            .errors
            .iter()
            .map(|(location, error)| {
                serde_json::json!({ "location": location, "error": error })
            })
            .collect();
        Ok::<_, AppError>(serde_json::json!({
            "instigators": instigators,
            "load_errors": load_errors,
        }))
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(result))
}

/// GET /api/instigators/{location}/{repository}/{name}
pub async fn get_instigator(
    State(app): State<AppState>,
    Path(path): Path<InstigatorPath>,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(path)?;
    let result = tokio::task::spawn_blocking(move || {
        let loaded = Loaded::load(app.source.as_ref());
        let def = require(&loaded, &id)?;
        Ok::<_, AppError>(instigator_json(app.storage.as_ref(), &def, Utc::now())?)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct TicksQuery {
    pub limit: Option<usize>,
}

/// GET /api/instigators/{location}/{repository}/{name}/ticks?limit=N
///
/// History outlives the definition, so an instigator that was removed from
/// the workspace but still has state is served too.
pub async fn list_ticks(
    State(app): State<AppState>,
    Path(path): Path<InstigatorPath>,
    Query(query): Query<TicksQuery>,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(path)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TICK_LIMIT)
        .clamp(1, MAX_TICK_LIMIT);
    let result = tokio::task::spawn_blocking(move || {
        let loaded = Loaded::load(app.source.as_ref());
        if loaded.find(&id).is_none() && app.storage.get_state(&id)?.is_none() {
            return Err(AppError::from(InstigateError::NotFound(id.key())));
        }
        let ticks = app.storage.ticks(&id, limit)?;
        Ok::<_, AppError>(serde_json::json!({
            "instigator": id.key(),
            "limit": limit,
            "ticks": ticks,
        }))
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(result))
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

async fn change_status(
    app: AppState,
    path: InstigatorPath,
    status: InstigatorStatus,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(path)?;
    let result = tokio::task::spawn_blocking(move || {
        let now = Utc::now();
        let loaded = Loaded::load(app.source.as_ref());
        let def = require(&loaded, &id)?;
        app.storage.ensure_state(&id, def.default_status, now)?;
        app.storage.set_status(&id, status, now)?;
        tracing::info!(instigator = %id, status = %status, "status changed");
        Ok::<_, AppError>(instigator_json(app.storage.as_ref(), &def, now)?)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(result))
}

/// POST /api/instigators/{location}/{repository}/{name}/start
pub async fn start_instigator(
    State(app): State<AppState>,
    Path(path): Path<InstigatorPath>,
) -> Result<Json<Value>, AppError> {
    change_status(app, path, InstigatorStatus::Running).await
}

/// POST /api/instigators/{location}/{repository}/{name}/stop
pub async fn stop_instigator(
    State(app): State<AppState>,
    Path(path): Path<InstigatorPath>,
) -> Result<Json<Value>, AppError> {
    change_status(app, path, InstigatorStatus::Stopped).await
}

#[derive(Debug, Deserialize)]
pub struct CursorBody {
    #[serde(default)]
    pub cursor: Option<String>,
}

/// PUT /api/instigators/{location}/{repository}/{name}/cursor
pub async fn set_cursor(
    State(app): State<AppState>,
    Path(path): Path<InstigatorPath>,
    Json(body): Json<CursorBody>,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(path)?;
    let result = tokio::task::spawn_blocking(move || {
        let now = Utc::now();
        let loaded = Loaded::load(app.source.as_ref());
        let def = require(&loaded, &id)?;
        app.storage.ensure_state(&id, def.default_status, now)?;
        app.storage.set_cursor(&id, body.cursor.as_deref())?;
        tracing::info!(instigator = %id, cursor = ?body.cursor, "cursor set by operator");
        Ok::<_, AppError>(instigator_json(app.storage.as_ref(), &def, now)?)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(result))
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

/// `None` when the body leaves the cursor out; `Some(None)` for an explicit
/// `null`.
fn cursor_override(body: &[u8]) -> Result<Option<Option<String>>, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::bad_request(format!("invalid JSON body: {e}")))?;
    match value.get("cursor") {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(s)) => Ok(Some(Some(s.clone()))),
        Some(other) => Err(AppError::bad_request(format!(
            "cursor must be a string or null, got {other}"
        ))),
    }
}

/// POST /api/instigators/{location}/{repository}/{name}/test
///
/// Runs the evaluation callback once and reports what it returned. Nothing
/// is persisted and nothing is launched.
pub async fn test_instigator(
    State(app): State<AppState>,
    Path(path): Path<InstigatorPath>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(path)?;
    let cursor = cursor_override(&body)?;
    let source = app.source.clone();
    let storage = app.storage.clone();
    let (def, ctx) = tokio::task::spawn_blocking(move || {
        let now = Utc::now();
        let loaded = Loaded::load(source.as_ref());
        let def = require(&loaded, &id)?;
        let state = effective_state(storage.get_state(&id)?, &def, now);
        let mut ctx = preview_context(&def, &state, now)?;
        if let Some(cursor) = cursor {
            ctx.cursor = cursor;
        }
        Ok::<_, AppError>((def, ctx))
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    let evaluator = def.evaluator.clone();
    let eval_ctx = ctx.clone();
    let started = std::time::Instant::now();
    let handle = tokio::task::spawn_blocking(move || evaluator.evaluate(&eval_ctx));
    let outcome: Result<EvaluationResult, EvaluationError> =
        match tokio::time::timeout(app.evaluation_timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(EvaluationError::panicked(format!(
                "evaluation panicked: {e}"
            ))),
            Err(_) => Err(EvaluationError::timeout(format!(
                "evaluation did not finish within {}s",
                app.evaluation_timeout.as_secs()
            ))),
        };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let (result, error) = match outcome {
        Ok(result) => (Some(result), None),
        Err(error) => (None, Some(error)),
    };
    Ok(Json(serde_json::json!({
        "instigator": def.id.key(),
        "context": ctx,
        "result": result,
        "error": error,
        "elapsed_ms": elapsed_ms,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_body_keeps_stored_cursor() {
        assert_eq!(cursor_override(b"").unwrap(), None);
        assert_eq!(cursor_override(b"  \n").unwrap(), None);
        assert_eq!(cursor_override(b"{}").unwrap(), None);
    }

    #[test]
    fn explicit_cursor_overrides() {
        assert_eq!(
            cursor_override(br#"{"cursor": "c7"}"#).unwrap(),
            Some(Some("c7".to_string()))
        );
        assert_eq!(cursor_override(br#"{"cursor": null}"#).unwrap(), Some(None));
    }

    #[test]
    fn non_string_cursor_is_rejected() {
        assert!(cursor_override(br#"{"cursor": 7}"#).is_err());
        assert!(cursor_override(b"not json").is_err());
    }
}
