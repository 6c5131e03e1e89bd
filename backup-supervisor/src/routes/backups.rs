use crate::error::AppError;
use crate::routes::ok;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use backup_core::location::LocationRequest;
use backup_core::options::{nullable, OptionsUpdate};
use backup_core::{BackupType, CreateRequest, RestoreRequest, Selection};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups))
        .route("/info", get(overview))
        .route("/new/full", post(create_full))
        .route("/new/partial", post(create_partial))
        .route("/options", post(set_options))
        .route("/reload", post(reload))
        .route("/freeze", post(freeze))
        .route("/thaw", post(thaw))
        .route("/retention", post(apply_retention))
        .route("/{slug}", delete(remove_backup))
        .route("/{slug}/info", get(backup_info))
        .route("/{slug}/restore/full", post(restore_full))
        .route("/{slug}/restore/partial", post(restore_partial))
        .route("/{slug}/rename", post(rename_backup))
        .route("/{slug}/pin", post(pin_backup))
}

#[derive(Debug, Default, Deserialize)]
struct NewBackupBody {
    #[serde(default)]
    name: Option<String>,
    /// Absent: default location. `null`: local store. A name: that mount.
    #[serde(default, deserialize_with = "nullable")]
    location: Option<Option<String>>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    homeassistant_exclude_database: Option<bool>,
    #[serde(default)]
    homeassistant: bool,
    #[serde(default)]
    addons: BTreeSet<String>,
    #[serde(default)]
    folders: BTreeSet<String>,
}

impl NewBackupBody {
    fn into_request(self, backup_type: BackupType) -> CreateRequest {
        let selection = match backup_type {
            BackupType::Full => Selection::default(),
            BackupType::Partial => Selection {
                homeassistant: self.homeassistant,
                addons: self.addons,
                folders: self.folders,
            },
        };
        CreateRequest {
            backup_type,
            name: self.name,
            selection,
            location: LocationRequest::from(self.location),
            passphrase: self.password,
            homeassistant_exclude_database: self.homeassistant_exclude_database,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RestoreBody {
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    homeassistant: bool,
    #[serde(default)]
    addons: BTreeSet<String>,
    #[serde(default)]
    folders: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PinBody {
    pinned: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FreezeBody {
    /// Seconds until the system thaws on its own
    #[serde(default)]
    timeout: Option<u64>,
}

/// A POST without a JSON body behaves like one sending `{}`.
fn body_or_default<T: Default>(body: Option<Json<T>>) -> T {
    body.map(|Json(body)| body).unwrap_or_default()
}

async fn list_backups(State(state): State<Arc<AppState>>) -> Json<Value> {
    ok(json!({ "backups": state.manager.list().await }))
}

async fn overview(State(state): State<Arc<AppState>>) -> Json<Value> {
    ok(state.manager.overview().await)
}

async fn backup_info(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(state.manager.info(&slug).await?))
}

async fn create_full(
    State(state): State<Arc<AppState>>,
    body: Option<Json<NewBackupBody>>,
) -> Result<Json<Value>, AppError> {
    create(state, body_or_default(body).into_request(BackupType::Full)).await
}

async fn create_partial(
    State(state): State<Arc<AppState>>,
    body: Option<Json<NewBackupBody>>,
) -> Result<Json<Value>, AppError> {
    create(state, body_or_default(body).into_request(BackupType::Partial)).await
}

async fn create(state: Arc<AppState>, request: CreateRequest) -> Result<Json<Value>, AppError> {
    // A dropped connection drops this future, which aborts the archive write.
    let cancel = state.shutdown.child_token();
    let outcome = state.manager.create(request, &cancel).await?;
    for warning in &outcome.warnings {
        tracing::warn!(slug = %outcome.backup.slug, "{}", warning);
    }
    Ok(ok(json!({
        "slug": outcome.backup.slug,
        "backup": outcome.backup,
        "warnings": outcome.warnings,
    })))
}

async fn restore_full(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    body: Option<Json<RestoreBody>>,
) -> Result<Json<Value>, AppError> {
    let body = body_or_default(body);
    let request = RestoreRequest {
        passphrase: body.password,
        selection: None,
    };
    state.manager.restore(&slug, request).await?;
    Ok(ok(json!({})))
}

async fn restore_partial(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    body: Option<Json<RestoreBody>>,
) -> Result<Json<Value>, AppError> {
    let body = body_or_default(body);
    let request = RestoreRequest {
        passphrase: body.password,
        selection: Some(Selection {
            homeassistant: body.homeassistant,
            addons: body.addons,
            folders: body.folders,
        }),
    };
    state.manager.restore(&slug, request).await?;
    Ok(ok(json!({})))
}

async fn remove_backup(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.manager.remove(&slug).await?;
    Ok(ok(json!({})))
}

async fn rename_backup(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<Json<Value>, AppError> {
    if body.name.trim().is_empty() {
        return Err(AppError::BadRequest("name must not be empty".into()));
    }
    Ok(ok(state.manager.rename(&slug, &body.name).await?))
}

async fn pin_backup(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(body): Json<PinBody>,
) -> Result<Json<Value>, AppError> {
    state.manager.pin(&slug, body.pinned).await?;
    Ok(ok(json!({ "pinned": body.pinned })))
}

async fn set_options(
    State(state): State<Arc<AppState>>,
    Json(update): Json<OptionsUpdate>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(state.manager.set_options(update).await?))
}

async fn reload(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let count = state.manager.reload().await?;
    Ok(ok(json!({ "count": count })))
}

async fn freeze(
    State(state): State<Arc<AppState>>,
    body: Option<Json<FreezeBody>>,
) -> Result<Json<Value>, AppError> {
    let timeout = body_or_default(body).timeout.map(Duration::from_secs);
    let warnings = state.manager.freeze(timeout).await?;
    Ok(ok(json!({ "warnings": warnings })))
}

async fn thaw(State(state): State<Arc<AppState>>) -> Json<Value> {
    let warnings = state.manager.thaw().await;
    ok(json!({ "warnings": warnings }))
}

async fn apply_retention(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let removed = state.manager.apply_retention_policy().await?;
    Ok(ok(json!({ "removed": removed })))
}
