//! Backup export/import HTTP surface over BackupService (§4.10).

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::backup_service::{ExportResult, ImportResult};
use crate::error::AppResult;
use crate::state::AppState;

pub async fn export_backup(State(state): State<AppState>) -> AppResult<Json<ExportResult>> {
    Ok(Json(state.backup.export().await?))
}

#[derive(Debug, Deserialize)]
pub struct ImportBackupRequest {
    pub path: Option<String>,
    pub types: Option<Vec<String>>,
    #[serde(default)]
    pub include_local: bool,
}

pub async fn import_backup(
    State(state): State<AppState>,
    Json(req): Json<ImportBackupRequest>,
) -> AppResult<Json<ImportResult>> {
    let path = req.path.as_ref().map(std::path::Path::new);
    let result = state.backup.import(path, req.types.as_deref(), req.include_local).await?;
    Ok(Json(result))
}
