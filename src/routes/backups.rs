use actix_web::{delete, get, post, web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::errors::PlatformError;
use crate::orchestrator::BackupOrchestrator;
use crate::types::DatabaseKind;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub delay_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileQuery {
    pub file_name: Option<String>,
    pub expires_in_minutes: Option<u32>,
}

impl FileQuery {
    fn file_name(&self) -> Result<&str, PlatformError> {
        self.file_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| PlatformError::InvalidArgument("fileName is required".to_string()))
    }
}

/// Publishes a backup trigger for `{db}` right away.
///
/// # Response
/// * `200 OK` - `{ "success": true, "messageId": "...", "message": "..." }`
/// * `400 Bad Request` - unknown database kind
/// * `500 Internal Server Error` - the queue rejected the publish
#[post("/{db}")]
pub async fn trigger_backup(
    orchestrator: web::Data<BackupOrchestrator>,
    path: web::Path<String>,
) -> Result<HttpResponse, PlatformError> {
    let database: DatabaseKind = path.into_inner().parse()?;
    let message_id = orchestrator.trigger_immediate(database).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "messageId": message_id,
        "message": format!("{database} backup triggered"),
    })))
}

/// Schedules a backup of `{db}` in `delayMinutes` (1 to 43200).
#[post("/{db}/schedule")]
pub async fn schedule_backup(
    orchestrator: web::Data<BackupOrchestrator>,
    path: web::Path<String>,
    body: web::Json<ScheduleRequest>,
) -> Result<HttpResponse, PlatformError> {
    let database: DatabaseKind = path.into_inner().parse()?;
    let delay_minutes = body
        .delay_minutes
        .ok_or_else(|| PlatformError::InvalidArgument("delayMinutes is required".to_string()))?;
    let scheduled = orchestrator.schedule_delayed(database, delay_minutes).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "taskId": scheduled.task_id,
        "taskName": scheduled.task_name,
        "scheduledFor": scheduled.scheduled_for,
        "message": format!(
            "{database} backup scheduled in {delay_minutes} minute(s)"
        ),
    })))
}

#[get("/tasks")]
pub async fn list_tasks(
    orchestrator: web::Data<BackupOrchestrator>,
) -> Result<HttpResponse, PlatformError> {
    let tasks = orchestrator.list_scheduled_tasks().await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("{} scheduled backup task(s)", tasks.len()),
        "count": tasks.len(),
        "data": tasks,
    })))
}

#[get("/tasks/{task_id}")]
pub async fn get_task(
    orchestrator: web::Data<BackupOrchestrator>,
    path: web::Path<String>,
) -> Result<HttpResponse, PlatformError> {
    let task = orchestrator.get_task_details(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("task {} found", task.task_id),
        "data": task,
    })))
}

/// Cancels a task that has not fired yet; fired or unknown tasks are a 404.
#[delete("/tasks/{task_id}")]
pub async fn cancel_task(
    orchestrator: web::Data<BackupOrchestrator>,
    path: web::Path<String>,
) -> Result<HttpResponse, PlatformError> {
    let task_id = path.into_inner();
    orchestrator.cancel_task(&task_id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("task {task_id} cancelled"),
    })))
}

#[get("/{db}/list")]
pub async fn list_backups(
    orchestrator: web::Data<BackupOrchestrator>,
    path: web::Path<String>,
) -> Result<HttpResponse, PlatformError> {
    let database: DatabaseKind = path.into_inner().parse()?;
    let artifacts = orchestrator.list_artifacts(database).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("{} {database} backup(s)", artifacts.len()),
        "count": artifacts.len(),
        "data": artifacts,
    })))
}

/// Issues a time limited download url, 60 minutes unless `expiresInMinutes` says otherwise.
#[get("/download")]
pub async fn download_backup(
    orchestrator: web::Data<BackupOrchestrator>,
    query: web::Query<FileQuery>,
) -> Result<HttpResponse, PlatformError> {
    let file_name = query.file_name()?;
    let url = orchestrator
        .generate_download_url(file_name, query.expires_in_minutes)
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("download url for {file_name} issued"),
        "signedUrl": url.signed_url,
        "expiresAt": url.expires_at,
    })))
}

#[delete("/delete")]
pub async fn delete_backup(
    orchestrator: web::Data<BackupOrchestrator>,
    query: web::Query<FileQuery>,
) -> Result<HttpResponse, PlatformError> {
    let file_name = query.file_name()?;
    orchestrator.delete_artifact(file_name).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("{file_name} deleted"),
    })))
}
