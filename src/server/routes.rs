//! # API Routes
//!
//! Actix handlers for the lyrics, models, jobs and compose endpoints. Every
//! controller call runs on actix's blocking pool through `web::block`, so slow
//! storage never stalls the async workers.
//!
//! Rejected requests answer with `{"job_id": null, "info": <message>}`; the status
//! code comes from [`status_for`]. Malformed JSON bodies get the same shape with
//! a 400.

use actix_web::error::{BlockingError, InternalError, JsonPayloadError};
use actix_web::http::StatusCode;
use actix_web::{middleware, web, App, HttpRequest, HttpResponse, HttpServer};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::controller::{Controller, JobError, JobTicket};
use crate::jobs::JobId;
use crate::repository::RecordId;

pub const DEFAULT_COMPOSE_LENGTH: usize = 200;

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub artist: String,
}

#[derive(Debug, Deserialize)]
pub struct NewModelRequest {
    pub model_name: String,
    pub based_on: Vec<RecordId>,
    pub epochs: u32,
}

#[derive(Debug, Deserialize)]
pub struct RetrainRequest {
    pub based_on: Vec<RecordId>,
    pub epochs: u32,
}

fn default_compose_length() -> usize {
    DEFAULT_COMPOSE_LENGTH
}

#[derive(Debug, Deserialize)]
pub struct ComposeRequest {
    pub model_name: String,
    pub start_lyrics: String,
    #[serde(default = "default_compose_length")]
    pub length: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct JobResponse {
    pub job_id: Option<JobId>,
    pub info: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub is_finished: bool,
    pub info: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LyricsSummary {
    #[serde(rename = "_id")]
    pub id: RecordId,
    pub artist: String,
    pub song_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelSummary {
    #[serde(rename = "_id")]
    pub id: RecordId,
    pub name: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ComposeResponse {
    pub model_name: String,
    pub lyrics: String,
}

/// HTTP status for a rejected or failed request.
pub fn status_for(err: &JobError) -> StatusCode {
    match err {
        JobError::AlreadyDownloaded(_)
        | JobError::ModelNameTaken(_)
        | JobError::DownloadInProgress(_)
        | JobError::TrainingInProgress(_) => StatusCode::CONFLICT,
        JobError::ArtistNotFound(_)
        | JobError::InvalidEpochCount { .. }
        | JobError::UnknownArtistId(_)
        | JobError::ModelNotFound(_)
        | JobError::InvalidModelName(_)
        | JobError::EmptyCorpus
        | JobError::InvalidSeed(_)
        | JobError::ComposeTooLong { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        JobError::RegistryExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        JobError::Storage(_)
        | JobError::Download(_)
        | JobError::Vocabulary(_)
        | JobError::Training(_)
        | JobError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rejection(status: StatusCode, info: String) -> HttpResponse {
    HttpResponse::build(status).json(JobResponse { job_id: None, info })
}

fn job_error_response(err: &JobError) -> HttpResponse {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        info!("Request rejected ({}): {}", status.as_u16(), err);
    }
    rejection(status, err.to_string())
}

fn blocking_error_response(err: BlockingError) -> HttpResponse {
    error!("Blocking task failed: {}", err);
    rejection(StatusCode::INTERNAL_SERVER_ERROR, "The request could not be processed".to_string())
}

fn accepted(result: Result<Result<JobTicket, JobError>, BlockingError>) -> HttpResponse {
    match result {
        Ok(Ok(ticket)) => HttpResponse::Accepted().json(JobResponse {
            job_id: Some(ticket.job_id),
            info: ticket.info,
        }),
        Ok(Err(e)) => job_error_response(&e),
        Err(e) => blocking_error_response(e),
    }
}

fn json_error_handler(err: JsonPayloadError, req: &HttpRequest) -> actix_web::Error {
    warn!("Malformed body for {} {}: {}", req.method(), req.path(), err);
    let response = rejection(StatusCode::BAD_REQUEST, format!("Malformed request body: {}", err));
    InternalError::from_response(err, response).into()
}

pub async fn download_lyrics(
    controller: web::Data<Controller>,
    body: web::Json<DownloadRequest>,
) -> HttpResponse {
    let artist = body.into_inner().artist;
    accepted(web::block(move || controller.download_lyrics(&artist)).await)
}

pub async fn list_lyrics(controller: web::Data<Controller>) -> HttpResponse {
    match web::block(move || controller.list_lyrics()).await {
        Ok(Ok(records)) => HttpResponse::Ok().json(
            records
                .into_iter()
                .map(|r| LyricsSummary {
                    id: r.id,
                    artist: r.artist,
                    song_count: r.song_count,
                })
                .collect::<Vec<_>>(),
        ),
        Ok(Err(e)) => job_error_response(&e),
        Err(e) => blocking_error_response(e),
    }
}

pub async fn train_new_model(
    controller: web::Data<Controller>,
    body: web::Json<NewModelRequest>,
) -> HttpResponse {
    let request = body.into_inner();
    accepted(
        web::block(move || controller.train_new_model(&request.model_name, &request.based_on, request.epochs))
            .await,
    )
}

pub async fn train_existing_model(
    controller: web::Data<Controller>,
    model_id: web::Path<RecordId>,
    body: web::Json<RetrainRequest>,
) -> HttpResponse {
    let model_id = model_id.into_inner();
    let request = body.into_inner();
    accepted(
        web::block(move || controller.train_existing_model(&model_id, &request.based_on, request.epochs)).await,
    )
}

pub async fn list_models(controller: web::Data<Controller>) -> HttpResponse {
    match web::block(move || controller.list_models()).await {
        Ok(Ok(records)) => HttpResponse::Ok().json(
            records
                .into_iter()
                .map(|r| ModelSummary {
                    id: r.id,
                    name: r.name,
                    created: r.created_at,
                })
                .collect::<Vec<_>>(),
        ),
        Ok(Err(e)) => job_error_response(&e),
        Err(e) => blocking_error_response(e),
    }
}

pub async fn job_status(controller: web::Data<Controller>, job_id: web::Path<JobId>) -> HttpResponse {
    let job_id = job_id.into_inner();
    let status = controller.poll(job_id);
    HttpResponse::Ok().json(JobStatusResponse {
        job_id,
        is_finished: status.is_finished,
        info: status.info,
    })
}

pub async fn compose(controller: web::Data<Controller>, body: web::Json<ComposeRequest>) -> HttpResponse {
    let request = body.into_inner();
    let model_name = request.model_name.clone();
    let result = web::block(move || {
        controller
            .generate(&request.model_name, &request.start_lyrics, request.length)?
            .collect::<Result<String, _>>()
            .map_err(JobError::Generation)
    })
    .await;

    match result {
        Ok(Ok(lyrics)) => HttpResponse::Ok().json(ComposeResponse { model_name, lyrics }),
        Ok(Err(e)) => job_error_response(&e),
        Err(e) => blocking_error_response(e),
    }
}

/// Registers the API routes; mount it under the configured base path.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .route("/lyrics", web::post().to(download_lyrics))
        .route("/lyrics", web::get().to(list_lyrics))
        .route("/models", web::post().to(train_new_model))
        .route("/models", web::get().to(list_models))
        .route("/models/{model_id}", web::post().to(train_existing_model))
        .route("/jobs/{job_id}", web::get().to(job_status))
        .route("/compose", web::post().to(compose));
}

/// Serves the API on `config.host:config.port` until the server is stopped.
pub async fn run_server(config: &AppConfig, controller: Controller) -> std::io::Result<()> {
    let controller = web::Data::new(controller);
    let base_path = config.base_path.clone();
    info!(
        "Starting server at http://{}:{}{}",
        config.host, config.port, base_path
    );

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(controller.clone())
            .service(web::scope(&base_path).configure(configure))
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::JobSettings;
    use crate::downloader::FsLyricsSource;
    use crate::jobs::MISSING_JOB_INFO;
    use crate::repository::Repository;
    use crate::trainer::BigramTrainer;
    use actix_web::test;
    use std::sync::Arc;

    fn controller(dir: &std::path::Path) -> Controller {
        Controller::new(
            JobSettings { worker_threads: 1, ..JobSettings::default() },
            Repository::in_memory(),
            Arc::new(FsLyricsSource::new(dir.join("lyrics"))),
            Arc::new(BigramTrainer::with_defaults(dir.join("checkpoints"))),
        )
        .unwrap()
    }

    macro_rules! api {
        ($controller:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($controller))
                    .service(web::scope("/api/v1").configure(configure)),
            )
            .await
        };
    }

    #[::core::prelude::v1::test]
    fn test_status_mapping() {
        assert_eq!(status_for(&JobError::ModelNameTaken("m".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&JobError::DownloadInProgress("a".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&JobError::ArtistNotFound("a".into())), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            status_for(&JobError::InvalidEpochCount { requested: 0, min: 1, max: 50 }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(&JobError::EmptyCorpus), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[actix_rt::test]
    async fn test_unknown_job_is_reported_finished() {
        let dir = tempfile::tempdir().unwrap();
        let app = api!(controller(dir.path()));

        let req = test::TestRequest::get().uri("/api/v1/jobs/42").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: JobStatusResponse = test::read_body_json(resp).await;
        assert_eq!(
            body,
            JobStatusResponse { job_id: 42, is_finished: true, info: MISSING_JOB_INFO.to_string() }
        );
    }

    #[actix_rt::test]
    async fn test_malformed_body_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = api!(controller(dir.path()));

        let req = test::TestRequest::post()
            .uri("/api/v1/lyrics")
            .set_json(serde_json::json!({ "singer": "Eminem" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: JobResponse = test::read_body_json(resp).await;
        assert_eq!(body.job_id, None);
        assert!(body.info.starts_with("Malformed request body"), "{}", body.info);
    }

    #[actix_rt::test]
    async fn test_unknown_artist_is_unprocessable() {
        let dir = tempfile::tempdir().unwrap();
        let app = api!(controller(dir.path()));

        let req = test::TestRequest::post()
            .uri("/api/v1/lyrics")
            .set_json(serde_json::json!({ "artist": "Nobody" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: JobResponse = test::read_body_json(resp).await;
        assert_eq!(body, JobResponse { job_id: None, info: "The artist Nobody was not found".to_string() });
    }

    #[actix_rt::test]
    async fn test_epoch_bounds_are_checked_before_anything_else() {
        let dir = tempfile::tempdir().unwrap();
        let app = api!(controller(dir.path()));

        let req = test::TestRequest::post()
            .uri("/api/v1/models")
            .set_json(serde_json::json!({ "model_name": "m1", "based_on": ["missing"], "epochs": 0 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: JobResponse = test::read_body_json(resp).await;
        assert!(body.info.contains("epochs"), "{}", body.info);
    }

    #[actix_rt::test]
    async fn test_compose_rejects_oversized_length() {
        let dir = tempfile::tempdir().unwrap();
        let app = api!(controller(dir.path()));

        let req = test::TestRequest::post()
            .uri("/api/v1/compose")
            .set_json(serde_json::json!({ "model_name": "m1", "start_lyrics": "yo", "length": 1_000_000_000u64 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: JobResponse = test::read_body_json(resp).await;
        assert!(body.info.starts_with("At most 2000 characters"), "{}", body.info);
    }

    #[actix_rt::test]
    async fn test_compose_unknown_model() {
        let dir = tempfile::tempdir().unwrap();
        let app = api!(controller(dir.path()));

        let req = test::TestRequest::post()
            .uri("/api/v1/compose")
            .set_json(serde_json::json!({ "model_name": "ghost", "start_lyrics": "yo" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
