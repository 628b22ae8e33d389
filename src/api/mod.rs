
use actix_files;
use actix_web::{dev::Server, guard, web, App, HttpResponse, HttpServer, Responder};
use log::{debug, info};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use utoipa::OpenApi;
use utoipa::ToSchema;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::HttpdConfig;
use crate::snapshot::{LiveReading, PipelineStats, SnapshotPublisher};

/// Readings older than this make `/health` report unhealthy.
const MAX_SNAPSHOT_AGE_SECS: u64 = 300;

/// Everything the HTTP side may touch.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<SnapshotPublisher>,
    pub stats: Arc<PipelineStats>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(publisher: Arc<SnapshotPublisher>, stats: Arc<PipelineStats>) -> Self {
        AppState { publisher, stats, start_time: Instant::now() }
    }
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub timestamp: u64,
    pub last_snapshot_ago_seconds: Option<u64>,
    pub pipeline: PipelineInfo,
}

#[derive(Serialize, ToSchema)]
pub struct PipelineInfo {
    pub telegrams: u64,
    pub published: u64,
    pub framing_faults: u64,
    pub checksum_faults: u64,
    pub field_faults: u64,
    pub stream_faults: u64,
    pub storage_faults: u64,
}

impl From<&PipelineStats> for PipelineInfo {
    fn from(stats: &PipelineStats) -> Self {
        PipelineInfo {
            telegrams: PipelineStats::get(&stats.telegrams),
            published: PipelineStats::get(&stats.published),
            framing_faults: PipelineStats::get(&stats.framing_faults),
            checksum_faults: PipelineStats::get(&stats.checksum_faults),
            field_faults: PipelineStats::get(&stats.field_faults),
            stream_faults: PipelineStats::get(&stats.stream_faults),
            storage_faults: PipelineStats::get(&stats.storage_faults),
        }
    }
}

#[utoipa::path(get,
    path = "/health",
    summary = "Health check endpoint for container monitoring",
    responses(
        (status = 200, description = "A telegram was processed recently", body = HealthResponse),
        (status = 503, description = "No telegram processed yet or the last one is too old", body = HealthResponse)
    ),
)]
async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let system_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let last_snapshot_ago = state.publisher.read_with_age().map(|(_, age)| age);
    let healthy = last_snapshot_ago.map_or(false, |age| age < MAX_SNAPSHOT_AGE_SECS);

    let response = HealthResponse {
        status: if healthy { "healthy".to_string() } else { "unhealthy".to_string() },
        uptime_seconds: state.start_time.elapsed().as_secs(),
        timestamp: system_time,
        last_snapshot_ago_seconds: last_snapshot_ago,
        pipeline: PipelineInfo::from(state.stats.as_ref()),
    };

    if healthy {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

#[utoipa::path(get,
    path = "/api/v1/live",
    summary = "Latest reading of the meter, `{}` until the first telegram arrived. Any path with `?live` answers the same.",
    responses(
        (status = 200, description = "Latest reading", body = LiveReading)
    ),
)]
async fn get_live(state: web::Data<AppState>) -> impl Responder {
    match state.publisher.read() {
        Some(snapshot) => {
            let reading = LiveReading::from(snapshot);
            debug!("Data: {:?}", reading);
            HttpResponse::Ok().json(reading)
        }
        None => HttpResponse::Ok().content_type("application/json").body("{}"),
    }
}

/// True for query strings like `live`, `live=1` or `x=1&live`.
fn is_live_query(query: &str) -> bool {
    query.split('&').any(|param| param == "live" || param.starts_with("live="))
}

#[derive(OpenApi)]
#[openapi(
    info(description = "P1 smart meter reader API"),
    paths(
            health_check,
            get_live,
    ),
    components(schemas(LiveReading, HealthResponse, PipelineInfo))
)]
struct ApiDoc;

/// Register all routes, the data directory is served for everything else.
pub fn configure(cfg: &mut web::ServiceConfig, state: AppState, data_dir: PathBuf) {
    cfg.app_data(web::Data::new(state))
        .route("/health", web::get().to(health_check))
        .route("/api/v1/live", web::get().to(get_live))
        .service(
            SwaggerUi::new("/swagger-ui/{_:.*}")
                .url("/api/v1/openapi.json", ApiDoc::openapi()),
        )
        .service(
            web::resource("/{_:.*}")
                .guard(guard::fn_guard(|ctx| ctx.head().uri.query().map_or(false, is_live_query)))
                .route(web::get().to(get_live)),
        )
        .service(actix_files::Files::new("/", data_dir).show_files_listing().use_last_modified(true));
}

pub struct ApiManager {
    state: AppState,
    config: HttpdConfig,
    data_dir: PathBuf,
}

impl ApiManager {
    pub fn new(state: AppState, config: HttpdConfig, data_dir: PathBuf) -> Self {
        return ApiManager { state, config, data_dir };
    }

    /// Bind and return the running server, it is driven by awaiting it.
    pub fn start(&self) -> std::io::Result<Server> {
        let state = self.state.clone();
        let data_dir = self.data_dir.clone();
        info!("Serving at {}:{}", self.config.bind, self.config.port);

        let server = HttpServer::new(move || {
            let state = state.clone();
            let data_dir = data_dir.clone();
            App::new().configure(move |cfg| configure(cfg, state, data_dir))
        })
        .disable_signals()
        .bind((self.config.bind.as_str(), self.config.port))?
        .run();

        Ok(server)
    }
}
