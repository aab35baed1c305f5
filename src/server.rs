use crate::config::AppConfig;
use crate::join::RegionIndex;
use crate::types::Region;
use anyhow::Result;
use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::info;

pub struct AppState {
    pub regions: Vec<Region>,
    pub index: RegionIndex,
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct QueryResponse {
    name: String,
    count: u32,
    elevation: f64,
}

pub async fn start_server(config: AppConfig, regions: Vec<Region>) -> Result<()> {
    println!("Building spatial index for API...");
    let index = RegionIndex::new(&regions);
    let state = Arc::new(AppState { regions, index });

    let port = config.server.port;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    println!("Starting server on http://{}", addr);

    let app = router(state, &config);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: Arc<AppState>, config: &AppConfig) -> Router {
    Router::new()
        .route("/api/query", get(query_handler))
        .nest_service("/layers", ServeDir::new(&config.output.dir))
        .fallback_service(ServeDir::new("."))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn lookup(state: &AppState, lon: f64, lat: f64) -> Option<QueryResponse> {
    state.index.locate(&state.regions, lon, lat).map(|i| {
        let region = &state.regions[i];
        QueryResponse { name: region.name.clone(), count: region.count, elevation: region.elevation }
    })
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<QueryResponse>> {
    let response = lookup(&state, params.lon, params.lat);
    info!(lat = params.lat, lon = params.lon, hit = response.is_some(), "Region query");
    Json(response)
}
