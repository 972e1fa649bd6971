use anyhow::bail;
use axum::{
    Form, Json, Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, Multipart, Path, Query, State, multipart::MultipartError,
    },
    http::{StatusCode, header},
    response::{Html, IntoResponse},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tera::{Context, Tera};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace};

use crate::bands::{Band, BandCollection};
use crate::classifier::{self, AudioDescriptor, GenreSuggestion};
use crate::config::Config;
use crate::curve::{ChartLayout, CurveMode, curve_points, render_svg};
use crate::decode::{decode_audio, is_playable_upload};
use crate::error::{Error, Result};
use crate::host::CpalHost;
use crate::transport::{EqSource, PlaybackStatus, Transport, format_time};

/// Multipart field carrying the audio file
const UPLOAD_FIELD: &str = "audio";
/// Headroom over the configured upload limit for multipart framing, so
/// oversize files reach validation instead of being cut off mid-body
const BODY_LIMIT_SLACK: usize = 1024 * 1024;
/// Rate the measured chart mode simulates the chain at
const CHART_SAMPLE_RATE: f64 = 48_000.0;

#[derive(Debug, Clone)]
pub struct AppState {
    tera: Tera,
    transport: Arc<Mutex<Transport>>,
    config: Arc<Config>,
}

impl AppState {
    pub fn new(tera: Tera, transport: Transport, config: Config) -> Self {
        Self {
            tera,
            transport: Arc::new(Mutex::new(transport)),
            config: Arc::new(config),
        }
    }

    fn transport(&self) -> MutexGuard<'_, Transport> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn render(&self, template: &str, context: &Context) -> Result<Html<String>> {
        trace!(?context);
        Ok(Html(self.tera.render(template, context)?))
    }
}

/// A band as the templates see it
#[derive(Debug, Serialize)]
struct BandView {
    id: usize,
    label: String,
    gain: f64,
}

fn band_views(bands: &BandCollection) -> Vec<BandView> {
    bands
        .iter()
        .enumerate()
        .map(|(id, band)| BandView {
            id,
            label: band.label(),
            gain: band.gain,
        })
        .collect()
}

/// EQ session as returned by the JSON API
#[derive(Debug, Serialize)]
struct EqView {
    enabled: bool,
    source: EqSource,
    custom: BandCollection,
    active: BandCollection,
    suggestion: Option<GenreSuggestion>,
}

impl EqView {
    fn of(transport: &Transport) -> Self {
        Self {
            enabled: transport.eq_enabled(),
            source: transport.eq_source(),
            custom: transport.custom_bands().clone(),
            active: transport.active_bands().clone(),
            suggestion: transport.suggestion().cloned(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpdateGain {
    gain: f64,
}

#[derive(Debug, Deserialize)]
struct SeekRequest {
    time: Option<f64>,
    /// Fraction of the duration, from the progress bar
    fraction: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct SourceRequest {
    source: EqSource,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ChartSource {
    /// Whatever feeds the chain when EQ is on
    #[default]
    Active,
    Custom,
    Suggestion,
}

#[derive(Debug, Deserialize)]
struct ChartQuery {
    #[serde(default)]
    source: ChartSource,
    #[serde(default)]
    mode: CurveMode,
    width: Option<f64>,
    height: Option<f64>,
}

struct Upload {
    name: String,
    media_type: String,
    bytes: Bytes,
}

/// A body cut off by the upload limit reads as an oversize file
fn upload_error(e: MultipartError, max_bytes: u64) -> Error {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return classifier::too_large(max_bytes);
    }
    Error::Validation(format!("Invalid upload: {e}"))
}

/// First multipart field named `audio`, if any
async fn read_upload(mut multipart: Multipart, max_bytes: u64) -> Result<Option<Upload>> {
    let to_error = |e| upload_error(e, max_bytes);
    while let Some(field) = multipart.next_field().await.map_err(to_error)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let media_type = field.content_type().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(to_error)?;
        debug!(%name, %media_type, size = bytes.len(), "upload received");
        return Ok(Some(Upload {
            name,
            media_type,
            bytes,
        }));
    }
    Ok(None)
}

fn page_context(transport: &Transport) -> Context {
    let status = transport.status();
    let mut context = Context::new();
    context.insert("bands", &band_views(transport.custom_bands()));
    context.insert("eq_enabled", &transport.eq_enabled());
    context.insert("eq_source", &transport.eq_source());
    context.insert("suggestion", &transport.suggestion());
    context.insert("current_time", &format_time(status.current_time));
    context.insert("duration", &format_time(status.duration));
    context.insert("progress", &status.progress());
    context.insert("status", &status);
    context
}

async fn index(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let context = page_context(&state.transport());
    state.render("index.html", &context)
}

/// Update the gain of one custom band, returns the band fragment
async fn update_band(
    Path(id): Path<usize>,
    State(state): State<AppState>,
    Form(params): Form<UpdateGain>,
) -> Result<impl IntoResponse> {
    debug!(%id, "updating");
    let view = {
        let mut transport = state.transport();
        let gain = transport.update_band(id, params.gain)?;
        let label = transport
            .custom_bands()
            .get(id)
            .map(Band::label)
            .unwrap_or_default();
        BandView { id, label, gain }
    };

    let mut context = Context::new();
    context.insert("band", &view);
    state.render("band.html", &context)
}

/// Reset the equalizer to flat
async fn reset_equalizer(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let context = {
        let mut transport = state.transport();
        transport.reset_eq()?;
        page_context(&transport)
    };
    state.render("equalizer.html", &context)
}

/// Apply the last genre suggestion
async fn apply_suggestion_form(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let context = {
        let mut transport = state.transport();
        transport.apply_suggestion()?;
        page_context(&transport)
    };
    state.render("equalizer.html", &context)
}

/// Classify an upload into a genre suggestion
async fn process_audio(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse> {
    let limits = &state.config.classifier;
    let upload = read_upload(multipart, limits.max_upload_bytes)
        .await?
        .ok_or_else(|| Error::Validation("No audio file provided".into()))?;

    let file = AudioDescriptor {
        name: upload.name,
        size: upload.bytes.len() as u64,
        media_type: upload.media_type,
    };
    let suggestion =
        classifier::process(&file, limits.max_upload_bytes, limits.simulate_latency).await?;

    state.transport().set_suggestion(suggestion.clone())?;
    Ok(Json(suggestion))
}

/// Decode an upload into the playback buffer
async fn load_audio(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<PlaybackStatus>> {
    let upload = read_upload(multipart, state.config.classifier.max_upload_bytes)
        .await?
        .ok_or_else(|| Error::Validation("No audio file provided".into()))?;
    if !is_playable_upload(&upload.name, &upload.media_type) {
        return Err(Error::Validation("Please upload an audio file.".into()));
    }

    let ticket = state.transport().begin_load();
    info!(name = %upload.name, "Loading file");

    let decoded = tokio::task::spawn_blocking(move || {
        decode_audio(&upload.bytes, &upload.name, &upload.media_type)
    })
    .await
    .unwrap_or_else(|e| Err(Error::Processing(format!("decode task failed: {e}"))));

    let mut transport = state.transport();
    transport.finish_load(ticket, decoded)?;
    Ok(Json(transport.status()))
}

async fn transport_status(State(state): State<AppState>) -> Json<PlaybackStatus> {
    Json(state.transport().tick())
}

async fn transport_action(
    Path(action): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PlaybackStatus>> {
    let mut transport = state.transport();
    match action.as_str() {
        "play" => transport.play()?,
        "pause" => transport.pause(),
        "stop" => transport.stop(),
        other => return Err(Error::Validation(format!("unknown transport action: {other}"))),
    }
    Ok(Json(transport.status()))
}

async fn seek(
    State(state): State<AppState>,
    Json(request): Json<SeekRequest>,
) -> Result<Json<PlaybackStatus>> {
    let mut transport = state.transport();
    match (request.time, request.fraction) {
        (Some(time), _) => transport.seek(time)?,
        (None, Some(fraction)) => transport.seek_fraction(fraction)?,
        (None, None) => return Err(Error::Validation("seek needs a time or fraction".into())),
    };
    Ok(Json(transport.status()))
}

async fn eq_state(State(state): State<AppState>) -> Json<EqView> {
    Json(EqView::of(&state.transport()))
}

async fn set_eq_enabled(
    State(state): State<AppState>,
    Json(request): Json<EnabledRequest>,
) -> Result<Json<EqView>> {
    let mut transport = state.transport();
    transport.set_eq_enabled(request.enabled)?;
    Ok(Json(EqView::of(&transport)))
}

async fn select_source(
    State(state): State<AppState>,
    Json(request): Json<SourceRequest>,
) -> Result<Json<EqView>> {
    let mut transport = state.transport();
    transport.select_source(request.source)?;
    Ok(Json(EqView::of(&transport)))
}

async fn set_band_gain(
    Path(index): Path<usize>,
    State(state): State<AppState>,
    Json(request): Json<UpdateGain>,
) -> Result<impl IntoResponse> {
    let gain = state.transport().update_band(index, request.gain)?;
    Ok(Json(json!({ "index": index, "gain": gain })))
}

async fn apply_suggestion(State(state): State<AppState>) -> Result<Json<EqView>> {
    let mut transport = state.transport();
    transport.apply_suggestion()?;
    Ok(Json(EqView::of(&transport)))
}

async fn reset_eq(State(state): State<AppState>) -> Result<Json<EqView>> {
    let mut transport = state.transport();
    transport.reset_eq()?;
    Ok(Json(EqView::of(&transport)))
}

/// Frequency-response chart as SVG
async fn chart(
    State(state): State<AppState>,
    Query(query): Query<ChartQuery>,
) -> Result<impl IntoResponse> {
    let defaults = ChartLayout::default();
    let layout = ChartLayout {
        width: query.width.unwrap_or(defaults.width),
        height: query.height.unwrap_or(defaults.height),
        ..defaults
    };
    let min_side = 2.0 * layout.padding + 1.0;
    if !(layout.width >= min_side && layout.height >= min_side)
        || !layout.width.is_finite()
        || !layout.height.is_finite()
    {
        return Err(Error::Validation(format!(
            "chart size must be at least {min_side}px per side"
        )));
    }

    let bands = {
        let transport = state.transport();
        match query.source {
            ChartSource::Active => transport.active_bands().clone(),
            ChartSource::Custom => transport.custom_bands().clone(),
            ChartSource::Suggestion => transport
                .suggestion()
                .map(|s| s.bands.clone())
                .ok_or_else(|| Error::Validation("No EQ suggestion yet.".into()))?,
        }
    };

    let points = curve_points(&bands, query.mode, CHART_SAMPLE_RATE)?;
    Ok((
        [(header::CONTENT_TYPE, "image/svg+xml")],
        render_svg(&points, &layout),
    ))
}

pub fn router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.config.classifier.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_SLACK);

    Router::new()
        .route("/", get(index))
        .route("/equalizer/update/{id}", post(update_band))
        .route("/equalizer/reset", post(reset_equalizer))
        .route("/equalizer/apply", post(apply_suggestion_form))
        .route("/api/eq/process", post(process_audio))
        .route("/api/audio", post(load_audio))
        .route("/api/transport", get(transport_status))
        .route("/api/transport/seek", post(seek))
        .route("/api/transport/{action}", post(transport_action))
        .route("/api/eq", get(eq_state))
        .route("/api/eq/enabled", post(set_eq_enabled))
        .route("/api/eq/source", post(select_source))
        .route("/api/eq/bands/{index}", post(set_band_gain))
        .route("/api/eq/apply", post(apply_suggestion))
        .route("/api/eq/reset", post(reset_eq))
        .route("/api/eq/chart.svg", get(chart))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Advance the transport on a fixed interval so the end of the track is
/// noticed without a client polling.
fn spawn_ticker(
    transport: Arc<Mutex<Transport>>,
    interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("ticker stopped");
                    break;
                }
                _ = ticks.tick() => {
                    let status = transport
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .tick();
                    trace!(?status);
                }
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(%e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let tera = match Tera::new(&config.server.templates) {
        Ok(t) => t,
        Err(e) => bail!("Tera parsing error: {e}"),
    };

    debug!(templates=?tera.get_template_names().collect::<Vec<_>>());

    let host = CpalHost::new(config.playback.device.clone());
    let transport = Transport::new(Box::new(host), config.playback.output_gain_db);
    let tick_interval = Duration::from_millis(config.playback.tick_interval_ms.max(1));
    let bind = config.server.bind.clone();

    let state = AppState::new(tera, transport, config);
    let cancel_token = CancellationToken::new();
    let ticker = spawn_ticker(
        Arc::clone(&state.transport),
        tick_interval,
        cancel_token.clone(),
    );
    let transport = Arc::clone(&state.transport);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;

    info!("Server running on http://{bind}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel_token.cancel();
    if let Err(e) = ticker.await {
        error!(%e, "ticker task failed");
    }
    transport
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .close();

    Ok(())
}
