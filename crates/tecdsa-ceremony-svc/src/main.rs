//! Ceremony Coordinator Service
//!
//! HTTP front end for the threshold ECDSA coordinator. Device submissions
//! arrive as signed requests and are checked against the device's enrolled
//! key before they reach the coordinator.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tecdsa_ceremony::{
    CeremonyError, CeremonyView, Coordinator, CoordinatorConfig, DeviceRecord, MtaInbox,
    SessionView, ShareMetadata, SubmitOutcome,
};
use tecdsa_core::auth::SignedRequest;
use tecdsa_core::keygen::{DkgBundle, DkgFailureReport, DkgSubmission, KeyShareConfirmation};
use tecdsa_core::mta::MtaPayload;
use tecdsa_core::sign::{DeltaShare, NonceCommitment, SignatureShare};
use tecdsa_core::{CeremonyId, DeviceIdentity, MessageDigest, ParticipantId, SessionId};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};

/// Coordinator service CLI arguments
#[derive(Parser, Debug)]
#[command(name = "tecdsa-ceremony-svc")]
#[command(about = "Coordinator service for threshold ECDSA ceremonies")]
struct Args {
    /// Listen address
    #[arg(short, long, env = "TECDSA_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Coordinator configuration (JSON); defaults apply when omitted
    #[arg(short, long, env = "TECDSA_CONFIG")]
    config: Option<String>,

    /// Seconds between sweeps for timed-out rounds
    #[arg(long, env = "TECDSA_SWEEP_INTERVAL", default_value = "10")]
    sweep_interval: u64,
}

/// Application state
struct AppState {
    coordinator: Coordinator,
}

/// Enrollment request
#[derive(Debug, Serialize, Deserialize)]
struct EnrollRequest {
    #[serde(default)]
    enrollment_key: Option<String>,
    identity: DeviceIdentity,
}

/// Start-DKG request
#[derive(Debug, Default, Serialize, Deserialize)]
struct StartDkgRequest {
    #[serde(default)]
    target: Option<String>,
}

/// Start-signing request: a 32-byte hash, or a message and its digest
#[derive(Debug, Serialize, Deserialize)]
struct StartSigningRequest {
    #[serde(default)]
    message_hash: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    digest: MessageDigest,
    #[serde(default)]
    signers: Option<Vec<ParticipantId>>,
}

impl StartSigningRequest {
    fn hash(&self) -> std::result::Result<[u8; 32], CeremonyError> {
        match (&self.message_hash, &self.message) {
            (Some(hash), _) => {
                let bytes = hex::decode(hash.trim_start_matches("0x"))
                    .map_err(|e| CeremonyError::InvalidRequest(format!("message_hash: {}", e)))?;
                bytes.try_into().map_err(|_| {
                    CeremonyError::InvalidRequest("message_hash must be 32 bytes".into())
                })
            }
            (None, Some(message)) => Ok(self.digest.digest(message.as_bytes())),
            (None, None) => Err(CeremonyError::InvalidRequest(
                "message_hash or message is required".into(),
            )),
        }
    }
}

/// One leg of an MtA exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MtaSubmission {
    to: ParticipantId,
    payload: MtaPayload,
}

/// Abort request
#[derive(Debug, Default, Serialize, Deserialize)]
struct AbortRequest {
    #[serde(default)]
    reason: Option<String>,
}

/// Coordinator error as an HTTP response
struct ApiError(CeremonyError);

impl From<CeremonyError> for ApiError {
    fn from(err: CeremonyError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(code = self.0.code(), error = %self.0, "Request failed");
        }

        let mut body = serde_json::json!({
            "error": self.0.code(),
            "kind": self.0.kind(),
            "message": self.0.to_string(),
        });
        if let Some(progress) = self.0.progress() {
            body["progress"] = serde_json::json!(progress);
        }
        if matches!(self.0, CeremonyError::QuorumNotYetReached { .. }) {
            body["status"] = serde_json::json!("waiting");
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CoordinatorConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => CoordinatorConfig::default(),
    };

    info!(
        listen = %args.listen,
        threshold = config.threshold,
        total_signers = config.total_signers,
        round_timeout_secs = config.round_timeout_secs,
        "Starting ceremony coordinator"
    );

    let state = Arc::new(AppState {
        coordinator: Coordinator::new(config)?,
    });

    // Abort rounds nobody finishes
    let sweeper = state.clone();
    let sweep_every = std::time::Duration::from_secs(args.sweep_interval.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            sweeper.coordinator.sweep_expired(chrono::Utc::now());
        }
    });

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(address = %args.listen, "Listening");

    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/devices", post(enroll).get(list_devices))
        .route("/v1/targets/:target", get(share_metadata))
        .route("/v1/ceremonies", post(start_dkg))
        .route("/v1/ceremonies/:id", get(ceremony))
        .route("/v1/ceremonies/:id/dkg", post(submit_dkg))
        .route("/v1/ceremonies/:id/bundle/:participant", get(dkg_bundle))
        .route("/v1/ceremonies/:id/confirm", post(confirm_key_share))
        .route("/v1/ceremonies/:id/failure", post(report_dkg_failure))
        .route("/v1/ceremonies/:id/abort", post(abort_ceremony))
        .route("/v1/ceremonies/:id/sessions", post(start_signing))
        .route("/v1/sessions/:id", get(session))
        .route("/v1/sessions/:id/commitments", post(submit_commitment))
        .route("/v1/sessions/:id/mta", post(submit_mta))
        .route("/v1/sessions/:id/mta/:participant", get(mta_inbox))
        .route("/v1/sessions/:id/deltas", post(submit_delta))
        .route("/v1/sessions/:id/shares", post(submit_signature_share))
        .route("/v1/sessions/:id/abort", post(abort_session))
        .with_state(state)
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tecdsa-ceremony-svc",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn enroll(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnrollRequest>,
) -> ApiResult<DeviceRecord> {
    let record = state
        .coordinator
        .enroll(req.enrollment_key.as_deref(), &req.identity)?;
    Ok(Json(record))
}

async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceRecord>> {
    Json(state.coordinator.registry().devices())
}

async fn share_metadata(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.registry().share_metadata(&target) {
        Some(metadata) => (StatusCode::OK, Json(Some(metadata))),
        None => (StatusCode::NOT_FOUND, Json(None::<ShareMetadata>)),
    }
}

async fn start_dkg(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartDkgRequest>>,
) -> ApiResult<CeremonyView> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.coordinator.start_dkg(req.target.as_deref())?))
}

async fn ceremony(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CeremonyId>,
) -> ApiResult<CeremonyView> {
    Ok(Json(state.coordinator.ceremony(&id)?))
}

async fn submit_dkg(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CeremonyId>,
    Json(req): Json<SignedRequest<DkgSubmission>>,
) -> ApiResult<SubmitOutcome> {
    state.coordinator.authorize(&req, "submit_dkg", &id)?;
    Ok(Json(
        state
            .coordinator
            .submit_dkg(&id, &req.participant_id, req.body)?,
    ))
}

async fn dkg_bundle(
    State(state): State<Arc<AppState>>,
    Path((id, participant)): Path<(CeremonyId, ParticipantId)>,
) -> ApiResult<DkgBundle> {
    Ok(Json(state.coordinator.dkg_bundle(&id, &participant)?))
}

async fn confirm_key_share(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CeremonyId>,
    Json(req): Json<SignedRequest<KeyShareConfirmation>>,
) -> ApiResult<SubmitOutcome> {
    state.coordinator.authorize(&req, "confirm_key_share", &id)?;
    Ok(Json(state.coordinator.confirm_key_share(
        &id,
        &req.participant_id,
        req.body,
    )?))
}

async fn report_dkg_failure(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CeremonyId>,
    Json(req): Json<SignedRequest<DkgFailureReport>>,
) -> ApiResult<CeremonyView> {
    state.coordinator.authorize(&req, "report_dkg_failure", &id)?;
    Ok(Json(state.coordinator.report_dkg_failure(
        &id,
        &req.participant_id,
        req.body,
    )?))
}

async fn abort_ceremony(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CeremonyId>,
    body: Option<Json<AbortRequest>>,
) -> ApiResult<CeremonyView> {
    let reason = abort_reason(body);
    Ok(Json(state.coordinator.abort_ceremony(&id, &reason)?))
}

async fn start_signing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CeremonyId>,
    Json(req): Json<StartSigningRequest>,
) -> ApiResult<SessionView> {
    let hash = req.hash()?;
    Ok(Json(state.coordinator.start_signing(&id, hash, req.signers)?))
}

async fn session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> ApiResult<SessionView> {
    Ok(Json(state.coordinator.session(&id)?))
}

async fn submit_commitment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(req): Json<SignedRequest<NonceCommitment>>,
) -> ApiResult<SubmitOutcome> {
    state.coordinator.authorize(&req, "submit_commitment", &id)?;
    Ok(Json(state.coordinator.submit_commitment(
        &id,
        &req.participant_id,
        req.body,
    )?))
}

/// Range proof checks are CPU-bound, so they run off the async workers
async fn submit_mta(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(req): Json<SignedRequest<MtaSubmission>>,
) -> ApiResult<SubmitOutcome> {
    let outcome = tokio::task::spawn_blocking(move || {
        state.coordinator.authorize(&req, "submit_mta", &id)?;
        let SignedRequest {
            participant_id,
            body,
            ..
        } = req;
        state
            .coordinator
            .submit_mta(&id, &participant_id, &body.to, body.payload)
    })
    .await
    .map_err(|e| ApiError(CeremonyError::Transient(e.to_string())))??;
    Ok(Json(outcome))
}

async fn mta_inbox(
    State(state): State<Arc<AppState>>,
    Path((id, participant)): Path<(SessionId, ParticipantId)>,
) -> ApiResult<MtaInbox> {
    Ok(Json(state.coordinator.mta_inbox(&id, &participant)?))
}

async fn submit_delta(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(req): Json<SignedRequest<DeltaShare>>,
) -> ApiResult<SubmitOutcome> {
    state.coordinator.authorize(&req, "submit_delta", &id)?;
    Ok(Json(state.coordinator.submit_delta(
        &id,
        &req.participant_id,
        req.body,
    )?))
}

async fn submit_signature_share(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(req): Json<SignedRequest<SignatureShare>>,
) -> ApiResult<SubmitOutcome> {
    state.coordinator.authorize(&req, "submit_signature_share", &id)?;
    Ok(Json(state.coordinator.submit_signature_share(
        &id,
        &req.participant_id,
        req.body,
    )?))
}

async fn abort_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    body: Option<Json<AbortRequest>>,
) -> ApiResult<SessionView> {
    let reason = abort_reason(body);
    Ok(Json(state.coordinator.abort_session(&id, &reason)?))
}

fn abort_reason(body: Option<Json<AbortRequest>>) -> String {
    body.and_then(|Json(r)| r.reason)
        .unwrap_or_else(|| "aborted by operator".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tecdsa_core::auth::DeviceKey;
    use tower::ServiceExt;

    fn app() -> Router {
        let coordinator = Coordinator::new(CoordinatorConfig::default()).unwrap();
        router(Arc::new(AppState { coordinator }))
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(
            app(),
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_ceremony_is_404() {
        let uri = format!("/v1/ceremonies/{}", uuid::Uuid::new_v4());
        let (status, body) = call(app(), Request::builder().uri(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "CeremonyNotFound");
    }

    #[tokio::test]
    async fn test_dkg_needs_enrolled_devices() {
        let (status, body) = call(app(), post_json("/v1/ceremonies", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "NotInitialized");
    }

    #[tokio::test]
    async fn test_undersized_paillier_key_is_refused() {
        let key = DeviceKey::random();
        let request = serde_json::json!({
            "identity": {
                "participant_id": "device_1",
                "verifying_key": hex::encode(key.verifying_key()),
                "channel_key": hex::encode([5u8; 32]),
                "mta_key": { "n": "0b", "h1": "03", "h2": "05" }
            }
        });
        let (status, body) = call(app(), post_json("/v1/devices", request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidRequest");
    }

    #[tokio::test]
    async fn test_unenrolled_submission_is_403() {
        let share = DeltaShare {
            delta: tecdsa_core::types::scalar_reduce(&[1u8; 32]),
        };
        let session = uuid::Uuid::new_v4();
        let signed = DeviceKey::random()
            .sign("device_7", "submit_delta", &session.to_string(), share)
            .unwrap();
        let uri = format!("/v1/sessions/{}/deltas", session);
        let (status, body) = call(app(), post_json(&uri, serde_json::to_value(&signed).unwrap())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "UnauthorizedParticipant");
        assert_eq!(body["kind"], "authorization");
    }

    #[test]
    fn test_signing_request_hash() {
        let by_hash = StartSigningRequest {
            message_hash: Some(format!("0x{}", "ab".repeat(32))),
            message: None,
            digest: MessageDigest::default(),
            signers: None,
        };
        assert_eq!(by_hash.hash().unwrap(), [0xab; 32]);

        let by_message = StartSigningRequest {
            message_hash: None,
            message: Some("hello".into()),
            digest: MessageDigest::Sha256,
            signers: None,
        };
        assert_eq!(
            by_message.hash().unwrap(),
            MessageDigest::Sha256.digest(b"hello")
        );

        let short = StartSigningRequest {
            message_hash: Some("abcd".into()),
            message: None,
            digest: MessageDigest::default(),
            signers: None,
        };
        assert!(short.hash().is_err());
    }
}
