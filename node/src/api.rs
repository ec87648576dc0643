//! # REST API
//!
//! Builds the axum router that exposes the escrow engine over HTTP. All
//! endpoints share application state through axum's `State` extractor.
//! Callers identify themselves in the request body (`actor_id`,
//! `buyer_id`, ...); authentication happens in front of this service.
//!
//! ## Endpoints
//!
//! | Method | Path                                         | Description                    |
//! |--------|----------------------------------------------|--------------------------------|
//! | GET    | `/health`                                    | Liveness check                 |
//! | GET    | `/fees/quote`                                | Fee and verification tier      |
//! | POST   | `/transactions`                              | Create an escrow               |
//! | GET    | `/transactions/:id`                          | Transaction by id              |
//! | POST   | `/transactions/:id/fund`                     | Confirm the buyer's payment    |
//! | POST   | `/transactions/:id/deliver`                  | Seller marks delivery          |
//! | POST   | `/transactions/:id/confirm`                  | Buyer confirms, funds released |
//! | POST   | `/transactions/:id/cancel`                   | Cancel before delivery         |
//! | POST   | `/transactions/:id/verify`                   | Record a party's verification  |
//! | POST   | `/transactions/:id/milestones`               | Attach a milestone plan        |
//! | POST   | `/transactions/:id/milestones/:seq/start`    | Seller starts a milestone      |
//! | POST   | `/transactions/:id/milestones/:seq/complete` | Seller completes a milestone   |
//! | POST   | `/transactions/:id/milestones/:seq/approve`  | Buyer approves and pays it     |
//! | POST   | `/transactions/:id/disputes`                 | Open a dispute                 |
//! | GET    | `/disputes/:id`                              | Dispute by id                  |
//! | POST   | `/disputes/:id/evidence`                     | Submit evidence                |
//! | POST   | `/disputes/:id/messages`                     | Post a message                 |
//! | POST   | `/disputes/:id/mediation`                    | Request a mediator             |
//! | POST   | `/disputes/:id/assign`                       | Assign a specific mediator     |
//! | POST   | `/disputes/:id/resolve`                      | Mediator rules                 |
//! | POST   | `/disputes/:id/withdraw`                     | Initiator withdraws            |
//! | GET    | `/reputation/:user`                          | Reputation record              |
//! | POST   | `/payouts/run`                               | Run a seller payout            |
//! | POST   | `/sweep`                                     | Enforce deadlines now          |

use axum::{
    extract::{Path, Query, Request, State},
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use escrow_engine::dispute::{Dispute, EvidenceInput, OpenDisputeRequest, ResolutionOutcome};
use escrow_engine::fees::{compute_fee, FeeQuote, TransactionType};
use escrow_engine::milestone::MilestoneSpec;
use escrow_engine::payout::{PayoutOutcome, PayoutPeriod};
use escrow_engine::reputation::ReputationRecord;
use escrow_engine::transaction::{
    CreateTransactionRequest, DeliveryInfo, RatingData, Transaction,
};
use escrow_engine::verification::{required_tier, VerificationMethod, VerificationTier};
use escrow_engine::{EscrowEngine, EscrowError, EscrowResult, SweepReport};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone; everything sits behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    pub engine: Arc<EscrowEngine>,
    /// Reference to Prometheus metrics for in-handler recording.
    pub metrics: SharedMetrics,
}

impl AppState {
    /// Counts a committed transition, or a gateway failure.
    fn observe<T>(&self, kind: &str, result: EscrowResult<T>) -> Result<T, ApiError> {
        match result {
            Ok(value) => {
                self.metrics.record_transition(kind);
                Ok(value)
            }
            Err(err) => {
                if matches!(err, EscrowError::Gateway(_)) {
                    self.metrics.gateway_failures_total.inc();
                }
                Err(ApiError(err))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/fees/quote", get(fee_quote_handler))
        .route("/transactions", post(create_transaction_handler))
        .route("/transactions/:id", get(get_transaction_handler))
        .route("/transactions/:id/fund", post(fund_handler))
        .route("/transactions/:id/deliver", post(deliver_handler))
        .route("/transactions/:id/confirm", post(confirm_handler))
        .route("/transactions/:id/cancel", post(cancel_handler))
        .route("/transactions/:id/verify", post(verify_handler))
        .route("/transactions/:id/milestones", post(milestone_plan_handler))
        .route(
            "/transactions/:id/milestones/:seq/start",
            post(start_milestone_handler),
        )
        .route(
            "/transactions/:id/milestones/:seq/complete",
            post(complete_milestone_handler),
        )
        .route(
            "/transactions/:id/milestones/:seq/approve",
            post(approve_milestone_handler),
        )
        .route("/transactions/:id/disputes", post(open_dispute_handler))
        .route("/disputes/:id", get(get_dispute_handler))
        .route("/disputes/:id/evidence", post(evidence_handler))
        .route("/disputes/:id/messages", post(message_handler))
        .route("/disputes/:id/mediation", post(mediation_handler))
        .route("/disputes/:id/assign", post(assign_handler))
        .route("/disputes/:id/resolve", post(resolve_handler))
        .route("/disputes/:id/withdraw", post(withdraw_handler))
        .route("/reputation/:user", get(reputation_handler))
        .route("/payouts/run", post(payout_handler))
        .route("/sweep", post(sweep_handler))
        .layer(middleware::from_fn_with_state(state.clone(), track_latency))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn track_latency(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let response = next.run(request).await;
    state
        .metrics
        .request_latency_seconds
        .observe(started.elapsed().as_secs_f64());
    response
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error body returned by every endpoint on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Whether the same request may succeed if sent again.
    pub retryable: bool,
}

/// An engine error on its way to becoming an HTTP response.
#[derive(Debug)]
pub struct ApiError(EscrowError);

impl From<EscrowError> for ApiError {
    fn from(err: EscrowError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn bad_input(field: &str, reason: impl Into<String>) -> Self {
        ApiError(EscrowError::Validation {
            field: field.to_string(),
            reason: reason.into(),
        })
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            EscrowError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EscrowError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            EscrowError::InvalidState { .. }
            | EscrowError::DuplicateDispute { .. }
            | EscrowError::NoMediator { .. }
            | EscrowError::ConcurrentModification { .. } => StatusCode::CONFLICT,
            EscrowError::NotFound { .. } => StatusCode::NOT_FOUND,
            EscrowError::Gateway(_) => StatusCode::BAD_GATEWAY,
            EscrowError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "request rejected");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct FeeQuoteQuery {
    pub amount: u64,
    #[serde(default = "default_quote_type")]
    pub transaction_type: String,
    #[serde(default = "default_parties")]
    pub parties: u32,
}

fn default_quote_type() -> String {
    "other".to_string()
}

fn default_parties() -> u32 {
    2
}

/// Response payload for `GET /fees/quote`.
#[derive(Debug, Serialize, Deserialize)]
pub struct FeeQuoteResponse {
    pub amount: u64,
    pub transaction_type: TransactionType,
    #[serde(flatten)]
    pub quote: FeeQuote,
    pub seller_net: u64,
    pub verification_tier: VerificationTier,
}

/// Body for operations that only need to know who is calling.
#[derive(Debug, Deserialize)]
pub struct ActorBody {
    pub actor_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DeliverBody {
    pub seller_id: String,
    #[serde(default)]
    pub delivery: DeliveryInfo,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    pub buyer_id: String,
    #[serde(default)]
    pub rating: Option<RatingData>,
}

#[derive(Debug, Deserialize)]
pub struct FundBody {
    pub payment_method: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub actor_id: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub user_id: String,
    pub methods: Vec<VerificationMethod>,
}

#[derive(Debug, Deserialize)]
pub struct MilestonePlanBody {
    pub actor_id: String,
    pub milestones: Vec<MilestoneSpec>,
}

#[derive(Debug, Deserialize)]
pub struct EvidenceBody {
    pub submitted_by: String,
    pub evidence: EvidenceInput,
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    pub author_id: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct MediationBody {
    pub requested_by: String,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Deserialize)]
pub struct AssignBody {
    pub mediator_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub resolver_id: String,
    pub outcome: ResolutionOutcome,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Deserialize)]
pub struct PayoutBody {
    pub seller_id: String,
    pub period: String,
    /// Evaluation time; defaults to now.
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SweepBody {
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: returns 200 if the node is alive.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "version": state.version })),
    )
}

/// `GET /fees/quote?amount=..&transaction_type=..&parties=..`
async fn fee_quote_handler(Query(query): Query<FeeQuoteQuery>) -> ApiResult<FeeQuoteResponse> {
    if query.amount == 0 {
        return Err(ApiError::bad_input("amount", "must be greater than zero"));
    }
    let transaction_type = TransactionType::from_str_lossy(&query.transaction_type);
    let quote = compute_fee(query.amount, &transaction_type, query.parties);
    Ok(Json(FeeQuoteResponse {
        amount: query.amount,
        seller_net: query.amount.saturating_sub(quote.fee),
        transaction_type,
        quote,
        verification_tier: required_tier(query.amount),
    }))
}

async fn create_transaction_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateTransactionRequest>,
) -> Result<(StatusCode, Json<Transaction>), ApiError> {
    let tx = state.observe("create", state.engine.create_transaction(req).await)?;
    state.metrics.transactions_created_total.inc();
    Ok((StatusCode::CREATED, Json(tx)))
}

async fn get_transaction_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Transaction> {
    Ok(Json(state.engine.get_transaction(&id)?))
}

async fn fund_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<FundBody>,
) -> ApiResult<Transaction> {
    let result = state.engine.fund_transaction(&id, &body.payment_method).await;
    let tx = state.observe("fund", result)?;
    Ok(Json(tx))
}

async fn deliver_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<DeliverBody>,
) -> ApiResult<Transaction> {
    let result = state
        .engine
        .mark_delivered(&id, &body.seller_id, body.delivery)
        .await;
    Ok(Json(state.observe("deliver", result)?))
}

async fn confirm_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<ConfirmBody>,
) -> ApiResult<Transaction> {
    let result = state
        .engine
        .confirm_delivery(&id, &body.buyer_id, body.rating)
        .await;
    Ok(Json(state.observe("confirm", result)?))
}

async fn cancel_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<CancelBody>,
) -> ApiResult<Transaction> {
    let result = state
        .engine
        .cancel_transaction(&id, &body.actor_id, &body.reason)
        .await;
    Ok(Json(state.observe("cancel", result)?))
}

async fn verify_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<VerifyBody>,
) -> ApiResult<Transaction> {
    let result = state
        .engine
        .verify_party(&id, &body.user_id, &body.methods)
        .await;
    Ok(Json(state.observe("verify", result)?))
}

async fn milestone_plan_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<MilestonePlanBody>,
) -> ApiResult<Transaction> {
    let result = state
        .engine
        .create_milestone_plan(&id, &body.actor_id, body.milestones)
        .await;
    Ok(Json(state.observe("milestone_plan", result)?))
}

async fn start_milestone_handler(
    Path((id, seq)): Path<(String, u32)>,
    State(state): State<AppState>,
    Json(body): Json<ActorBody>,
) -> ApiResult<Transaction> {
    let result = state.engine.start_milestone(&id, &body.actor_id, seq).await;
    Ok(Json(state.observe("milestone_start", result)?))
}

async fn complete_milestone_handler(
    Path((id, seq)): Path<(String, u32)>,
    State(state): State<AppState>,
    Json(body): Json<ActorBody>,
) -> ApiResult<Transaction> {
    let result = state
        .engine
        .complete_milestone(&id, &body.actor_id, seq)
        .await;
    Ok(Json(state.observe("milestone_complete", result)?))
}

async fn approve_milestone_handler(
    Path((id, seq)): Path<(String, u32)>,
    State(state): State<AppState>,
    Json(body): Json<ActorBody>,
) -> ApiResult<Transaction> {
    let result = state
        .engine
        .approve_milestone(&id, &body.actor_id, seq)
        .await;
    Ok(Json(state.observe("milestone_approve", result)?))
}

async fn open_dispute_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<OpenDisputeRequest>,
) -> Result<(StatusCode, Json<Dispute>), ApiError> {
    let dispute = state.observe("dispute_open", state.engine.open_dispute(&id, req).await)?;
    state.metrics.disputes_opened_total.inc();
    Ok((StatusCode::CREATED, Json(dispute)))
}

async fn get_dispute_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Dispute> {
    Ok(Json(state.engine.get_dispute(&id)?))
}

async fn evidence_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<EvidenceBody>,
) -> ApiResult<Dispute> {
    let result = state
        .engine
        .submit_evidence(&id, &body.submitted_by, body.evidence)
        .await;
    Ok(Json(state.observe("dispute_evidence", result)?))
}

async fn message_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<MessageBody>,
) -> ApiResult<Dispute> {
    let result = state
        .engine
        .post_dispute_message(&id, &body.author_id, &body.body)
        .await;
    Ok(Json(state.observe("dispute_message", result)?))
}

async fn mediation_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<MediationBody>,
) -> ApiResult<Dispute> {
    let result = state
        .engine
        .request_mediation(&id, &body.requested_by, &body.note)
        .await;
    Ok(Json(state.observe("dispute_mediation", result)?))
}

async fn assign_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<AssignBody>,
) -> ApiResult<Dispute> {
    let result = state.engine.assign_mediator(&id, &body.mediator_id).await;
    Ok(Json(state.observe("dispute_assign", result)?))
}

async fn resolve_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<Transaction> {
    let result = state
        .engine
        .resolve_dispute(&id, &body.resolver_id, body.outcome, body.notes)
        .await;
    Ok(Json(state.observe("dispute_resolve", result)?))
}

async fn withdraw_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<ActorBody>,
) -> ApiResult<Transaction> {
    let result = state.engine.withdraw_dispute(&id, &body.actor_id).await;
    Ok(Json(state.observe("dispute_withdraw", result)?))
}

async fn reputation_handler(
    Path(user): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<ReputationRecord> {
    Ok(Json(state.engine.reputation().get(&user)?))
}

async fn payout_handler(
    State(state): State<AppState>,
    Json(body): Json<PayoutBody>,
) -> ApiResult<PayoutOutcome> {
    let period = PayoutPeriod::from_str_lossy(&body.period).ok_or_else(|| {
        ApiError::bad_input("period", format!("unknown payout period '{}'", body.period))
    })?;
    let now = body.now.unwrap_or_else(Utc::now);
    let outcome = state.observe(
        "payout",
        state.engine.run_payout(&body.seller_id, period, now).await,
    )?;
    if outcome.payout_processed {
        state.metrics.payouts_completed_total.inc();
    }
    Ok(Json(outcome))
}

async fn sweep_handler(
    State(state): State<AppState>,
    body: Option<Json<SweepBody>>,
) -> ApiResult<SweepReport> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let now = body.now.unwrap_or_else(Utc::now);
    let report = state.engine.sweep(now).await?;
    for _ in 0..report.actions() {
        state.metrics.record_transition("sweep");
    }
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
