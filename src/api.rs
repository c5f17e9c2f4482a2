use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;
use uuid::Uuid;

use crate::auth::{AuthedUser, auth_middleware, ensure_profile};
use crate::config::Config;
use crate::error::{ApiErrorWithMeta, StoreError};
use crate::responses::{ApiOk, Pagination, RequestMeta, meta_middleware};
use crate::store::Store;
use crate::transfers::TransferOutcome;
use crate::types::{
    CreditRequest, CreditTransaction, PaymentMethod, Plan, PlanWithAvailability, Profile,
    Purchase, WalletVoucher,
};

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// Handle over the backing store and its change feed.
    pub store: Store,
    /// The application configuration.
    pub config: Config,
}

#[derive(Deserialize)]
pub struct CreatePlanRequest {
    pub duration_label: String,
    pub price: i64,
}

#[derive(Deserialize)]
pub struct UpdatePlanRequest {
    pub duration_label: Option<String>,
    pub price: Option<i64>,
}

#[derive(Deserialize)]
pub struct ImportVouchersRequest {
    pub codes: Vec<String>,
}

#[derive(Serialize)]
pub struct ImportVouchersResponse {
    pub submitted: usize,
    pub inserted: u64,
    pub skipped: u64,
}

#[derive(Deserialize)]
pub struct AssignVouchersRequest {
    pub client_id: Uuid,
    pub quantity: i64,
}

#[derive(Serialize)]
pub struct AssignVouchersResponse {
    pub voucher_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
pub struct CreatePurchaseRequest {
    pub plan_id: Uuid,
    pub quantity: i32,
    pub payment_method: PaymentMethod,
}

#[derive(Deserialize)]
pub struct CreateCreditRequest {
    pub amount: i64,
}

/// The response for a client's balance.
#[derive(Serialize)]
pub struct BalanceResponse {
    pub client_id: Uuid,
    pub balance: i64,
}

#[derive(Serialize)]
pub struct AvailabilityResponse {
    pub plan_id: Uuid,
    pub available: i64,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IssueTokenRequest {
    Credit,
    Vouchers { vouchers: Vec<Uuid> },
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Deserialize)]
pub struct RedeemRequest {
    pub token: String,
    pub amount: Option<i64>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    /// Admin-only filter; ignored for clients, who always see their own rows.
    pub client_id: Option<Uuid>,
}

impl ListQuery {
    fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    fn per_page(&self) -> u32 {
        self.per_page.unwrap_or(20).clamp(1, 100)
    }
}

pub fn init_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/profile", get(profile_handler))
        .route("/plans", get(list_plans_handler).post(create_plan_handler))
        .route("/plans/{id}", put(update_plan_handler).delete(delete_plan_handler))
        .route("/plans/{id}/vouchers", post(import_vouchers_handler))
        .route("/plans/{id}/availability", get(availability_handler))
        .route("/plans/{id}/assign", post(assign_vouchers_handler))
        .route("/wallet", get(wallet_handler))
        .route(
            "/purchases",
            get(list_purchases_handler).post(create_purchase_handler),
        )
        .route("/purchases/{id}", delete(delete_purchase_handler))
        .route("/purchases/{id}/approve", post(approve_purchase_handler))
        .route("/purchases/{id}/reject", post(reject_purchase_handler))
        .route("/purchases/{id}/cancel", post(cancel_purchase_handler))
        .route("/credits/balance", get(balance_handler))
        .route("/credits/transactions", get(list_transactions_handler))
        .route(
            "/credits/requests",
            get(list_credit_requests_handler).post(create_credit_request_handler),
        )
        .route(
            "/credits/requests/{id}/approve",
            post(approve_credit_request_handler),
        )
        .route(
            "/credits/requests/{id}/reject",
            post(reject_credit_request_handler),
        )
        .route("/transfers/tokens", post(issue_token_handler))
        .route("/transfers/redeem", post(redeem_handler))
        .route("/events/{table}", get(events_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(authed)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn profile_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<Profile>, ApiErrorWithMeta> {
    let profile = ensure_profile(&st.store, user.id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("profile fetched", profile, meta))
}

async fn list_plans_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<PlanWithAvailability>>, ApiErrorWithMeta> {
    let plans = st
        .store
        .list_plans()
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("plans fetched", plans, meta))
}

async fn create_plan_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<CreatePlanRequest>,
) -> Result<ApiOk<Plan>, ApiErrorWithMeta> {
    user.require_admin().map_err(|e| e.with_meta(meta.clone()))?;
    let plan = st
        .store
        .create_plan(&req.duration_label, req.price)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created("plan created", plan, meta))
}

async fn update_plan_handler(
    State(st): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<UpdatePlanRequest>,
) -> Result<ApiOk<Plan>, ApiErrorWithMeta> {
    user.require_admin().map_err(|e| e.with_meta(meta.clone()))?;
    let plan = st
        .store
        .update_plan(plan_id, req.duration_label.as_deref(), req.price)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("plan updated", plan, meta))
}

async fn delete_plan_handler(
    State(st): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<serde_json::Value>, ApiErrorWithMeta> {
    user.require_admin().map_err(|e| e.with_meta(meta.clone()))?;
    st.store
        .delete_plan(plan_id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok(
        "plan deleted",
        serde_json::json!({ "deleted": plan_id }),
        meta,
    ))
}

async fn import_vouchers_handler(
    State(st): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<ImportVouchersRequest>,
) -> Result<ApiOk<ImportVouchersResponse>, ApiErrorWithMeta> {
    user.require_admin().map_err(|e| e.with_meta(meta.clone()))?;
    let submitted = req.codes.len();
    let inserted = st
        .store
        .bulk_import_vouchers(plan_id, &req.codes)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created(
        "vouchers imported",
        ImportVouchersResponse {
            submitted,
            inserted,
            skipped: submitted as u64 - inserted,
        },
        meta,
    ))
}

async fn availability_handler(
    State(st): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<AvailabilityResponse>, ApiErrorWithMeta> {
    let available = st
        .store
        .available_count(plan_id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok(
        "availability fetched",
        AvailabilityResponse { plan_id, available },
        meta,
    ))
}

async fn assign_vouchers_handler(
    State(st): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<AssignVouchersRequest>,
) -> Result<ApiOk<AssignVouchersResponse>, ApiErrorWithMeta> {
    user.require_admin().map_err(|e| e.with_meta(meta.clone()))?;
    let voucher_ids = st
        .store
        .assign_vouchers(plan_id, req.client_id, req.quantity)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created(
        "vouchers assigned",
        AssignVouchersResponse { voucher_ids },
        meta,
    ))
}

async fn wallet_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<Vec<WalletVoucher>>, ApiErrorWithMeta> {
    let wallet = st
        .store
        .wallet(user.id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("wallet fetched", wallet, meta))
}

async fn create_purchase_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<CreatePurchaseRequest>,
) -> Result<ApiOk<Purchase>, ApiErrorWithMeta> {
    let purchase = st
        .store
        .create_purchase(user.id, req.plan_id, req.quantity, req.payment_method)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created("purchase created", purchase, meta))
}

async fn list_purchases_handler(
    State(st): State<AppState>,
    Query(query): Query<ListQuery>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<Vec<Purchase>>, ApiErrorWithMeta> {
    let filter = if user.is_admin() {
        query.client_id
    } else {
        Some(user.id)
    };
    let (purchases, total) = st
        .store
        .list_purchases(filter, query.page(), query.per_page())
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("purchases fetched", purchases, meta)
        .paginated(Pagination::new(query.page(), query.per_page(), total)))
}

async fn approve_purchase_handler(
    State(st): State<AppState>,
    Path(purchase_id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<Purchase>, ApiErrorWithMeta> {
    user.require_admin().map_err(|e| e.with_meta(meta.clone()))?;
    let purchase = st
        .store
        .approve_purchase(purchase_id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("purchase approved", purchase, meta))
}

async fn reject_purchase_handler(
    State(st): State<AppState>,
    Path(purchase_id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<Purchase>, ApiErrorWithMeta> {
    user.require_admin().map_err(|e| e.with_meta(meta.clone()))?;
    let purchase = st
        .store
        .reject_purchase(purchase_id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("purchase rejected", purchase, meta))
}

async fn cancel_purchase_handler(
    State(st): State<AppState>,
    Path(purchase_id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<Purchase>, ApiErrorWithMeta> {
    let purchase = st
        .store
        .cancel_purchase(purchase_id, user.id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("purchase cancelled", purchase, meta))
}

async fn delete_purchase_handler(
    State(st): State<AppState>,
    Path(purchase_id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<serde_json::Value>, ApiErrorWithMeta> {
    user.require_admin().map_err(|e| e.with_meta(meta.clone()))?;
    st.store
        .delete_purchase(purchase_id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok(
        "purchase deleted",
        serde_json::json!({ "deleted": purchase_id }),
        meta,
    ))
}

async fn balance_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<BalanceResponse>, ApiErrorWithMeta> {
    let balance = st
        .store
        .balance(user.id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok(
        "balance fetched",
        BalanceResponse {
            client_id: user.id,
            balance,
        },
        meta,
    ))
}

async fn list_transactions_handler(
    State(st): State<AppState>,
    Query(query): Query<ListQuery>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<Vec<CreditTransaction>>, ApiErrorWithMeta> {
    let client_id = if user.is_admin() {
        query.client_id.unwrap_or(user.id)
    } else {
        user.id
    };
    let (transactions, total) = st
        .store
        .list_transactions(client_id, query.page(), query.per_page())
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("transactions fetched", transactions, meta)
        .paginated(Pagination::new(query.page(), query.per_page(), total)))
}

async fn create_credit_request_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<CreateCreditRequest>,
) -> Result<ApiOk<CreditRequest>, ApiErrorWithMeta> {
    let request = st
        .store
        .create_credit_request(user.id, req.amount)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created("top-up requested", request, meta))
}

async fn list_credit_requests_handler(
    State(st): State<AppState>,
    Query(query): Query<ListQuery>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<Vec<CreditRequest>>, ApiErrorWithMeta> {
    let filter = if user.is_admin() {
        query.client_id
    } else {
        Some(user.id)
    };
    let requests = st
        .store
        .list_credit_requests(filter)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("top-up requests fetched", requests, meta))
}

async fn approve_credit_request_handler(
    State(st): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<CreditRequest>, ApiErrorWithMeta> {
    user.require_admin().map_err(|e| e.with_meta(meta.clone()))?;
    let request = st
        .store
        .approve_credit_request(request_id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("top-up approved", request, meta))
}

async fn reject_credit_request_handler(
    State(st): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
) -> Result<ApiOk<CreditRequest>, ApiErrorWithMeta> {
    user.require_admin().map_err(|e| e.with_meta(meta.clone()))?;
    let request = st
        .store
        .reject_credit_request(request_id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("top-up rejected", request, meta))
}

async fn issue_token_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<ApiOk<TokenResponse>, ApiErrorWithMeta> {
    let token = match req {
        IssueTokenRequest::Credit => st.store.issue_credit_token(user.id),
        IssueTokenRequest::Vouchers { vouchers } => st
            .store
            .issue_voucher_token(user.id, &vouchers)
            .await
            .map_err(|e| e.with_meta(meta.clone()))?,
    };
    Ok(ApiOk::created(
        "transfer token issued",
        TokenResponse {
            token: token.encode(),
        },
        meta,
    ))
}

async fn redeem_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<RedeemRequest>,
) -> Result<ApiOk<TransferOutcome>, ApiErrorWithMeta> {
    let outcome = st
        .store
        .redeem_transfer(user.id, &req.token, req.amount)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("transfer applied", outcome, meta))
}

async fn events_handler(
    State(st): State<AppState>,
    Path(table): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiErrorWithMeta> {
    let rx = st.store.feed.subscribe(&table).ok_or_else(|| {
        StoreError::Validation(format!("unknown table: {table}")).with_meta(meta.clone())
    })?;

    let stream = BroadcastStream::new(rx)
        .filter_map(|result| result.ok())
        .map(|event| Event::default().event("change").json_data(&event));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
