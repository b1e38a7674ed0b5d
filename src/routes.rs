use std::sync::Arc;

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::analytics;
use crate::auth::{Auth, Role};
use crate::config::SiteConfig;
use crate::error::ApiError;
use crate::identity::{Identity, KnownIdentity};
use crate::models::*;
use crate::rate_limit::RateLimiterFacade;
use crate::repo::{
    AnalyticsRepo, CategoryQuery, CategoryRepo, PollRepo, QuestionQuery, QuestionRepo, Repo, RepoError, VoteFilter,
    VoteQuery, VoteRepo,
};
use crate::require_role;
use crate::voting::{self, CategoryOverview, QuizSummary};

pub const LATEST_POLLS: usize = 5;
pub const EXPORT_FILENAME: &str = "thisorthat_analytics.csv";
const NO_CHOICE: &str = "You didn't select a choice.";

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/vote/{question_id}").route(web::post().to(vote)))
        .service(web::resource("/this-or-that/vote/{question_id}").route(web::post().to(vote)))
        .service(web::resource("/this-or-that").route(web::get().to(home)))
        .service(web::resource("/this-or-that/{category_id}").route(web::get().to(play)))
        .service(web::resource("/quiz-summary/{category_id}").route(web::get().to(quiz_summary)))
        .service(web::resource("/analytics").route(web::get().to(analytics_dashboard)))
        .service(web::resource("/analytics/update").route(web::post().to(analytics_update)))
        .service(web::resource("/analytics/export").route(web::get().to(analytics_export)))
        .service(web::resource("/polls").route(web::get().to(list_polls)))
        .service(web::resource("/polls/{id}").route(web::get().to(poll_detail)))
        .service(web::resource("/polls/{id}/results").route(web::get().to(poll_results)))
        .service(web::resource("/polls/{id}/vote").route(web::post().to(vote_poll)))
        .service(
            web::scope("/api/v1/admin")
                .service(web::resource("").route(web::get().to(admin_site)))
                .service(
                    web::resource("/categories")
                        .route(web::get().to(admin_list_categories))
                        .route(web::post().to(admin_create_category)),
                )
                .service(
                    web::resource("/categories/{id}")
                        .route(web::get().to(admin_get_category))
                        .route(web::patch().to(admin_update_category))
                        .route(web::delete().to(admin_delete_category)),
                )
                .service(
                    web::resource("/questions")
                        .route(web::get().to(admin_list_questions))
                        .route(web::post().to(admin_create_question)),
                )
                .service(
                    web::resource("/questions/{id}")
                        .route(web::get().to(admin_get_question))
                        .route(web::patch().to(admin_update_question))
                        .route(web::delete().to(admin_delete_question)),
                )
                .service(web::resource("/votes").route(web::get().to(admin_list_votes)))
                .service(
                    web::resource("/polls")
                        .route(web::get().to(admin_list_polls))
                        .route(web::post().to(admin_create_poll)),
                )
                .service(web::resource("/polls/{id}").route(web::delete().to(admin_delete_poll))),
        );
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub site: SiteConfig,
    pub rate_limiter: Option<RateLimiterFacade>,
}

impl AppState {
    pub fn new(repo: Arc<dyn Repo>) -> Self {
        Self { repo, site: SiteConfig::default(), rate_limiter: None }
    }
}

fn client_addr(req: &HttpRequest) -> Option<String> {
    req.peer_addr().map(|a| a.ip().to_string())
}

// ---------------- This or That -------------------------------------

#[utoipa::path(
    post,
    path = "/vote/{question_id}",
    params(("question_id" = Id, Path, description = "Question id")),
    request_body(content = String, description = "JSON object whose `choice` is \"A\" or \"B\"", content_type = "application/json"),
    responses(
        (status = 200, description = "Vote recorded", body = VoteResults),
        (status = 400, description = "Invalid choice or malformed body"),
        (status = 404, description = "Question not found or inactive"),
        (status = 429, description = "Too many votes from this address")
    )
)]
pub async fn vote(
    req: HttpRequest,
    identity: Identity,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let ip_address = client_addr(&req);
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow_vote(ip_address.as_deref().unwrap_or("unknown")) {
            return Err(ApiError::TooManyRequests);
        }
    }
    let meta = VoteMeta {
        user_agent: req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        ip_address,
    };
    let results = voting::record_vote_body(data.repo.as_ref(), path.into_inner(), &identity, &body, meta).await?;
    Ok(HttpResponse::Ok().json(results))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HomePage {
    pub site_title: String,
    pub categories: Vec<CategoryOverview>,
}

#[utoipa::path(
    get,
    path = "/this-or-that",
    responses((status = 200, description = "Active categories with counts", body = HomePage))
)]
pub async fn home(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let categories = voting::category_overview(data.repo.as_ref()).await?;
    Ok(HttpResponse::Ok().json(HomePage { site_title: data.site.site_title.clone(), categories }))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PlayQuery {
    /// `1` forgets the caller's votes in this category first.
    pub reset: Option<String>,
}

#[utoipa::path(
    get,
    path = "/this-or-that/{category_id}",
    params(("category_id" = Id, Path, description = "Category id"), PlayQuery),
    responses(
        (status = 200, description = "Next unanswered question, or `{\"status\": \"complete\"}`"),
        (status = 404, description = "Category not found or inactive")
    )
)]
pub async fn play(
    known: KnownIdentity,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    query: web::Query<PlayQuery>,
) -> Result<HttpResponse, ApiError> {
    let category_id = path.into_inner();
    let identity = known.0;
    if query.reset.as_deref() == Some("1") {
        if let Some(id) = &identity {
            voting::reset_progress(data.repo.as_ref(), category_id, id).await?;
        }
    }
    let next = voting::next_question(data.repo.as_ref(), category_id, identity.as_ref()).await?;
    Ok(HttpResponse::Ok().json(next))
}

#[utoipa::path(
    get,
    path = "/quiz-summary/{category_id}",
    params(("category_id" = Id, Path, description = "Category id")),
    responses(
        (status = 200, description = "Per-question results", body = QuizSummary),
        (status = 404, description = "Category not found or inactive")
    )
)]
pub async fn quiz_summary(known: KnownIdentity, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let summary = voting::quiz_summary(data.repo.as_ref(), path.into_inner(), known.0.as_ref()).await?;
    Ok(HttpResponse::Ok().json(summary))
}

// ---------------- Analytics (staff) --------------------------------

#[utoipa::path(
    get,
    path = "/analytics",
    responses(
        (status = 200, description = "Dashboard", body = analytics::Dashboard),
        (status = 401, description = "Missing or invalid token"),
        (status = 403, description = "Staff only")
    )
)]
pub async fn analytics_dashboard(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Staff | Role::Admin);
    let dashboard = analytics::dashboard(data.repo.as_ref(), Utc::now()).await?;
    Ok(HttpResponse::Ok().json(dashboard))
}

/// Accepts both `7` and `"7"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Param {
    Int(i64),
    Text(String),
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ChartRefresh {
    /// Days, 1 to 365. Defaults to 30.
    #[serde(default)]
    #[schema(value_type = Option<i64>)]
    pub time_period: Option<Param>,
    /// `"all"` or a category id.
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub category: Option<Param>,
}

impl ChartRefresh {
    fn time_period(&self) -> Result<i64, ApiError> {
        match &self.time_period {
            None => Ok(analytics::DEFAULT_WINDOW_DAYS),
            Some(Param::Int(n)) => Ok(*n),
            Some(Param::Text(s)) => s.trim().parse().map_err(|_| ApiError::BadRequest("invalid time_period".into())),
        }
    }

    fn category(&self) -> Result<Option<Id>, ApiError> {
        match &self.category {
            None => Ok(None),
            Some(Param::Int(id)) => Ok(Some(*id)),
            Some(Param::Text(s)) if s == "all" => Ok(None),
            Some(Param::Text(s)) => s.trim().parse().map(Some).map_err(|_| ApiError::BadRequest("invalid category".into())),
        }
    }
}

#[utoipa::path(
    post,
    path = "/analytics/update",
    request_body = ChartRefresh,
    responses(
        (status = 200, description = "Recomputed chart series", body = analytics::ChartData),
        (status = 400, description = "Bad time period or category"),
        (status = 403, description = "Staff only")
    )
)]
pub async fn analytics_update(auth: Auth, data: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Staff | Role::Admin);
    let params: ChartRefresh = serde_json::from_slice(&body).map_err(|_| ApiError::BadRequest("Invalid JSON".into()))?;
    let charts = analytics::refresh(data.repo.as_ref(), Utc::now(), params.time_period()?, params.category()?).await?;
    Ok(HttpResponse::Ok().json(charts))
}

#[utoipa::path(
    get,
    path = "/analytics/export",
    responses(
        (status = 200, description = "CSV attachment", content_type = "text/csv"),
        (status = 403, description = "Staff only")
    )
)]
pub async fn analytics_export(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Staff | Role::Admin);
    let bytes = analytics::export_csv(data.repo.as_ref()).await?;
    Ok(HttpResponse::Ok()
        .content_type("text/csv")
        .insert_header((header::CONTENT_DISPOSITION, format!("attachment; filename=\"{EXPORT_FILENAME}\"")))
        .body(bytes))
}

// ---------------- Legacy polls --------------------------------------

#[utoipa::path(
    get,
    path = "/polls",
    responses((status = 200, description = "Latest published polls", body = [Poll]))
)]
pub async fn list_polls(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let polls = data.repo.latest_polls(Utc::now(), LATEST_POLLS).await?;
    Ok(HttpResponse::Ok().json(polls))
}

#[utoipa::path(
    get,
    path = "/polls/{id}",
    params(("id" = Id, Path, description = "Poll id")),
    responses(
        (status = 200, description = "Poll with choices", body = PollDetail),
        (status = 404, description = "Unknown or not yet published")
    )
)]
pub async fn poll_detail(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let detail = data.repo.get_poll(path.into_inner()).await?;
    if !detail.poll.is_published(Utc::now()) {
        return Err(ApiError::NotFound);
    }
    Ok(HttpResponse::Ok().json(detail))
}

#[utoipa::path(
    get,
    path = "/polls/{id}/results",
    params(("id" = Id, Path, description = "Poll id")),
    responses((status = 200, description = "Poll results", body = PollDetail), (status = 404, description = "Unknown poll"))
)]
pub async fn poll_results(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let detail = data.repo.get_poll(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(detail))
}

#[derive(Debug, Deserialize)]
pub struct PollVoteForm {
    pub choice: Id,
}

#[utoipa::path(
    post,
    path = "/polls/{id}/vote",
    params(("id" = Id, Path, description = "Poll id")),
    responses(
        (status = 303, description = "Redirect to the results page"),
        (status = 400, description = "No valid choice selected"),
        (status = 404, description = "Unknown poll")
    )
)]
pub async fn vote_poll(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    form: Option<web::Form<PollVoteForm>>,
) -> Result<HttpResponse, ApiError> {
    let poll_id = path.into_inner();
    data.repo.get_poll(poll_id).await?;
    let Some(form) = form else { return Err(ApiError::BadRequest(NO_CHOICE.into())) };
    match data.repo.vote_poll_choice(poll_id, form.choice).await {
        Ok(_) => Ok(HttpResponse::SeeOther()
            .insert_header((header::LOCATION, format!("/polls/{poll_id}/results")))
            .finish()),
        Err(RepoError::NotFound) => Err(ApiError::BadRequest(NO_CHOICE.into())),
        Err(e) => Err(e.into()),
    }
}

// ---------------- Admin API -----------------------------------------

macro_rules! ensure_staff { ($auth:expr) => { require_role!($auth, Role::Staff | Role::Admin) }; }

#[utoipa::path(
    get,
    path = "/api/v1/admin",
    responses((status = 200, description = "Admin site branding", body = SiteConfig), (status = 403, description = "Staff only"))
)]
pub async fn admin_site(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    Ok(HttpResponse::Ok().json(&data.site))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AdminCategory {
    #[serde(flatten)]
    pub category: Category,
    pub label: String,
    pub question_count: usize,
    pub vote_count: i64,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CategoryFilter {
    pub active: Option<bool>,
    /// Words matched in name or description.
    pub search: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/categories",
    params(CategoryFilter),
    responses((status = 200, description = "Categories with counts", body = [AdminCategory]), (status = 403, description = "Staff only"))
)]
pub async fn admin_list_categories(
    auth: Auth,
    data: web::Data<AppState>,
    query: web::Query<CategoryFilter>,
) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    let query = query.into_inner();
    let categories = data.repo.list_categories(&CategoryQuery { active: query.active, search: query.search }).await?;
    let questions = data.repo.list_questions(&QuestionQuery::default()).await?;
    let mut out = Vec::with_capacity(categories.len());
    for category in categories {
        let question_count = questions.iter().filter(|q| q.category_id == category.id).count();
        let vote_count = data.repo.count_votes(VoteFilter { since: None, category_id: Some(category.id) }).await?;
        out.push(AdminCategory { label: category.label(), category, question_count, vote_count });
    }
    Ok(HttpResponse::Ok().json(out))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/categories",
    request_body = NewCategory,
    responses((status = 201, description = "Category created", body = Category), (status = 400, description = "Empty name"))
)]
pub async fn admin_create_category(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewCategory>) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    let payload = payload.into_inner();
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".into()));
    }
    let category = data.repo.create_category(payload).await?;
    Ok(HttpResponse::Created().json(category))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/categories/{id}",
    params(("id" = Id, Path, description = "Category id")),
    responses((status = 200, description = "Category", body = Category), (status = 404, description = "Not found"))
)]
pub async fn admin_get_category(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    Ok(HttpResponse::Ok().json(data.repo.get_category(path.into_inner()).await?))
}

#[utoipa::path(
    patch,
    path = "/api/v1/admin/categories/{id}",
    params(("id" = Id, Path, description = "Category id")),
    request_body = UpdateCategory,
    responses((status = 200, description = "Category updated", body = Category), (status = 404, description = "Not found"))
)]
pub async fn admin_update_category(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdateCategory>,
) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    let category = data.repo.update_category(path.into_inner(), payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(category))
}

#[utoipa::path(
    delete,
    path = "/api/v1/admin/categories/{id}",
    params(("id" = Id, Path, description = "Category id")),
    responses((status = 204, description = "Deleted with its questions and votes"), (status = 404, description = "Not found"))
)]
pub async fn admin_delete_category(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    data.repo.delete_category(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct QuestionFilter {
    pub category: Option<Id>,
    pub active: Option<bool>,
    pub featured: Option<bool>,
    /// Words matched in either option.
    pub search: Option<String>,
}

impl From<QuestionFilter> for QuestionQuery {
    fn from(f: QuestionFilter) -> Self {
        QuestionQuery { category_id: f.category, active: f.active, featured: f.featured, search: f.search }
    }
}

/// A question with its current standing.
#[derive(Debug, Serialize, ToSchema)]
pub struct AdminQuestion {
    #[serde(flatten)]
    pub question: Question,
    pub title: String,
    pub results: VoteResults,
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/questions",
    params(QuestionFilter),
    responses((status = 200, description = "Questions with their results", body = [AdminQuestion]))
)]
pub async fn admin_list_questions(auth: Auth, data: web::Data<AppState>, query: web::Query<QuestionFilter>) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    let questions = data.repo.list_questions(&query.into_inner().into()).await?;
    let out: Vec<AdminQuestion> = questions
        .into_iter()
        .map(|question| AdminQuestion { title: question.title(), results: question.tally().results(), question })
        .collect();
    Ok(HttpResponse::Ok().json(out))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/questions",
    request_body = NewQuestion,
    responses((status = 201, description = "Question created", body = Question), (status = 404, description = "Unknown category"))
)]
pub async fn admin_create_question(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewQuestion>) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    let payload = payload.into_inner();
    if payload.option_a.trim().is_empty() || payload.option_b.trim().is_empty() {
        return Err(ApiError::BadRequest("both options are required".into()));
    }
    let question = data.repo.create_question(payload).await?;
    Ok(HttpResponse::Created().json(question))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/questions/{id}",
    params(("id" = Id, Path, description = "Question id")),
    responses((status = 200, description = "Question", body = Question), (status = 404, description = "Not found"))
)]
pub async fn admin_get_question(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    Ok(HttpResponse::Ok().json(data.repo.get_question(path.into_inner()).await?))
}

#[utoipa::path(
    patch,
    path = "/api/v1/admin/questions/{id}",
    params(("id" = Id, Path, description = "Question id")),
    request_body = UpdateQuestion,
    responses((status = 200, description = "Question updated", body = Question), (status = 404, description = "Not found"))
)]
pub async fn admin_update_question(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdateQuestion>,
) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    let question = data.repo.update_question(path.into_inner(), payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(question))
}

#[utoipa::path(
    delete,
    path = "/api/v1/admin/questions/{id}",
    params(("id" = Id, Path, description = "Question id")),
    responses((status = 204, description = "Deleted with its votes"), (status = 404, description = "Not found"))
)]
pub async fn admin_delete_question(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    data.repo.delete_question(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct VoteListFilter {
    pub question: Option<Id>,
    pub category: Option<Id>,
    /// `A` or `B`.
    #[param(value_type = Option<String>)]
    pub choice: Option<VoteChoice>,
    /// Words matched in the voter's user subject or the question's options.
    pub search: Option<String>,
}

impl From<VoteListFilter> for VoteQuery {
    fn from(f: VoteListFilter) -> Self {
        VoteQuery { question_id: f.question, category_id: f.category, choice: f.choice, search: f.search }
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/votes",
    params(VoteListFilter),
    responses((status = 200, description = "Recorded votes", body = [Vote]))
)]
pub async fn admin_list_votes(auth: Auth, data: web::Data<AppState>, query: web::Query<VoteListFilter>) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    let votes = data.repo.list_votes(&query.into_inner().into()).await?;
    Ok(HttpResponse::Ok().json(votes))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AdminPoll {
    #[serde(flatten)]
    pub poll: Poll,
    pub was_published_recently: bool,
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/polls",
    responses((status = 200, description = "Every poll, scheduled ones included", body = [AdminPoll]))
)]
pub async fn admin_list_polls(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    let now = Utc::now();
    let polls: Vec<AdminPoll> = data
        .repo
        .list_polls()
        .await?
        .into_iter()
        .map(|poll| AdminPoll { was_published_recently: poll.was_published_recently(now), poll })
        .collect();
    Ok(HttpResponse::Ok().json(polls))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/polls",
    request_body = NewPoll,
    responses((status = 201, description = "Poll created with its choices", body = PollDetail))
)]
pub async fn admin_create_poll(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewPoll>) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    let payload = payload.into_inner();
    if payload.question_text.trim().is_empty() {
        return Err(ApiError::BadRequest("question_text must not be empty".into()));
    }
    let poll = data.repo.create_poll(payload).await?;
    Ok(HttpResponse::Created().json(poll))
}

#[utoipa::path(
    delete,
    path = "/api/v1/admin/polls/{id}",
    params(("id" = Id, Path, description = "Poll id")),
    responses((status = 204, description = "Poll deleted"), (status = 404, description = "Not found"))
)]
pub async fn admin_delete_poll(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    ensure_staff!(auth);
    data.repo.delete_poll(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}
