use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpResponse, HttpServer, Responder};
use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use tot::config::AppConfig;
use tot::openapi::ApiDoc;
use tot::rate_limit::RateLimiterFacade;
use tot::repo::Repo;
use tot::{config, AppState, SessionCookies};

async fn metrics(handle: web::Data<PrometheusHandle>) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(handle.render())
}

#[cfg(feature = "postgres-store")]
async fn postgres_repo(url: &str) -> anyhow::Result<Arc<dyn Repo>> {
    use sqlx::postgres::PgPoolOptions;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_lazy(url)
        .context("invalid DATABASE_URL")?;
    sqlx::migrate!("./migrations").run(&pool).await.context("running migrations")?;
    info!("Using Postgres repository backend");
    Ok(Arc::new(tot::repo::pg::PgRepo::new(pool)))
}

#[cfg(not(feature = "postgres-store"))]
async fn postgres_repo(_url: &str) -> anyhow::Result<Arc<dyn Repo>> {
    anyhow::bail!("DATABASE_URL is set but this build has no postgres-store feature")
}

#[cfg(feature = "inmem-store")]
fn fallback_repo() -> anyhow::Result<Arc<dyn Repo>> {
    info!("Using in-memory repository backend");
    Ok(Arc::new(tot::repo::inmem::InMemRepo::new()))
}

#[cfg(not(feature = "inmem-store"))]
fn fallback_repo() -> anyhow::Result<Arc<dyn Repo>> {
    anyhow::bail!("DATABASE_URL must be set when the inmem-store feature is disabled")
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds to reduce manual setup overhead.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = AppConfig::from_env()?;
    info!("Bootstrapping This or That server");
    info!("Frontend URL: {}", cfg.frontend_url.as_deref().unwrap_or("(none)"));

    let repo = match &cfg.database_url {
        Some(url) => postgres_repo(url).await?,
        None => fallback_repo()?,
    };

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("installing metrics recorder")?;

    let openapi = ApiDoc::openapi();
    info!("OpenAPI spec generated");

    let state = AppState {
        repo,
        site: cfg.site.clone(),
        rate_limiter: Some(RateLimiterFacade::from_config(cfg.rate_limit.clone())),
    };
    let frontend = cfg.frontend_url.clone();
    let cookie_secure = cfg.cookie_secure;

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                // local React/Vite dev servers
                .allowed_origin("http://localhost:5173")
                .allowed_origin("http://127.0.0.1:5173")
                .allow_any_header()
                .allowed_methods(["GET", "POST", "PATCH", "DELETE", "OPTIONS"])
                .supports_credentials()
                .max_age(3600);
            if let Some(front) = &frontend {
                c = c.allowed_origin(front);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(SessionCookies::default().with_secure(cookie_secure))
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .app_data(web::Data::new(prometheus.clone()))
            .configure(config)
            .route("/metrics", web::get().to(metrics))
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind((cfg.bind_addr.as_str(), cfg.port))?;

    info!("Listening on http://{}:{}", cfg.bind_addr, cfg.port);

    server.run().await?;
    Ok(())
}
