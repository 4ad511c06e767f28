use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use common_metrics::{serve, setup_metrics_routes};
use envconfig::Envconfig;
use flywheel_dispatcher::config::Config;
use flywheel_dispatcher::context::AppContext;
use flywheel_dispatcher::dispatcher::dispatch_loop;
use health::HealthRegistry;
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::ready;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    worker_id: String,
}

async fn index(State(state): State<AppState>) -> String {
    format!("flywheel dispatcher {}", state.worker_id)
}

async fn status(
    State(state): State<AppState>,
) -> Result<Json<HashMap<String, flywheel_core::WorkTypeCounts>>, StatusCode> {
    match flywheel_core::histogram(&state.pool).await {
        Ok(counts) => Ok(Json(counts)),
        Err(queue_error) => {
            error!("failed to compute queue histogram: {}", queue_error);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub fn app(liveness: HealthRegistry, pool: PgPool, worker_id: String) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/_status", get(status))
        .with_state(AppState { pool, worker_id })
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("failed to load configuration from env");
    tracing_subscriber::fmt::init();

    let liveness = HealthRegistry::new("liveness");

    let (app_config, pool_config) = config.to_components();
    let bind = format!("{}:{}", app_config.host, app_config.port);

    info!(
        "Dispatcher starting with ID {:?}, listening at {}",
        app_config.worker_id, bind
    );

    let worker_liveness = liveness
        .register("dispatcher".to_string(), app_config.job_poll_interval * 4)
        .await;

    let context = AppContext::create(app_config.clone(), pool_config, worker_liveness)
        .await
        .expect("failed to create app context");

    let app = setup_metrics_routes(app(
        liveness,
        context.queue.pool().clone(),
        app_config.worker_id.clone(),
    ));

    let http_server = tokio::spawn(async move { serve(app, &bind).await });

    let dispatcher = tokio::spawn(dispatch_loop(context));

    tokio::select! {
        res = dispatcher => {
            error!("dispatch loop exited");
            if let Err(e) = res {
                error!("dispatcher failed with: {}", e)
            }
        }
        res = http_server => {
            error!("http server exited");
            if let Err(e) = res {
                error!("server failed with: {}", e)
            }
        }
    }

    info!("exiting");
}
