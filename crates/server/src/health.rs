use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use ladder_db::{migrations, DbPool};
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub migrations: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let migrations = migrations_check(&state.db_pool).await;
    let ready = database.status == "ready" && migrations.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: format!("ladder-server {}", env!("CARGO_PKG_VERSION")),
        },
        database,
        migrations,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

async fn migrations_check(pool: &DbPool) -> HealthCheck {
    let known = migrations::known_migrations();
    match migrations::applied_versions(pool).await {
        Ok(applied) if applied.len() >= known => HealthCheck {
            status: "ready",
            detail: format!("{} of {known} migrations applied", applied.len()),
        },
        Ok(applied) => HealthCheck {
            status: "degraded",
            detail: format!("{} of {known} migrations applied", applied.len()),
        },
        Err(error) => HealthCheck {
            status: "degraded",
            detail: format!("migration history unavailable: {error}"),
        },
    }
}
