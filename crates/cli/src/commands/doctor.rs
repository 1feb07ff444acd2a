use anyhow::{bail, Context};
use ladder_core::config::{AppConfig, LoadOptions};
use ladder_db::{connect_with_settings, migrations, DbPool};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub details: String,
}

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub overall_status: CheckStatus,
    pub summary: String,
    pub checks: Vec<DoctorCheck>,
}

const DATABASE_CHECKS: [&str; 3] =
    ["database_connectivity", "schema_migrations", "approval_documents"];

pub fn run(options: LoadOptions, json_output: bool) -> (CheckStatus, String) {
    let report = build_report(options);
    let overall = report.overall_status;

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return (overall, output);
    }

    (overall, render_human(&report))
}

pub fn build_report(options: LoadOptions) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(options) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_notifications(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in std::iter::once("notification_channel").chain(DATABASE_CHECKS) {
                checks.push(skipped(name, "configuration did not load"));
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_notifications(config: &AppConfig) -> DoctorCheck {
    let details = match &config.notifications.webhook_url {
        Some(url) => format!(
            "webhook delivery to {} (timeout {}s, bearer token {})",
            host_of(url),
            config.notifications.timeout_secs,
            if config.notifications.webhook_token.is_some() { "set" } else { "unset" },
        ),
        None => "no webhook configured; notifications are logged only".to_string(),
    };
    DoctorCheck { name: "notification_channel", status: CheckStatus::Pass, details }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            let details = format!("failed to initialize async runtime: {error}");
            return DATABASE_CHECKS
                .iter()
                .map(|&name| DoctorCheck { name, status: CheckStatus::Fail, details: details.clone() })
                .collect();
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    skipped("schema_migrations", "database is unreachable"),
                    skipped("approval_documents", "database is unreachable"),
                ];
            }
        };

        let mut checks = vec![DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        }];
        checks.push(outcome("schema_migrations", schema_status(&pool).await));
        checks.push(outcome("approval_documents", document_status(&pool).await));
        pool.close().await;
        checks
    })
}

async fn schema_status(pool: &DbPool) -> anyhow::Result<String> {
    let applied =
        migrations::applied_versions(pool).await.context("failed to read migration history")?;
    let known = migrations::known_migrations();
    if applied.len() < known {
        bail!("{} of {known} migrations applied; run `ladder migrate`", applied.len());
    }
    Ok(format!("{known} migrations applied"))
}

async fn document_status(pool: &DbPool) -> anyhow::Result<String> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT entity_type, COUNT(1) FROM approval_document WHERE active = 1 GROUP BY entity_type
         ORDER BY entity_type",
    )
    .fetch_all(pool)
    .await
    .context("failed to read approval documents")?;

    if rows.is_empty() {
        bail!("no active approval documents; every initiation would be refused");
    }
    let types = rows.iter().map(|(entity_type, _)| entity_type.as_str()).collect::<Vec<_>>();
    Ok(format!("active documents for: {}", types.join(", ")))
}

fn outcome(name: &'static str, result: anyhow::Result<String>) -> DoctorCheck {
    match result {
        Ok(details) => DoctorCheck { name, status: CheckStatus::Pass, details },
        Err(error) => DoctorCheck { name, status: CheckStatus::Fail, details: format!("{error:#}") },
    }
}

fn skipped(name: &'static str, reason: &str) -> DoctorCheck {
    DoctorCheck { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let rest = rest.split_once('@').map_or(rest, |(_, host)| host);
    rest.split(['/', '?']).next().unwrap_or(rest)
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
