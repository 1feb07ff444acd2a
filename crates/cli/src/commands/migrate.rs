use ladder_core::config::LoadOptions;
use ladder_db::migrations;
use serde::Serialize;

use crate::commands::{load_config, migrated_pool, runtime, CommandResult};

#[derive(Debug, Serialize)]
struct MigrateOutput {
    applied_versions: Vec<i64>,
    known_migrations: usize,
}

pub fn run(options: LoadOptions) -> CommandResult {
    let config = match load_config("migrate", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("migrate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = migrated_pool(&config).await?;
        let applied_versions = migrations::applied_versions(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(MigrateOutput {
            applied_versions,
            known_migrations: migrations::known_migrations(),
        })
    });

    match result {
        Ok(output) => CommandResult::success_with_data(
            "migrate",
            format!("schema at {} of {} migrations", output.applied_versions.len(), output.known_migrations),
            &output,
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}
