use ladder_core::config::LoadOptions;
use ladder_db::DemoSeedDataset;

use crate::commands::{load_config, migrated_pool, runtime, CommandResult, StepError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedAction {
    /// Load the demo dataset, then verify it.
    Load,
    /// Only verify an existing load.
    Verify,
    /// Remove the demo institution and everything under it.
    Clean,
}

pub fn run(options: LoadOptions, action: SeedAction) -> CommandResult {
    let config = match load_config("seed", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("seed") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let pool = match migrated_pool(&config).await {
            Ok(pool) => pool,
            Err((error_class, message, exit_code)) => {
                return CommandResult::failure("seed", error_class, message, exit_code);
            }
        };

        let result = match action {
            SeedAction::Load => load_and_verify(&pool).await,
            SeedAction::Verify => verify(&pool).await,
            SeedAction::Clean => DemoSeedDataset::clean(&pool)
                .await
                .map(|()| CommandResult::success("seed", "demo dataset removed"))
                .map_err(|error| ("seed_clean", error.to_string(), 5u8)),
        };
        pool.close().await;

        result.unwrap_or_else(|(error_class, message, exit_code)| {
            CommandResult::failure("seed", error_class, message, exit_code)
        })
    })
}

async fn load_and_verify(pool: &ladder_db::DbPool) -> Result<CommandResult, StepError> {
    let seeded = DemoSeedDataset::load(pool)
        .await
        .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;
    verify(pool).await?;

    let documents = seeded
        .documents_seeded
        .iter()
        .map(|doc| format!("  - {} ({}): {}", doc.document_id, doc.entity_type, doc.description))
        .collect::<Vec<_>>();
    let message = format!(
        "demo dataset loaded for institution `{}`:\n{}",
        seeded.institution_id,
        documents.join("\n")
    );
    Ok(CommandResult::success_with_data("seed", message, &seeded))
}

async fn verify(pool: &ladder_db::DbPool) -> Result<CommandResult, StepError> {
    let verification = DemoSeedDataset::verify(pool)
        .await
        .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

    if !verification.all_present {
        let failed = verification
            .checks
            .iter()
            .filter_map(|(check, passed)| (!passed).then_some(*check))
            .collect::<Vec<_>>();
        return Err(("seed_verification", failed_checks_message(&failed), 6u8));
    }
    Ok(CommandResult::success_with_data("seed", "demo dataset verified", &verification))
}

fn failed_checks_message(failed: &[&str]) -> String {
    if failed.is_empty() {
        "some seed data failed to load".to_string()
    } else {
        format!("seed verification failed for checks: {}", failed.join(", "))
    }
}
