use signoff_core::domain::request::RequestId;
use signoff_server::bootstrap::bootstrap_with_config;

use crate::commands::{prepare, CommandResult};

pub fn run(request_id: &str) -> CommandResult {
    let (config, runtime) = match prepare("verify-ledger") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let request_id = RequestId(request_id.trim().to_string());
    let result = runtime.block_on(async {
        let app = bootstrap_with_config(config)
            .await
            .map_err(|error| ("bootstrap", error.to_string(), 4u8))?;
        let verification = app
            .service
            .verify_ledger(&request_id)
            .await
            .map_err(|error| ("persistence", error.to_string(), 5u8));
        app.db_pool.close().await;
        verification
    });

    match result {
        Ok(verification) if verification.valid => CommandResult::success(
            "verify-ledger",
            format!(
                "ledger for {} is intact: {} entries, head {}",
                verification.request_id.0,
                verification.verified_entries,
                verification.latest_hash.as_deref().unwrap_or("<none>")
            ),
        ),
        Ok(verification) => CommandResult::failure(
            "verify-ledger",
            "ledger_invalid",
            format!(
                "ledger for {} failed after {} verified entries: {}",
                verification.request_id.0,
                verification.verified_entries,
                verification.failure_reason.as_deref().unwrap_or("unknown reason")
            ),
            6,
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("verify-ledger", error_class, message, exit_code)
        }
    }
}
