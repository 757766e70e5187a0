use signoff_core::clock::{Clock, SystemClock};
use signoff_server::bootstrap::bootstrap_with_config;

use crate::commands::{prepare, CommandResult};

/// One scheduler pass over due SLA deadlines, for cron-driven deployments.
pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("sweep") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let app = bootstrap_with_config(config)
            .await
            .map_err(|error| ("bootstrap", error.to_string(), 4u8))?;
        let report = app
            .scheduler
            .run_once(SystemClock.now())
            .await
            .map_err(|error| ("sweep", error.to_string(), 5u8));
        app.db_pool.close().await;
        report
    });

    match result {
        Ok(report) if report.failed > 0 => CommandResult::failure(
            "sweep",
            "timer_failure",
            format!(
                "{} due timer(s): {} auto-approved, {} stale, {} failed and will be retried",
                report.due, report.approved, report.skipped, report.failed
            ),
            6,
        ),
        Ok(report) => CommandResult::success(
            "sweep",
            format!(
                "{} due timer(s): {} auto-approved, {} stale",
                report.due, report.approved, report.skipped
            ),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("sweep", error_class, message, exit_code)
        }
    }
}
