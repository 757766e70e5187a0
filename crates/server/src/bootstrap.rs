use std::sync::Arc;

use signoff_core::approvals::{
    ApprovalService, DirectoryError, IdentityDirectory, InMemoryIdentityDirectory,
};
use signoff_core::clock::{Clock, SystemClock};
use signoff_core::config::{AppConfig, ConfigError, LoadOptions};
use signoff_core::notifications::TracingNotificationSink;
use signoff_core::scheduler::{SchedulerSettings, TimeoutScheduler};
use signoff_core::workflows::WorkflowCatalog;
use signoff_db::{
    connect_with_settings, migrations, DbPool, SqlApprovalStore, SqlTimerStore, SqlWorkflowStore,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::identity::HttpIdentityDirectory;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub catalog: Arc<WorkflowCatalog>,
    pub service: Arc<ApprovalService>,
    pub scheduler: Arc<TimeoutScheduler>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("identity directory setup failed: {0}")]
    Identity(#[source] DirectoryError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let directory = identity_directory(&config)?;
    let application = assemble(config, db_pool, directory);
    Ok(application)
}

/// Wires the engine over an already migrated pool.
pub fn assemble(
    config: AppConfig,
    db_pool: DbPool,
    directory: Arc<dyn IdentityDirectory>,
) -> Application {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let workflows = Arc::new(SqlWorkflowStore::new(db_pool.clone()));
    let approvals = Arc::new(SqlApprovalStore::new(db_pool.clone()));
    let timers = Arc::new(SqlTimerStore::new(db_pool.clone()));

    let service = Arc::new(ApprovalService::new(
        workflows.clone(),
        approvals,
        timers.clone(),
        directory,
        Arc::new(TracingNotificationSink),
        clock.clone(),
    ));
    let scheduler = Arc::new(TimeoutScheduler::new(
        service.clone(),
        timers,
        clock.clone(),
        SchedulerSettings::from(&config.scheduler),
    ));
    let catalog = Arc::new(WorkflowCatalog::new(workflows, clock));

    Application { config, db_pool, catalog, service, scheduler }
}

fn identity_directory(config: &AppConfig) -> Result<Arc<dyn IdentityDirectory>, BootstrapError> {
    match HttpIdentityDirectory::from_config(&config.identity).map_err(BootstrapError::Identity)? {
        Some(directory) => {
            info!(
                event_name = "system.bootstrap.identity_configured",
                correlation_id = "bootstrap",
                authenticated = config.identity.api_token.is_some(),
                "identity directory configured"
            );
            Ok(Arc::new(directory))
        }
        None => {
            warn!(
                event_name = "system.bootstrap.identity_missing",
                correlation_id = "bootstrap",
                "identity.base_url is not set; role-based steps will need administrator delegation"
            );
            Ok(Arc::new(InMemoryIdentityDirectory::default()))
        }
    }
}

#[cfg(test)]
mod tests {
    use signoff_core::approvals::Actor;
    use signoff_core::config::{ConfigOverrides, LoadOptions};
    use signoff_core::domain::workflow::StepTemplate;
    use signoff_core::workflows::WorkflowDraft;

    use crate::bootstrap::bootstrap;

    fn overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_invalid_identity_url() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                identity_base_url: Some("ldap://directory.internal".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("identity.base_url"));
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_wires_the_engine() {
        let app = bootstrap(overrides("sqlite::memory:")).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('workflow_definition', 'approval_request', 'approval_step', 'approval_action', 'approval_timer')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema");
        assert_eq!(table_count, 5);

        let admin = Actor::admin("tenant-a", "admin@example.com");
        let workflow = app
            .catalog
            .save(
                &admin,
                WorkflowDraft {
                    id: None,
                    name: "Contract review".to_string(),
                    description: None,
                    trigger_entity_type: "contract".to_string(),
                    steps: vec![StepTemplate::users(1, "Legal", &["legal@example.com"])],
                    require_all_approvers: false,
                    allow_parallel_approval: false,
                    auto_approve_if_creator_is_approver: false,
                    is_active: None,
                },
            )
            .await
            .expect("save workflow");
        assert_eq!(app.catalog.list(&admin, false).await.expect("list")[0].id, workflow.id);

        app.db_pool.close().await;
    }
}
