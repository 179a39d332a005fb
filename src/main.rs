//! Process entry point: reads configuration, wires the repository/policy
//! store/coordinator together, runs startup tasks, and serves the HTTP
//! surface. `anyhow` is used only at this boundary; everything below it
//! returns a typed [`didwebvh_registrar::CoreError`].

use std::sync::Arc;

use didwebvh_registrar::config::Settings;
use didwebvh_registrar::http::{router, AppState};
use didwebvh_registrar::policy::{KnownWitnessRegistry, Policy, PolicyStore};
use didwebvh_registrar::repository::{InMemoryRepository, SharedRepository, SqlxRepository};
use didwebvh_registrar::tasks::TaskManager;
use didwebvh_registrar::MutationCoordinator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env();
    tracing::info!(domain = %settings.domain, database = %settings.database_url, "starting didwebvh-registrar");

    let repository: SharedRepository = if settings.database_url.starts_with("sqlite://")
        && settings.database_url != "sqlite://app.db"
        || settings.database_url.starts_with("postgresql://")
    {
        Arc::new(SqlxRepository::connect(&settings.database_url).await?)
    } else {
        tracing::warn!("no external database configured, using in-memory repository");
        Arc::new(InMemoryRepository::new())
    };

    let policy_store = Arc::new(PolicyStore::new(Policy::default(), KnownWitnessRegistry::default()));

    let policy_task = TaskManager::new(repository.clone());
    policy_task.set_policies(&settings, &policy_store).await?;
    let witness_task = TaskManager::new(repository.clone());
    witness_task.register_initial_witness(&settings, &policy_store).await?;

    let coordinator = Arc::new(MutationCoordinator::new(
        repository.clone(),
        policy_store.clone(),
        settings.domain.clone(),
    ));

    let state = AppState {
        coordinator,
        repository,
        policy_store,
        settings: Arc::new(settings.clone()),
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&settings.listen_address).await?;
    tracing::info!(address = %settings.listen_address, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
