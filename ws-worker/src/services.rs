//! Wiring of stores, queue and providers from [`Config`]

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};
use ws_metering::HttpMeteringProcessor;
use ws_orchestrator::db::{backup_database, create_pool, run_migrations};
use ws_orchestrator::{
    AesGcmCipher, CredentialCipher, Destroyer, Provisioner, SqlCredentialStore, WorkspaceStore,
};
use ws_provider::{CloudClient, ComputeProvider, MeshClient, MeshProvider};
use ws_queue::{JobQueue, MemorySubstrate, QueueSubstrate, RedisSubstrate};

use crate::config::Config;

/// Open the database, backing it up and applying migrations first.
pub async fn open_database(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db_path;
    info!("Database path: {}", db_path.display());

    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    run_migrations(&pool).await?;
    info!("Migrations complete");

    Ok(pool)
}

pub async fn connect_queue(config: &Config) -> Result<JobQueue> {
    let substrate: Arc<dyn QueueSubstrate> = match &config.redis_url {
        Some(url) => {
            let substrate = RedisSubstrate::connect(url)
                .await
                .context("Failed to connect to the queue broker")?;
            Arc::new(substrate)
        }
        None => {
            warn!("WS_REDIS_URL not set, jobs are kept in process memory");
            Arc::new(MemorySubstrate::new())
        }
    };

    Ok(JobQueue::new(substrate))
}

pub fn credential_store(config: &Config, pool: SqlitePool) -> Result<SqlCredentialStore> {
    let cipher = match &config.credential_key {
        Some(key) => {
            let cipher: Arc<dyn CredentialCipher> = Arc::new(
                AesGcmCipher::from_base64_key(key).context("Invalid WS_CREDENTIAL_KEY")?,
            );
            Some(cipher)
        }
        None => None,
    };

    Ok(SqlCredentialStore::new(pool, cipher))
}

pub struct Orchestrators {
    pub provisioner: Provisioner,
    pub destroyer: Destroyer,
}

/// Build both orchestrators against the configured provider APIs.
pub fn orchestrators(config: &Config, pool: SqlitePool) -> Result<Orchestrators> {
    let token = config
        .cloud_api_token
        .as_deref()
        .context("WS_CLOUD_API_TOKEN is required to run jobs")?;
    let mesh_key = config
        .mesh_api_key
        .as_deref()
        .context("WS_MESH_API_KEY is required to run jobs")?;

    let compute: Arc<dyn ComputeProvider> = Arc::new(
        CloudClient::new(&config.cloud_api_url, token)?.with_poll_policy(config.op_poll_policy()),
    );
    let mesh: Arc<dyn MeshProvider> = Arc::new(MeshClient::new(
        &config.mesh_api_url,
        &config.mesh_tailnet,
        mesh_key,
    )?);

    build_orchestrators(config, pool, compute, mesh)
}

/// Build both orchestrators against the given providers.
pub fn build_orchestrators(
    config: &Config,
    pool: SqlitePool,
    compute: Arc<dyn ComputeProvider>,
    mesh: Arc<dyn MeshProvider>,
) -> Result<Orchestrators> {
    let settings = config.provision_settings();
    let store = WorkspaceStore::new(pool.clone());
    let credentials = Arc::new(credential_store(config, pool)?);

    Ok(Orchestrators {
        provisioner: Provisioner::new(
            store.clone(),
            compute.clone(),
            mesh.clone(),
            credentials,
            settings.clone(),
        ),
        destroyer: Destroyer::new(store, compute, mesh, settings),
    })
}

pub fn metering_processor(config: &Config) -> Result<HttpMeteringProcessor> {
    let url = config
        .metering_url
        .as_deref()
        .context("WS_METERING_URL is required to sync usage")?;
    let api_key = config
        .metering_api_key
        .as_deref()
        .context("WS_METERING_API_KEY is required to sync usage")?;

    Ok(HttpMeteringProcessor::new(url, api_key)?)
}
