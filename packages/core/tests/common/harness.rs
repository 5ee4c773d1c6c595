//! Shared Postgres container for integration tests, reused across the test
//! binary's whole run. Grounded on the reference service's
//! `tests/common/harness.rs::SharedTestInfra` pattern (one `pgvector/pgvector`
//! container started once, migrations run once, a fresh pool per test).

use anyhow::{Context, Result};
use sqlx::PgPool;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::sync::OnceCell;

struct SharedInfra {
    db_url: String,
    _postgres: ContainerAsync<GenericImage>,
}

static SHARED_INFRA: OnceCell<SharedInfra> = OnceCell::const_new();

impl SharedInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = GenericImage::new("pgvector/pgvector", "pg16")
            .with_wait_for(WaitFor::message_on_stderr("database system is ready to accept connections"))
            .with_exposed_port(ContainerPort::Tcp(5432))
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_DB", "postgres")
            .start()
            .await
            .context("failed to start postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&db_url).await.context("failed to connect for migrations")?;
        sqlx::migrate!("../../migrations").run(&pool).await.context("failed to run migrations")?;
        pool.close().await;

        Ok(Self { db_url, _postgres: postgres })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA.get_or_init(|| async { Self::init().await.expect("failed to initialize shared test infra") }).await
    }
}

pub struct TestHarness {
    pub db_pool: PgPool,
}

impl TestHarness {
    pub async fn new() -> Self {
        let infra = SharedInfra::get().await;
        let db_pool = PgPool::connect(&infra.db_url).await.expect("failed to connect test pool");
        Self { db_pool }
    }
}
