//! Throwaway result stores for integration tests.
//!
//! Every [`TestDb`] is a freshly provisioned, migrated database on a server
//! shared by the whole test binary. The server is `LUMEN_TEST_PG_URL` when
//! set (a URL without a database path), otherwise a PostgreSQL container.
//! Without either, [`TestDb::create`] returns `None` and the test skips.

use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use lumen_db::config::DbConfig;
use lumen_db::pool::{self, Provision};

pub const SERVER_URL_VAR: &str = "LUMEN_TEST_PG_URL";

enum Server {
    External(String),
    Container {
        url: String,
        _container: ContainerAsync<Postgres>,
    },
}

impl Server {
    fn url(&self) -> &str {
        match self {
            Server::External(url) | Server::Container { url, .. } => url,
        }
    }
}

static SERVER: OnceCell<Option<Server>> = OnceCell::const_new();

async fn start_server() -> Option<Server> {
    if let Ok(url) = std::env::var(SERVER_URL_VAR) {
        return Some(Server::External(url.trim_end_matches('/').to_owned()));
    }
    let container = match Postgres::default().with_tag("16").start().await {
        Ok(container) => container,
        Err(e) => {
            eprintln!("no PostgreSQL available ({e}); skipping database test");
            return None;
        }
    };
    let host = container.get_host().await.ok()?;
    let port = container.get_host_port_ipv4(5432).await.ok()?;
    Some(Server::Container {
        url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _container: container,
    })
}

async fn server_url() -> Option<&'static str> {
    SERVER.get_or_init(start_server).await.as_ref().map(Server::url)
}

/// A migrated database that exists until [`TestDb::drop_db`].
pub struct TestDb {
    pub pool: PgPool,
    pub config: DbConfig,
}

impl TestDb {
    /// Provision a uniquely named database, or `None` without a server.
    pub async fn create() -> Option<Self> {
        let base = server_url().await?;
        let config = DbConfig::new(format!("{base}/lumen_test_{}", Uuid::new_v4().simple()));
        let pool = pool::open(&config, Provision::CreateMissing)
            .await
            .unwrap_or_else(|e| panic!("provisioning {} failed: {e:#}", config.database_url));
        Some(Self { pool, config })
    }

    /// Close the pool and drop the database.
    pub async fn drop_db(self) {
        self.pool.close().await;
        let Some(name) = self.config.database_name() else {
            return;
        };
        let Ok(maintenance) = PgPool::connect(&self.config.maintenance_url()).await else {
            return;
        };
        let _ = maintenance
            .execute(format!("DROP DATABASE IF EXISTS {name} WITH (FORCE)").as_str())
            .await;
        maintenance.close().await;
    }
}
