#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use searchjobs::search::{
    RepositoryRevSpecs, RepositoryRevision, SearchContext, SearchQuery, Searcher, SearcherError,
};
use searchjobs::{CsvWriter, ExhaustiveSearchOptions, ExhaustiveSearchStore};
use searchjobs_migrations::migrate;
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use tokio::sync::OnceCell;
use tokio::task::LocalSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const TEST_SCHEMA: &str = "searchjobs";

#[derive(Clone, Debug)]
pub struct TestDatabase {
    pub source_pool: PgPool,
    pub test_pool: PgPool,
    pub name: String,
}

impl TestDatabase {
    async fn drop(&self) {
        self.test_pool.close().await;
        sqlx::query(&format!("DROP DATABASE {} WITH (FORCE)", self.name))
            .execute(&self.source_pool)
            .await
            .expect("Failed to drop test database");
    }

    pub fn create_runtime_options(&self) -> ExhaustiveSearchOptions {
        ExhaustiveSearchOptions::default()
            .pg_pool(self.test_pool.clone())
            .schema(TEST_SCHEMA)
            .num_handlers(2)
            .poll_interval(Duration::from_millis(50))
            .heartbeat_interval(Duration::from_millis(200))
            .shutdown_grace_period(Duration::from_millis(200))
            .listen_os_shutdown_signals(false)
    }

    /// Migrated store over the test database, without any worker.
    pub async fn create_store(&self) -> ExhaustiveSearchStore {
        migrate(&self.test_pool, TEST_SCHEMA)
            .await
            .expect("Failed to migrate test database");
        ExhaustiveSearchStore::new(self.test_pool.clone(), TEST_SCHEMA)
    }

    pub async fn count_rows(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("select count(*) from {TEST_SCHEMA}.{table}"))
            .fetch_one(&self.test_pool)
            .await
            .expect("Failed to count rows")
    }

    pub async fn states(&self, table: &str) -> Vec<String> {
        sqlx::query_scalar(&format!(
            "select state from {TEST_SCHEMA}.{table} order by id asc"
        ))
        .fetch_all(&self.test_pool)
        .await
        .expect("Failed to get states")
    }
}

pub async fn create_test_database() -> TestDatabase {
    let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let mut pg_conn_options: PgConnectOptions =
        db_url.parse().expect("Failed to parse DATABASE_URL");
    pg_conn_options = pg_conn_options.application_name("__test_searchjobs");
    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect_with(pg_conn_options.clone())
        .await
        .expect("Failed to connect to database");

    let db_id = uuid::Uuid::now_v7();
    let db_name = format!("__test_searchjobs_{}", db_id.simple());

    sqlx::query(&format!("CREATE DATABASE {}", db_name))
        .execute(&pg_pool)
        .await
        .expect("Failed to create test database");

    let test_options = pg_conn_options.database(&db_name);
    let test_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect_with(test_options)
        .await
        .expect("Failed to connect to test database");

    TestDatabase {
        source_pool: pg_pool,
        test_pool,
        name: db_name,
    }
}

pub async fn with_test_db<F, Fut>(test_fn: F)
where
    F: FnOnce(TestDatabase) -> Fut + 'static,
    Fut: std::future::Future<Output = ()>,
{
    let local_set = LocalSet::new();

    local_set
        .run_until(async move {
            let test_db = create_test_database().await;
            let test_db_2 = test_db.clone();

            let result = tokio::task::spawn_local(async move {
                test_fn(test_db_2).await;
            })
            .await;

            test_db.drop().await;
            result.expect("Test failed");
        })
        .await;
}

pub async fn enable_logs() {
    static ONCE: OnceCell<()> = OnceCell::const_new();

    ONCE.get_or_init(|| async {
        let fmt_layer = tracing_subscriber::fmt::layer();
        // Log level set to debug except for sqlx set at warn (to not show all sql requests)
        let filter_layer = EnvFilter::try_new("debug,sqlx=warn").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    })
    .await;
}

/// Searcher over queries of the form `"1@rev1 1@rev2 2@rev3"`.
///
/// Every repository becomes one rev spec joining its revisions with `:`, resolving
/// splits it again, and searching a revision writes a single row.
#[derive(Clone, Debug, Default)]
pub struct FakeSearcher {
    pub fail_resolve_repo: Option<i32>,
    pub fail_search_revision: Option<String>,
    /// Delay of every search call
    pub search_delay: Option<Duration>,
    /// Sit out the whole delay even once the context was canceled
    pub ignore_cancellation: bool,
    pub new_search_calls: Arc<AtomicUsize>,
}

impl FakeSearcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_search_calls(&self) -> usize {
        self.new_search_calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FakeQuery {
    rev_specs: Vec<RepositoryRevSpecs>,
    fail_resolve_repo: Option<i32>,
    fail_search_revision: Option<String>,
    search_delay: Option<Duration>,
    ignore_cancellation: bool,
}

impl Searcher for FakeSearcher {
    type Query = FakeQuery;

    async fn new_search(
        &self,
        _ctx: &SearchContext,
        query: &str,
    ) -> Result<FakeQuery, SearcherError> {
        self.new_search_calls.fetch_add(1, Ordering::SeqCst);

        let mut rev_specs: Vec<RepositoryRevSpecs> = Vec::new();
        for token in query.split_whitespace() {
            let (repo, rev) = token
                .split_once('@')
                .ok_or_else(|| SearcherError::SearchCreation(format!("invalid token '{token}'")))?;
            let repo_id: i32 = repo
                .parse()
                .map_err(|_| SearcherError::SearchCreation(format!("invalid repo '{repo}'")))?;

            match rev_specs.iter_mut().find(|s| s.repo_id == repo_id) {
                Some(spec) => {
                    spec.ref_spec.push(':');
                    spec.ref_spec.push_str(rev);
                }
                None => rev_specs.push(RepositoryRevSpecs {
                    repo_id,
                    ref_spec: rev.to_string(),
                }),
            }
        }

        if rev_specs.is_empty() {
            return Err(SearcherError::SearchCreation("empty query".into()));
        }

        Ok(FakeQuery {
            rev_specs,
            fail_resolve_repo: self.fail_resolve_repo,
            fail_search_revision: self.fail_search_revision.clone(),
            search_delay: self.search_delay,
            ignore_cancellation: self.ignore_cancellation,
        })
    }
}

impl SearchQuery for FakeQuery {
    fn repository_rev_specs<'a>(
        &'a self,
        _ctx: &'a SearchContext,
    ) -> BoxStream<'a, Result<RepositoryRevSpecs, SearcherError>> {
        stream::iter(self.rev_specs.iter().cloned().map(Ok)).boxed()
    }

    async fn resolve_repository_rev_spec(
        &self,
        _ctx: &SearchContext,
        rev_specs: &RepositoryRevSpecs,
    ) -> Result<Vec<RepositoryRevision>, SearcherError> {
        if self.fail_resolve_repo == Some(rev_specs.repo_id) {
            return Err(SearcherError::Resolve {
                repo_id: rev_specs.repo_id,
                ref_spec: rev_specs.ref_spec.clone(),
                message: "unknown revision".into(),
            });
        }

        Ok(rev_specs
            .ref_spec
            .split(':')
            .map(|revision| RepositoryRevision {
                repo_id: rev_specs.repo_id,
                ref_spec: rev_specs.ref_spec.clone(),
                revision: revision.to_string(),
            })
            .collect())
    }

    async fn search<W: CsvWriter>(
        &self,
        ctx: &SearchContext,
        revision: &RepositoryRevision,
        writer: &mut W,
    ) -> Result<(), SearcherError> {
        if let Some(delay) = self.search_delay.filter(|_| self.ignore_cancellation) {
            tokio::time::sleep(delay).await;
        } else if let Some(delay) = self.search_delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = ctx.cancellation().cancelled() => return Err(SearcherError::Canceled),
            }
        }
        if self.fail_search_revision.as_deref() == Some(revision.revision.as_str()) {
            return Err(SearcherError::Search(format!("search of {revision} failed")));
        }

        writer.write_header(&["repo", "revision"]).await?;
        writer
            .write_row(&[&revision.repo_id.to_string(), &revision.revision])
            .await?;
        Ok(())
    }
}
