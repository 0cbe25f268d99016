//! Narrow interface to the search backend driving every pipeline stage.

use std::fmt;
use std::future::Future;

use futures::stream::BoxStream;
use getset::Getters;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::csv::{CsvError, CsvWriter};

/// The user on whose behalf a stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub uid: i32,
}

/// Authorization and cancellation context passed to every searcher call.
#[derive(Getters, Debug, Clone, Default)]
#[getset(get = "pub")]
pub struct SearchContext {
    actor: Option<Actor>,
    cancellation: CancellationToken,
}

impl SearchContext {
    pub fn new(cancellation: CancellationToken) -> Self {
        SearchContext {
            actor: None,
            cancellation,
        }
    }

    /// Returns a copy of this context acting as `user_id`.
    pub fn with_actor(&self, user_id: i32) -> Self {
        SearchContext {
            actor: Some(Actor { uid: user_id }),
            cancellation: self.cancellation.clone(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Fails with [`SearcherError::Canceled`] once the context was canceled.
    pub fn check_canceled(&self) -> Result<(), SearcherError> {
        if self.is_canceled() {
            return Err(SearcherError::Canceled);
        }
        Ok(())
    }
}

/// A repository and the unresolved revision specifier a search touches in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryRevSpecs {
    pub repo_id: i32,
    pub ref_spec: String,
}

/// One concrete revision resolved from a [`RepositoryRevSpecs`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryRevision {
    pub repo_id: i32,
    pub ref_spec: String,
    pub revision: String,
}

impl fmt::Display for RepositoryRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo_id, self.revision)
    }
}

#[derive(Error, Debug)]
pub enum SearcherError {
    /// The query could not be parsed or planned
    #[error("Failed to create search: {0}")]
    SearchCreation(String),

    /// The revision specifier could not be resolved to revisions
    #[error("Failed to resolve revision specifier '{ref_spec}' of repository {repo_id}: {message}")]
    Resolve {
        repo_id: i32,
        ref_spec: String,
        message: String,
    },

    #[error("Search failed: {0}")]
    Search(String),

    #[error("Failed to write search results: {0}")]
    Csv(#[from] CsvError),

    #[error("Search was canceled")]
    Canceled,
}

/// Creates searches. Implementations must be cheap to call repeatedly; every
/// stage creates its own search rather than receiving one from its parent.
pub trait Searcher: Send + Sync + 'static {
    type Query: SearchQuery;

    /// `ctx` carries the actor the search runs as.
    fn new_search(
        &self,
        ctx: &SearchContext,
        query: &str,
    ) -> impl Future<Output = Result<Self::Query, SearcherError>> + Send;
}

pub trait SearchQuery: Send + Sync {
    /// Lazily yields every repository the query touches.
    fn repository_rev_specs<'a>(
        &'a self,
        ctx: &'a SearchContext,
    ) -> BoxStream<'a, Result<RepositoryRevSpecs, SearcherError>>;

    fn resolve_repository_rev_spec(
        &self,
        ctx: &SearchContext,
        rev_specs: &RepositoryRevSpecs,
    ) -> impl Future<Output = Result<Vec<RepositoryRevision>, SearcherError>> + Send;

    /// Streams every result of `revision` into `writer`.
    fn search<W: CsvWriter>(
        &self,
        ctx: &SearchContext,
        revision: &RepositoryRevision,
        writer: &mut W,
    ) -> impl Future<Output = Result<(), SearcherError>> + Send;
}
