use thiserror::Error;

/// Crate-wide error type for the indexing pipeline.
///
/// `BlockNotFound` is deliberately not a variant here: a missing block is a
/// normal outcome represented as `Option::None`, not a failure. Likewise a
/// detected reorg never surfaces as an error; callers observe it through a
/// typed `Option<ReorgOutcome>` return from `reorg::check_and_repair`.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("rpc transport error calling {method}: {source}")]
    Transport {
        method: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("rpc returned a block that failed schema validation: {0}")]
    SchemaMismatch(String),

    #[error("failed to transform remote block into a storable row: {0}")]
    Transform(String),

    #[error("database error during {op}: {source}")]
    Db {
        op: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl IndexerError {
    pub fn transport(method: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        IndexerError::Transport {
            method: method.into(),
            source: Box::new(source),
        }
    }

    pub fn db(op: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        IndexerError::Db {
            op: op.into(),
            source: Box::new(source),
        }
    }

    /// Short label for metrics (`rpc_errors{kind=...}`); stable across
    /// `source` variation so it stays low-cardinality.
    pub fn kind(&self) -> &'static str {
        match self {
            IndexerError::Transport { .. } => "transport",
            IndexerError::SchemaMismatch(_) => "schema_mismatch",
            IndexerError::Transform(_) => "transform",
            IndexerError::Db { .. } => "db",
            IndexerError::Config(_) => "config",
        }
    }
}

impl From<tokio_postgres::Error> for IndexerError {
    fn from(err: tokio_postgres::Error) -> Self {
        IndexerError::db("query", err)
    }
}

impl From<deadpool_postgres::PoolError> for IndexerError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        IndexerError::db("pool checkout", err)
    }
}

pub type IndexerResult<T> = Result<T, IndexerError>;
