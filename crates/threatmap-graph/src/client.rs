//! Bolt connection pool shared by every Neo4j store operation.

use neo4rs::{query, ConfigBuilder, Graph, Query, Row};

use threatmap_core::config::Neo4jSettings;

/// Errors from graph store operations.
///
/// These are storage failures: transient from the engine's point of view.
/// They fail the observation being committed, never the whole batch.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Neo4j connection error: {0}")]
    Connection(String),

    #[error("Neo4j query error: {0}")]
    Query(#[from] neo4rs::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Edge endpoint {id} is a {found}, expected {expected}")]
    EndpointType {
        id: String,
        expected: String,
        found: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Concurrent writers kept changing {id}; gave up after {attempts} attempts")]
    Contention { id: String, attempts: u32 },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for GraphError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Pooled Neo4j client. Clone shares the pool.
#[derive(Clone)]
pub struct GraphClient {
    pool: Graph,
}

impl GraphClient {
    /// Open the pool described by the `[neo4j]` settings and check the
    /// server answers, so a bad URI or password fails at startup rather
    /// than on the first observation.
    pub async fn connect(settings: &Neo4jSettings) -> Result<Self, GraphError> {
        let bolt = ConfigBuilder::default()
            .uri(&settings.uri)
            .user(&settings.user)
            .password(&settings.password)
            .max_connections(settings.max_connections.max(1))
            .fetch_size(settings.fetch_size.max(1))
            .build()
            .map_err(|e| GraphError::Connection(format!("{}: {e}", settings.uri)))?;

        let pool = Graph::connect(bolt)
            .await
            .map_err(|e| GraphError::Connection(format!("{}: {e}", settings.uri)))?;

        let client = Self { pool };
        client
            .query_one(query("RETURN 1 AS ok"))
            .await
            .map_err(|e| GraphError::Unavailable(format!("{} did not answer: {e}", settings.uri)))?;

        tracing::info!(
            uri = %settings.uri,
            max_connections = settings.max_connections,
            "Connected to Neo4j"
        );
        Ok(client)
    }

    /// Run a statement whose result rows are not needed (writes, DDL).
    pub async fn run(&self, statement: Query) -> Result<(), GraphError> {
        Ok(self.pool.run(statement).await?)
    }

    pub async fn query_rows(&self, statement: Query) -> Result<Vec<Row>, GraphError> {
        self.fetch(statement, usize::MAX).await
    }

    /// First row of the result, if any. Remaining rows are not pulled.
    pub async fn query_one(&self, statement: Query) -> Result<Option<Row>, GraphError> {
        Ok(self.fetch(statement, 1).await?.into_iter().next())
    }

    async fn fetch(&self, statement: Query, limit: usize) -> Result<Vec<Row>, GraphError> {
        let mut stream = self.pool.execute(statement).await?;
        let mut rows = Vec::new();
        while rows.len() < limit {
            match stream.next().await? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }
}
