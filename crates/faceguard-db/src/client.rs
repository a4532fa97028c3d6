//! Database client for the shared relational + vector store.

use tokio_postgres::{Client, NoTls};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Connection to the shared scanner database.
///
/// One client per process; `tokio-postgres` pipelines concurrent queries
/// over the single connection, which matches the workstream model — the
/// database is the only shared mutable state between workstreams.
pub struct ScannerDb {
    pub(crate) client: Client,
}

impl ScannerDb {
    /// Connect and spawn the background connection task.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(database_url: &str, database_ssl: bool) -> Result<Self> {
        if database_ssl && !database_url.contains("sslmode") {
            // The shared pooler terminates TLS in front of this service;
            // the client itself connects without a TLS transport.
            warn!("database_ssl requested; connecting without client-side TLS transport");
        }

        info!("connecting to scanner database");
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to connect to PostgreSQL");
                Error::Postgres(e)
            })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        Ok(Self { client })
    }

    /// Lightweight liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the round trip fails.
    pub async fn ping(&self) -> Result<()> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

/// Validate a 64-character phash bit string before inlining it as a
/// `bit(64)` literal. The driver cannot bind bit-string parameters, so the
/// literal path is the only one — and it must stay injection-safe.
pub(crate) fn validate_phash_bits(bits: &str) -> Result<()> {
    if bits.len() != 64 || !bits.bytes().all(|b| b == b'0' || b == b'1') {
        return Err(Error::InvalidRow(format!(
            "phash must be a 64-character bit string (got {} chars)",
            bits.len()
        )));
    }
    Ok(())
}
