//! Database handle for the control plane.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use sqlx::{Pool, Sqlite, SqliteConnection};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use ztna_core::db::{DatabaseError, open_pool, open_pool_in_memory};

use crate::ip::{AllocatorError, DEFAULT_RESERVED_IP, DEFAULT_TUNNEL_CIDR, IpAllocator};

/// Pool handle plus the address allocator.
///
/// Cloning is cheap and every clone shares the same enrollment lock.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    allocator: Arc<IpAllocator>,
    enrollment_lock: Arc<Mutex<()>>,
}

impl Database {
    /// Open or create a database at the given path and apply pending migrations.
    pub async fn open(path: &Path, allocator: IpAllocator) -> Result<Self, DatabaseError> {
        let pool = open_pool(path).await?;
        Self::with_pool(pool, allocator).await
    }

    /// Open an in-memory database (for testing) with the default address pool.
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        let allocator = IpAllocator::new(DEFAULT_TUNNEL_CIDR, [DEFAULT_RESERVED_IP])
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        Self::open_in_memory_with(allocator).await
    }

    /// Open an in-memory database (for testing) with a custom address pool.
    pub async fn open_in_memory_with(allocator: IpAllocator) -> Result<Self, DatabaseError> {
        let pool = open_pool_in_memory().await?;
        Self::with_pool(pool, allocator).await
    }

    async fn with_pool(pool: Pool<Sqlite>, allocator: IpAllocator) -> Result<Self, DatabaseError> {
        let db = Self {
            pool,
            allocator: Arc::new(allocator),
            enrollment_lock: Arc::new(Mutex::new(())),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Applies `migrations/` in order. Each file runs once, in its own
    /// transaction, and is checksummed in `_sqlx_migrations`.
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        info!("Control plane database migrations complete");
        Ok(())
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn allocator(&self) -> &IpAllocator {
        &self.allocator
    }

    /// Serialises "pick the next free address" with "persist the record".
    pub(super) async fn lock_enrollment(&self) -> MutexGuard<'_, ()> {
        self.enrollment_lock.lock().await
    }

    /// Pick a free tunnel address. Must run inside the enrollment lock and
    /// the transaction that persists the new record.
    pub(super) async fn allocate_ip(
        &self,
        conn: &mut SqliteConnection,
    ) -> Result<String, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT ip FROM device UNION SELECT ip FROM gateway")
            .fetch_all(&mut *conn)
            .await?;

        let mut allocated = HashSet::with_capacity(rows.len());
        for (ip,) in rows {
            let addr = ip
                .parse::<Ipv4Addr>()
                .map_err(|e| DatabaseError::Corrupt(format!("tunnel ip {ip}: {e}")))?;
            allocated.insert(addr);
        }

        let ip = self.allocator.next_ip(&allocated)?;
        Ok(ip.to_string())
    }
}

impl From<AllocatorError> for DatabaseError {
    fn from(e: AllocatorError) -> Self {
        error!(error = %e, "Tunnel address allocation failed");
        Self::ExhaustedPool(e.to_string())
    }
}
