use sqlx::{PgPool, Postgres, Transaction};

use crate::error::StoreError;
use crate::realtime::ChangeFeed;

/// Handle over the backing store: the connection pool plus the change feed
/// that write paths publish to after commit. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pub pool: PgPool,
    pub feed: ChangeFeed,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            feed: ChangeFeed::new(),
        }
    }

    pub(crate) async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        Ok(self.pool.begin().await?)
    }
}
