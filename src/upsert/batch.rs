use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::{Result, SyncError};
use crate::store::StoreConnection;
use crate::upsert::engine::Upsert;

/// One unit of work written by a [`BatchWriter`].
#[async_trait]
pub trait BatchItem: Send + Sync {
    async fn write(&self, conn: &mut dyn StoreConnection) -> Result<()>;

    fn describe(&self) -> String;
}

#[async_trait]
impl BatchItem for Upsert {
    async fn write(&self, conn: &mut dyn StoreConnection) -> Result<()> {
        self.execute(conn).await.map(|_| ())
    }

    fn describe(&self) -> String {
        format!("upsert into {}", self.table())
    }
}

/// What a bulk run does after an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPolicy {
    Abort,
    SkipAndContinue,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Items written without error (including those later rolled back).
    pub written: usize,
    pub committed: usize,
    pub rolled_back: usize,
    /// Input position and error of each failed item.
    pub failures: Vec<(usize, SyncError)>,
}

/// Commits every `batch_size` items; on error only the open batch is rolled back.
pub struct BatchWriter<'c> {
    conn: &'c mut dyn StoreConnection,
    batch_size: usize,
    pending: usize,
    committed: usize,
    rolled_back: usize,
}

impl<'c> BatchWriter<'c> {
    pub fn new(conn: &'c mut dyn StoreConnection, batch_size: usize) -> Self {
        Self {
            conn,
            batch_size: batch_size.max(1),
            pending: 0,
            committed: 0,
            rolled_back: 0,
        }
    }

    pub async fn write(&mut self, item: &dyn BatchItem) -> Result<()> {
        if !self.conn.in_transaction() {
            self.conn.begin().await?;
        }
        match item.write(&mut *self.conn).await {
            Ok(()) => {
                self.pending += 1;
                if self.pending >= self.batch_size {
                    self.commit().await?;
                }
                Ok(())
            }
            Err(e) => {
                warn!(item = %item.describe(), error = %e, discarded = self.pending, "batch item failed; rolling back open batch");
                self.conn.rollback().await?;
                self.rolled_back += self.pending;
                self.pending = 0;
                Err(e)
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn.commit().await?;
        self.committed += self.pending;
        self.pending = 0;
        Ok(())
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn rolled_back(&self) -> usize {
        self.rolled_back
    }

    /// Commits the last partial batch.
    pub async fn finish(mut self) -> Result<(usize, usize)> {
        if self.conn.in_transaction() {
            self.commit().await?;
        }
        Ok((self.committed, self.rolled_back))
    }
}

/// Writes all `items` in batches of `batch_size`.
pub async fn write_all<'i, I>(
    conn: &mut dyn StoreConnection,
    batch_size: usize,
    items: I,
    policy: BatchPolicy,
) -> Result<BatchReport>
where
    I: IntoIterator<Item = &'i dyn BatchItem>,
{
    let mut writer = BatchWriter::new(conn, batch_size);
    let mut report = BatchReport::default();
    for (idx, item) in items.into_iter().enumerate() {
        match writer.write(item).await {
            Ok(()) => report.written += 1,
            Err(e) => {
                report.failures.push((idx, e));
                if policy == BatchPolicy::Abort {
                    break;
                }
            }
        }
    }
    let (committed, rolled_back) = writer.finish().await?;
    report.committed = committed;
    report.rolled_back = rolled_back;
    info!(
        written = report.written,
        committed,
        rolled_back,
        failed = report.failures.len(),
        "batch run finished"
    );
    Ok(report)
}
