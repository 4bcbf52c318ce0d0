//! In-process test double for the sink. Built for unit tests and with the
//! `test-util` feature.
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

use super::{CellUpdate, Row, RowMatch, Sink, SinkConnector, SinkError, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOp {
    EnsureSchema,
    Append(Table),
    FindAndUpdate(Table),
}

#[derive(Debug, Clone)]
pub struct SinkCall {
    pub op: SinkOp,
    pub at: Instant,
    pub failed: bool,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<Table, Vec<Row>>,
    script: VecDeque<Result<(), SinkError>>,
    always_fail: Option<SinkError>,
    calls: Vec<SinkCall>,
}

/// Keeps rows in memory. Row operations can be scripted to fail.
#[derive(Default)]
pub struct MemorySink {
    inner: Mutex<Inner>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues outcomes for the next row operations, in order. Once the
    /// queue is empty operations succeed again.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<(), SinkError>>) {
        self.lock().script.extend(outcomes);
    }

    /// Makes every row operation fail with `error` until cleared.
    pub fn fail_always(&self, error: Option<SinkError>) {
        self.lock().always_fail = error;
    }

    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.lock().tables.get(&table).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.lock().calls.clone()
    }

    /// Row operations seen so far, including failed ones.
    pub fn row_calls(&self) -> Vec<SinkCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.op != SinkOp::EnsureSchema)
            .collect()
    }

    fn begin(inner: &mut Inner, op: SinkOp) -> Result<(), SinkError> {
        let outcome = match &inner.always_fail {
            Some(e) => Err(e.clone()),
            None => inner.script.pop_front().unwrap_or(Ok(())),
        };
        inner.calls.push(SinkCall {
            op,
            at: Instant::now(),
            failed: outcome.is_err(),
        });
        outcome
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        let mut inner = self.lock();
        inner.calls.push(SinkCall {
            op: SinkOp::EnsureSchema,
            at: Instant::now(),
            failed: false,
        });
        for table in Table::ALL {
            inner.tables.entry(table).or_default();
        }
        Ok(())
    }

    async fn append_row(&self, table: Table, row: Row) -> Result<(), SinkError> {
        let mut inner = self.lock();
        Self::begin(&mut inner, SinkOp::Append(table))?;
        inner.tables.entry(table).or_default().push(row);
        Ok(())
    }

    async fn find_and_update_row(
        &self,
        table: Table,
        matcher: &RowMatch,
        updates: &[CellUpdate],
    ) -> Result<bool, SinkError> {
        let mut inner = self.lock();
        Self::begin(&mut inner, SinkOp::FindAndUpdate(table))?;
        let rows = inner.tables.entry(table).or_default();
        let Some(row) = rows.iter_mut().find(|row| matcher.matches(table, row)) else {
            return Ok(false);
        };
        for update in updates {
            if let Some(i) = table.column_index(update.column)
                && let Some(cell) = row.get_mut(i)
            {
                *cell = update.value.clone();
            }
        }
        Ok(true)
    }
}

/// Hands out the same [`MemorySink`] on every connect and counts connects.
pub struct MemoryConnector {
    sink: Arc<MemorySink>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(sink: Arc<MemorySink>) -> Self {
        Self {
            sink,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn sink(&self) -> &Arc<MemorySink> {
        &self.sink
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SinkConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Sink>, SinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.sink.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_modules::sink::{Cell, STATUS_ONGOING};

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let sink = MemorySink::new();
        sink.script([Err(SinkError::RateLimit("429".into()))]);

        let row = vec![Cell::text("a")];
        assert!(sink.append_row(Table::ConnectivityChecks, row.clone()).await.is_err());
        sink.append_row(Table::ConnectivityChecks, row).await.unwrap();

        assert_eq!(sink.rows(Table::ConnectivityChecks).len(), 1);
        let failed: Vec<bool> = sink.row_calls().iter().map(|c| c.failed).collect();
        assert_eq!(failed, vec![true, false]);
    }

    #[tokio::test]
    async fn test_find_and_update_applies_to_first_match() {
        let sink = MemorySink::new();
        let mut row = vec![Cell::text("house1"), Cell::text("t0")];
        row.extend(std::iter::repeat_n(Cell::empty(), 4));
        row.push(Cell::text(STATUS_ONGOING));
        sink.append_row(Table::Outages, row).await.unwrap();

        let matcher = RowMatch::new().with("Start_Time", Cell::text("t0"));
        let updates = [CellUpdate::new("Status", Cell::text("RESOLVED"))];
        assert!(sink.find_and_update_row(Table::Outages, &matcher, &updates).await.unwrap());
        assert_eq!(sink.rows(Table::Outages)[0][6], Cell::text("RESOLVED"));

        let missing = RowMatch::new().with("Start_Time", Cell::text("t1"));
        assert!(!sink.find_and_update_row(Table::Outages, &missing, &[]).await.unwrap());
    }
}
