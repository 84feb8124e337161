//! Row stream aggregation
//!
//! Every query result is consumed through one lazy stream. The collecting and
//! callback forms are thin consumers of it, so they cannot disagree on
//! ordering or error handling:
//!
//! | Form | On mid-stream error |
//! |------|---------------------|
//! | [`RowAggregator::stream`] | yields the error, then ends |
//! | [`RowAggregator::collect`] | whole call fails, rows discarded |
//! | [`RowAggregator::collect_partial`] | rows read so far plus the error |
//! | [`RowAggregator::for_each`] | delivered rows stand, `on_error` once |

use std::future;
use std::sync::Arc;

use futures::stream::StreamExt;
use log::debug;
use parkwatch_connectors::{ConnectorError, RowStream, TimeSeriesStore};
use parkwatch_core::Row;

/// Rows read before a query failed, and the failure
#[derive(Debug)]
pub struct PartialRows {
    pub rows: Vec<Row>,
    pub error: Option<ConnectorError>,
}

impl PartialRows {
    /// True when the query ran to completion
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Executes queries and shapes their result streams
#[derive(Clone)]
pub struct RowAggregator {
    store: Arc<dyn TimeSeriesStore>,
}

impl RowAggregator {
    pub fn new(store: Arc<dyn TimeSeriesStore>) -> Self {
        Self { store }
    }

    /// Ordered rows; an error is the last item
    pub fn stream(&self, query: &str) -> RowStream {
        debug!("Executing query: {}", query);
        self.store
            .query_rows(query)
            .scan(false, |failed, item| {
                if *failed {
                    return future::ready(None);
                }
                *failed = item.is_err();
                future::ready(Some(item))
            })
            .boxed()
    }

    /// All rows, or the first error
    pub async fn collect(&self, query: &str) -> Result<Vec<Row>, ConnectorError> {
        let mut stream = self.stream(query);
        let mut rows = Vec::new();
        while let Some(item) = stream.next().await {
            rows.push(item?);
        }
        Ok(rows)
    }

    /// All rows read until completion or failure
    pub async fn collect_partial(&self, query: &str) -> PartialRows {
        let mut stream = self.stream(query);
        let mut rows = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(row) => rows.push(row),
                Err(error) => {
                    return PartialRows {
                        rows,
                        error: Some(error),
                    }
                }
            }
        }
        PartialRows { rows, error: None }
    }

    /// Push each row to `on_row`, then exactly one of `on_error` or
    /// `on_complete`
    pub async fn for_each<R, E, C>(&self, query: &str, mut on_row: R, on_error: E, on_complete: C)
    where
        R: FnMut(Row),
        E: FnOnce(ConnectorError),
        C: FnOnce(),
    {
        let mut stream = self.stream(query);
        while let Some(item) = stream.next().await {
            match item {
                Ok(row) => on_row(row),
                Err(error) => {
                    on_error(error);
                    return;
                }
            }
        }
        on_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parkwatch_connectors::MemoryStore;
    use parkwatch_core::Scalar;

    fn row(value: i64) -> Row {
        Row {
            device: Some("dev1".into()),
            measurement: "telemetry".into(),
            field: "lux".into(),
            value: Scalar::Integer(value),
            time: value as u64,
        }
    }

    fn failing_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.push_response(vec![
            Ok(row(1)),
            Ok(row(2)),
            Err(ConnectorError::Query("connection reset".into())),
            Ok(row(3)),
        ]);
        store
    }

    #[tokio::test]
    async fn stream_stops_after_error() {
        let aggregator = RowAggregator::new(failing_store());
        let items: Vec<_> = aggregator.stream("q").collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());
    }

    #[tokio::test]
    async fn collect_preserves_order() {
        let store = Arc::new(MemoryStore::new());
        store.push_rows(vec![row(3), row(1), row(2)]);
        let rows = RowAggregator::new(store).collect("q").await.unwrap();
        let values: Vec<_> = rows.iter().map(|r| r.time).collect();
        assert_eq!(values, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn collect_is_all_or_nothing() {
        let aggregator = RowAggregator::new(failing_store());
        assert!(matches!(
            aggregator.collect("q").await,
            Err(ConnectorError::Query(_))
        ));
    }

    #[tokio::test]
    async fn collect_partial_keeps_rows_before_failure() {
        let aggregator = RowAggregator::new(failing_store());
        let partial = aggregator.collect_partial("q").await;
        assert!(!partial.is_complete());
        assert_eq!(partial.rows, vec![row(1), row(2)]);
    }

    #[tokio::test]
    async fn for_each_signals_exactly_once() {
        let aggregator = RowAggregator::new(failing_store());
        let mut seen = Vec::new();
        let mut errors = 0;
        let mut completed = false;
        aggregator
            .for_each("q", |r| seen.push(r.time), |_| errors += 1, || completed = true)
            .await;
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(errors, 1);
        assert!(!completed);

        let aggregator = RowAggregator::new(Arc::new(MemoryStore::new()));
        let mut completed = false;
        aggregator
            .for_each("q", |_| panic!("no rows expected"), |_| panic!("no error expected"), || completed = true)
            .await;
        assert!(completed);
    }
}
