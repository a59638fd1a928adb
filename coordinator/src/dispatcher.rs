//! Per-type ordered dispatch of raw rates onto the blocking pool.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use ratefeed_common::{CurrencyPair, RawRate};
use ratefeed_fx::RateManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::metrics::SharedMetrics;

/// Routes every raw rate to the worker owning its currency-pair type.
///
/// One worker per type processes its rates one at a time, so ticks of the
/// same type are reconciled in arrival order while different types run in
/// parallel.
pub struct RateDispatcher {
    manager: Arc<RateManager>,
    metrics: SharedMetrics,
    workers: DashMap<CurrencyPair, mpsc::UnboundedSender<RawRate>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Set by `shutdown`; held shared by every `dispatch` call.
    closed: RwLock<bool>,
}

impl RateDispatcher {
    pub fn new(manager: Arc<RateManager>, metrics: SharedMetrics) -> Self {
        Self {
            manager,
            metrics,
            workers: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            closed: RwLock::new(false),
        }
    }

    /// Queue a raw rate behind earlier rates of the same type.
    ///
    /// Rates arriving after `shutdown` are dropped.
    pub fn dispatch(&self, rate: RawRate) {
        let closed = self.closed.read();
        if *closed {
            warn!(rate_type = %rate.pair, provider = %rate.provider, "Dispatcher closed, dropping rate");
            self.metrics.rate_failed();
            return;
        }

        let sender = self
            .workers
            .entry(rate.pair.clone())
            .or_insert_with(|| self.spawn_worker(rate.pair.clone()))
            .clone();

        if sender.send(rate).is_err() {
            // The worker only exits once its sender is dropped
            error!("Rate worker stopped unexpectedly");
            self.metrics.rate_failed();
        }
    }

    /// Number of types with a running worker.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Let every worker drain its queue, then wait for them to exit.
    pub async fn shutdown(&self) {
        {
            let mut closed = self.closed.write();
            *closed = true;
            self.workers.clear();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Rate worker panicked");
            }
        }
    }

    fn spawn_worker(&self, pair: CurrencyPair) -> mpsc::UnboundedSender<RawRate> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RawRate>();
        let manager = self.manager.clone();
        let metrics = self.metrics.clone();

        debug!(pair = %pair, "Starting rate worker");
        let task = tokio::spawn(async move {
            while let Some(rate) = rx.recv().await {
                let manager = manager.clone();
                match tokio::task::spawn_blocking(move || manager.manage_incoming_raw_rate(rate))
                    .await
                {
                    Ok(outcome) => metrics.record_outcome(&outcome),
                    Err(e) => {
                        error!(pair = %pair, error = %e, "Rate processing panicked");
                        metrics.rate_failed();
                    }
                }
            }
            debug!(pair = %pair, "Rate worker stopped");
        });

        self.tasks.lock().push(task);
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use ratefeed_common::{now, ProviderId};
    use ratefeed_fx::{ChannelPublisher, DecimalCalculator, InMemoryRateCache, Published};

    fn raw(pair: &str, provider: &str, bid: f64, ask: f64) -> RawRate {
        RawRate::new(pair.parse().unwrap(), ProviderId::new(provider), bid, ask, now())
    }

    #[tokio::test]
    async fn test_rates_of_one_type_keep_their_order() {
        let (publisher, mut rx) = ChannelPublisher::new();
        let manager = Arc::new(RateManager::new(
            Arc::new(InMemoryRateCache::new()),
            Arc::new(DecimalCalculator::new()),
            Arc::new(publisher),
        ));
        let metrics = Arc::new(Metrics::new());
        let dispatcher = RateDispatcher::new(manager, metrics.clone());

        // Small steps stay within the deviation threshold
        let bids: Vec<f64> = (0..20).map(|i| 34.0 + f64::from(i) * 0.01).collect();
        for bid in &bids {
            dispatcher.dispatch(raw("USD_TRY", "PF1", *bid, bid + 1.0));
        }
        dispatcher.dispatch(raw("EUR_USD", "PF1", 1.1, 1.2));
        assert_eq!(dispatcher.worker_count(), 2);

        dispatcher.shutdown().await;
        assert_eq!(dispatcher.worker_count(), 0);

        let mut seen = Vec::new();
        while let Ok(published) = rx.try_recv() {
            if let Published::Raw(rate) = published {
                if rate.pair == CurrencyPair::usd_try() {
                    seen.push(rate.bid);
                }
            }
        }
        assert_eq!(seen, bids);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rates_accepted, 21);
        assert_eq!(snapshot.rates_failed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_without_workers() {
        let (publisher, _rx) = ChannelPublisher::new();
        let manager = Arc::new(RateManager::new(
            Arc::new(InMemoryRateCache::new()),
            Arc::new(DecimalCalculator::new()),
            Arc::new(publisher),
        ));
        let dispatcher = RateDispatcher::new(manager, Arc::new(Metrics::new()));
        dispatcher.shutdown().await;
        assert_eq!(dispatcher.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_rates_after_shutdown_are_dropped() {
        let (publisher, mut rx) = ChannelPublisher::new();
        let manager = Arc::new(RateManager::new(
            Arc::new(InMemoryRateCache::new()),
            Arc::new(DecimalCalculator::new()),
            Arc::new(publisher),
        ));
        let metrics = Arc::new(Metrics::new());
        let dispatcher = RateDispatcher::new(manager, metrics.clone());
        dispatcher.shutdown().await;

        dispatcher.dispatch(raw("USD_TRY", "PF1", 34.0, 35.0));

        assert_eq!(dispatcher.worker_count(), 0);
        assert!(dispatcher.tasks.lock().is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.snapshot().rates_failed, 1);

        // A second shutdown has nothing left to wait for
        dispatcher.shutdown().await;
    }
}
