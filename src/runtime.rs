//! Runtime: builds every component from a loaded `PipelineConfig` and
//! drives the ingest -> analytics -> publish -> fan-out pipeline.
//!
//! Boot and shutdown follow a build-shared-state-then-spawn-one-task-per-
//! concern shape: construct everything up front, spawn one task per
//! concern, await a shutdown signal, then unwind in reverse order. Unlike a
//! single-exchange execution engine, this fans out over every enabled venue
//! and holds no position/order state at all — it is a pure
//! ingest-and-republish pipeline.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::mpsc;

use serde::Serialize;

use crate::candle::{CandleAggregator, TimeframeSecs};
use crate::codec::codec_for;
use crate::config::PipelineConfig;
use crate::fanout::FanoutRegistry;
use crate::flow::{BestQuote, FlowAnalytics};
use crate::metrics::MetricsRegistry;
use crate::model::{Event, Snapshot};
use crate::orderbook::{BookHandle, OrderBookRegistry};
use crate::publish::{PublishEnvelope, PublishFabric, Priority, RedisBridge};
use crate::sequence::{GapAction, SequenceWatcher};
use crate::session::SessionSupervisor;
use crate::snapshot::SnapshotStore;
use crate::topics;
use crate::venue::{Symbol, Venue};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

const WALL_DEPTH: usize = 20;

/// Derived best/spread/depth/imbalance/walls view published on
/// `orderbook:{symbol}` whenever a book delta is applied.
#[derive(Serialize)]
struct OrderbookView {
    venue: Venue,
    symbol: Symbol,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    spread: Option<f64>,
    spread_bps: Option<f64>,
    depth_bids: Vec<(f64, f64)>,
    depth_asks: Vec<(f64, f64)>,
    imbalance: Option<f64>,
    bid_walls: Vec<(f64, f64)>,
    ask_walls: Vec<(f64, f64)>,
    ts: i64,
}

impl OrderbookView {
    fn from_book(book: &BookHandle, wall_size: f64, ts: i64) -> Self {
        let (bid_walls, ask_walls) = book.walls(WALL_DEPTH, wall_size);
        Self {
            venue: book.venue,
            symbol: book.symbol.clone(),
            best_bid: book.best_bid().map(|l| l.price),
            best_ask: book.best_ask().map(|l| l.price),
            spread: book.spread(),
            spread_bps: book.spread_bps(),
            depth_bids: book.depth_bids(WALL_DEPTH).iter().map(|l| (l.price, l.qty)).collect(),
            depth_asks: book.depth_asks(WALL_DEPTH).iter().map(|l| (l.price, l.qty)).collect(),
            imbalance: book.imbalance(WALL_DEPTH),
            bid_walls: bid_walls.iter().map(|l| (l.price, l.qty)).collect(),
            ask_walls: ask_walls.iter().map(|l| (l.price, l.qty)).collect(),
            ts,
        }
    }
}

/// CVD view published on `cvd:{symbol}`.
#[derive(Serialize)]
struct CvdView {
    symbol: Symbol,
    cvd_1m: f64,
    cvd_5m: f64,
    cvd_15m: f64,
    cvd_1h: f64,
    trade_count: u64,
    ts: i64,
}

pub struct Runtime {
    config: PipelineConfig,
    pub orderbooks: Arc<OrderBookRegistry>,
    pub candles: Arc<CandleAggregator>,
    pub flow: Arc<FlowAnalytics>,
    pub sequence: Arc<SequenceWatcher>,
    pub snapshots: Arc<SnapshotStore>,
    pub fanout: Arc<FanoutRegistry>,
    pub publish: Arc<PublishFabric>,
    pub metrics: Arc<MetricsRegistry>,
    redis_bridge: Option<Arc<RedisBridge>>,
}

impl Runtime {
    pub fn new(config: PipelineConfig) -> Self {
        let timeframes: Vec<TimeframeSecs> = config
            .analytics
            .timeframes_secs
            .iter()
            .map(|&s| s as TimeframeSecs)
            .collect();

        let redis_bridge = config
            .runtime
            .redis_url
            .as_deref()
            .and_then(|url| match RedisBridge::new(url) {
                Ok(bridge) => Some(Arc::new(bridge)),
                Err(e) => {
                    warn!("redis bridge unavailable, publishing will drop: {e}");
                    None
                }
            });

        Self {
            orderbooks: Arc::new(OrderBookRegistry::with_max_levels(config.analytics.max_book_levels)),
            candles: Arc::new(CandleAggregator::new(timeframes, config.analytics.emit_empty_candles)),
            flow: Arc::new(FlowAnalytics::new(config.clone())),
            sequence: Arc::new(SequenceWatcher::new(
                config.analytics.gap_log_max,
                config.analytics.gap_snapshot_max,
                Duration::from_secs(config.analytics.gap_timeout_secs as u64),
            )),
            snapshots: Arc::new(SnapshotStore::new(config.analytics.snapshot_retention_secs)),
            fanout: Arc::new(FanoutRegistry::new()),
            publish: PublishFabric::new(config.runtime.rate_limit_msgs_per_sec, config.runtime.max_retries),
            metrics: Arc::new(MetricsRegistry::default()),
            redis_bridge,
            config,
        }
    }

    /// Runs the pipeline until `shutdown` resolves. Spawns, in order: one
    /// session per enabled (venue, symbol), the event-processing task, the
    /// publish worker pool, and the periodic tickers (stale-sequence check,
    /// snapshot eviction). Shuts everything down in reverse order, each
    /// phase bounded by `runtime.drain_deadline_secs`.
    pub async fn run(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) {
        let (event_tx, event_rx) = mpsc::channel::<Event>(10_000);
        let mut session_tasks = Vec::new();

        for venue in self.config.enabled_venues() {
            let symbols: Vec<Symbol> = self
                .config
                .symbols_for(venue)
                .into_iter()
                .map(Symbol::new)
                .collect();
            if symbols.is_empty() {
                continue;
            }
            let supervisor = Arc::new(SessionSupervisor::new(codec_for(venue), symbols));
            let tx = event_tx.clone();
            let sup = supervisor.clone();
            session_tasks.push(tokio::spawn(async move {
                sup.run(tx).await;
            }));
        }
        drop(event_tx);

        let processor = tokio::spawn(self.clone().process_events(event_rx));

        let drain_deadline = Duration::from_secs(self.config.runtime.drain_deadline_secs);
        let mut worker_tasks = Vec::new();
        if let Some(bridge) = self.redis_bridge.clone() {
            for _ in 0..self.config.runtime.publish_workers {
                let fabric = self.publish.clone();
                let bridge = bridge.clone();
                worker_tasks.push(tokio::spawn(fabric.run_worker(bridge)));
            }
        } else {
            warn!("no redis url configured; publish fabric has no downstream and will buffer only");
        }

        let stale_ticker = tokio::spawn(self.clone().run_stale_ticker());
        let snapshot_ticker = tokio::spawn(self.clone().run_snapshot_ticker());
        let stats_ticker = tokio::spawn(self.clone().run_stats_ticker());

        shutdown.recv().await;
        info!("shutdown requested, draining components");

        for task in session_tasks {
            task.abort();
        }
        let _ = tokio::time::timeout(drain_deadline, processor).await;
        stale_ticker.abort();
        snapshot_ticker.abort();
        stats_ticker.abort();
        for task in worker_tasks {
            task.abort();
        }
        info!("shutdown complete");
    }

    async fn process_events(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            let ts = now_ms();
            match event {
                Event::Trade(trade) => {
                    self.metrics.orderbook.record_message(ts);

                    let payload = match serde_json::to_string(&trade) {
                        Ok(p) => p,
                        Err(e) => {
                            error!("failed to serialize trade: {e}");
                            continue;
                        }
                    };
                    self.publish
                        .enqueue(PublishEnvelope::new(
                            topics::trade(trade.venue, &trade.symbol),
                            payload,
                            Priority::Medium,
                            ts,
                        ))
                        .await;

                    for (timeframe, outcome) in self.candles.absorb(&trade) {
                        self.metrics.candles.record_message(ts);
                        if let Some(closed) = outcome.closed {
                            if let Ok(payload) = serde_json::to_string(&closed) {
                                self.publish
                                    .enqueue(PublishEnvelope::new(
                                        topics::candle(timeframe, &trade.symbol),
                                        payload,
                                        Priority::Low,
                                        ts,
                                    ))
                                    .await;
                            }
                        }
                    }

                    let book = self.orderbooks.book(trade.venue, &trade.symbol);
                    let best = match (book.best_bid(), book.best_ask()) {
                        (Some(bid), Some(ask)) => Some(BestQuote {
                            best_bid: bid.price,
                            best_ask: ask.price,
                        }),
                        _ => None,
                    };

                    let (flow_snapshot, whale) = self.flow.observe(&trade, ts, best);
                    self.metrics.flow.record_message(ts);
                    if let Ok(payload) = serde_json::to_string(&flow_snapshot) {
                        self.publish
                            .enqueue(PublishEnvelope::new(
                                topics::orderflow(&trade.symbol),
                                payload,
                                Priority::Low,
                                ts,
                            ))
                            .await;
                    }

                    let cvd_view = CvdView {
                        symbol: trade.symbol.clone(),
                        cvd_1m: flow_snapshot.cvd.w1m,
                        cvd_5m: flow_snapshot.cvd.w5m,
                        cvd_15m: flow_snapshot.cvd.w15m,
                        cvd_1h: flow_snapshot.cvd.w1h,
                        trade_count: flow_snapshot.trade_count,
                        ts,
                    };
                    if let Ok(payload) = serde_json::to_string(&cvd_view) {
                        self.publish
                            .enqueue(PublishEnvelope::new(
                                topics::cvd(&trade.symbol),
                                payload,
                                Priority::Low,
                                ts,
                            ))
                            .await;
                    }

                    if let Some(whale_event) = whale {
                        if let Ok(payload) = serde_json::to_string(&whale_event) {
                            self.publish
                                .enqueue(PublishEnvelope::new(
                                    topics::whale(&trade.symbol),
                                    payload,
                                    Priority::High,
                                    ts,
                                ))
                                .await;
                        }
                    }
                }
                Event::BookDelta(delta) => {
                    let outcome = self.sequence.watch(&delta, ts);

                    if let Some(gap_event) = &outcome.gap_event {
                        self.metrics.orderbook.record_error();
                        if let Ok(payload) = serde_json::to_string(gap_event) {
                            self.publish
                                .enqueue(PublishEnvelope::new(
                                    topics::gap_detection(),
                                    payload,
                                    Priority::High,
                                    ts,
                                ))
                                .await;
                        }
                    }

                    if matches!(outcome.action, GapAction::Snapshot | GapAction::Critical) {
                        self.orderbooks.request_snapshot(delta.venue, &delta.symbol);
                    }

                    if let Some(request) = &outcome.snapshot_request {
                        if let Ok(payload) = serde_json::to_string(request) {
                            self.publish
                                .enqueue(PublishEnvelope::new(
                                    topics::snapshot_requests(),
                                    payload,
                                    request.priority,
                                    ts,
                                ))
                                .await;
                        }
                    }

                    if outcome.apply {
                        self.orderbooks.apply_delta(&delta);
                        self.metrics.orderbook.record_message(ts);
                    } else {
                        self.metrics.orderbook.record_drop();
                    }

                    let book = self.orderbooks.book(delta.venue, &delta.symbol);
                    if book.is_initialized() {
                        if let Ok(payload) = serde_json::to_string(&delta) {
                            self.publish
                                .enqueue(PublishEnvelope::new(
                                    topics::depth(delta.venue, &delta.symbol),
                                    payload,
                                    Priority::High,
                                    ts,
                                ))
                                .await;
                        }

                        let wall_size = self.config.thresholds_for(delta.symbol.as_str()).wall_size;
                        let view = OrderbookView::from_book(&book, wall_size, ts);
                        if let Ok(payload) = serde_json::to_string(&view) {
                            self.publish
                                .enqueue(PublishEnvelope::new(
                                    topics::orderbook(&delta.symbol),
                                    payload,
                                    Priority::Medium,
                                    ts,
                                ))
                                .await;
                        }
                    }
                }
                Event::Control(_) => {
                    // Consumed internally by the session supervisor; should
                    // never reach the event processor.
                }
            }
        }
    }

    async fn run_stale_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let ts = now_ms();
            for request in self.sequence.check_stale(ts) {
                self.orderbooks.request_snapshot(request.venue, &request.symbol);
            }
        }
    }

    /// Periodically captures every live book's current state, stores it in
    /// the snapshot store, publishes it on `snapshots:{venue}:{symbol}`, and
    /// feeds it back into `apply_snapshot`. That last step is what actually
    /// clears `awaiting_snapshot` on books paused for gap recovery: the
    /// periodic capture doubles as the recovery mechanism the sequence
    /// watcher and corruption check are waiting on.
    async fn run_snapshot_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.analytics.snapshot_interval_secs.max(1),
        ));
        loop {
            interval.tick().await;
            let ts = now_ms();
            self.snapshots.evict_expired(ts);

            for (venue, symbol) in self.orderbooks.symbols() {
                let book = self.orderbooks.book(venue, &symbol);
                if !book.is_initialized() {
                    continue;
                }
                let snapshot = Snapshot {
                    venue,
                    symbol: symbol.clone(),
                    bids: book
                        .depth_bids(usize::MAX)
                        .into_iter()
                        .map(|l| crate::model::Level { price: l.price, qty: l.qty })
                        .collect(),
                    asks: book
                        .depth_asks(usize::MAX)
                        .into_iter()
                        .map(|l| crate::model::Level { price: l.price, qty: l.qty })
                        .collect(),
                    snapshot_ts: ts,
                    seq: book.last_seq(),
                };

                self.snapshots.store(snapshot.clone());
                self.orderbooks.apply_snapshot(&snapshot);

                if let Ok(payload) = serde_json::to_string(&snapshot) {
                    self.publish
                        .enqueue(PublishEnvelope::new(
                            topics::snapshots(venue, &symbol),
                            payload,
                            Priority::Medium,
                            ts,
                        ))
                        .await;
                }
            }
        }
    }

    async fn run_stats_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let (updates, gaps, largest) = self.sequence.global_stats();
            info!(
                "sequence stats: {updates} updates, {gaps} gaps, largest={largest}; fanout clients={}",
                self.fanout.client_count()
            );
        }
    }
}
