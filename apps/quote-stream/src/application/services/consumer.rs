//! Quote Consumer
//!
//! Boundary used by rendering code. A consumer keeps one provider
//! subscription per symbol in its current set and merges everything it
//! receives into a keyed map of latest quotes.
//!
//! The consumer holds subscription handles only. Detaching withdraws its
//! interest but never closes the shared connection.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::application::ports::QuoteFeed;
use crate::domain::quote::{Quote, QuoteMap, Symbol};
use crate::domain::streaming::{ConnectionState, ProviderId};
use crate::domain::subscription::{QuoteCallback, SubscriptionHandle, SubscriptionKey};

/// Symbols added and removed by one [`QuoteConsumer::attach`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolDiff {
    /// Newly subscribed symbols, sorted.
    pub added: Vec<Symbol>,
    /// Released symbols, sorted.
    pub removed: Vec<Symbol>,
}

impl SymbolDiff {
    /// Check if the call changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Keeps a symbol set attached to one provider.
pub struct QuoteConsumer {
    feed: Arc<dyn QuoteFeed>,
    provider: ProviderId,
    held: HashMap<Symbol, SubscriptionHandle>,
    quotes: Arc<watch::Sender<QuoteMap>>,
    status: watch::Receiver<ConnectionState>,
    generation: u64,
}

impl std::fmt::Debug for QuoteConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteConsumer")
            .field("provider", &self.provider)
            .field("symbols", &self.symbols())
            .finish_non_exhaustive()
    }
}

impl QuoteConsumer {
    /// Create a detached consumer for `provider`.
    #[must_use]
    pub fn new(feed: Arc<dyn QuoteFeed>, provider: ProviderId) -> Self {
        let generation = feed.generation();
        let status = feed.status(provider);
        let (quotes, _) = watch::channel(QuoteMap::new());
        Self {
            feed,
            provider,
            held: HashMap::new(),
            quotes: Arc::new(quotes),
            status,
            generation,
        }
    }

    /// Attach to exactly `symbols`.
    ///
    /// Only the difference against the current set is subscribed or
    /// released, so repeating a call with the same set does nothing.
    /// If the feed tore its connections down since the last call, every
    /// requested symbol is subscribed again on the new connection.
    /// When symbols are added the connection is brought up in the
    /// background; must be called from within a Tokio runtime.
    pub fn attach<I, S>(&mut self, symbols: I) -> SymbolDiff
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let wanted: BTreeSet<Symbol> = symbols
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();

        let orphaned = self.resync();
        let mut removed: Vec<Symbol> = self
            .held
            .keys()
            .chain(&orphaned)
            .filter(|s| !wanted.contains(*s))
            .cloned()
            .collect();
        removed.sort();
        let added: Vec<Symbol> = wanted
            .into_iter()
            .filter(|s| !self.held.contains_key(s))
            .collect();

        let diff = SymbolDiff { added, removed };
        if diff.is_empty() {
            return diff;
        }

        self.release(&diff.removed);

        for symbol in &diff.added {
            let handle = self.feed.subscribe(
                self.provider,
                SubscriptionKey::symbol(symbol.clone()),
                self.merge_callback(symbol.clone()),
            );
            self.held.insert(symbol.clone(), handle);
        }

        if !diff.added.is_empty() {
            self.spawn_connect();
        }

        tracing::debug!(
            provider = %self.provider,
            added = ?diff.added,
            removed = ?diff.removed,
            "Consumer symbol set changed"
        );
        diff
    }

    /// Release every held subscription and forget all quotes.
    pub fn detach(&mut self) {
        let symbols: Vec<Symbol> = self.held.keys().cloned().collect();
        self.release(&symbols);
    }

    /// Copy of the current quote map.
    #[must_use]
    pub fn snapshot(&self) -> QuoteMap {
        self.quotes.borrow().clone()
    }

    /// Latest quote for one symbol.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<Quote> {
        self.quotes.borrow().get(symbol).cloned()
    }

    /// Watch the quote map.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<QuoteMap> {
        self.quotes.subscribe()
    }

    /// Stream of quote map snapshots, starting with the current one.
    #[must_use]
    pub fn updates(&self) -> WatchStream<QuoteMap> {
        WatchStream::new(self.quotes.subscribe())
    }

    /// Connection state of the provider.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// Check if the provider connection is up.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Symbols currently attached, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.held.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    fn merge_callback(&self, symbol: Symbol) -> QuoteCallback {
        let quotes = Arc::clone(&self.quotes);
        QuoteCallback::new(move |quote: &Quote| {
            quotes.send_modify(|map| {
                map.entry(symbol.clone())
                    .and_modify(|held| held.merge(quote))
                    .or_insert_with(|| quote.clone());
            });
        })
    }

    /// Drop handles left over from a torn-down connection.
    ///
    /// Returns the symbols that were held against it.
    fn resync(&mut self) -> Vec<Symbol> {
        let generation = self.feed.generation();
        if generation == self.generation {
            return Vec::new();
        }

        tracing::debug!(
            provider = %self.provider,
            held = self.held.len(),
            "Feed was torn down, resubscribing consumer"
        );
        self.generation = generation;
        self.status = self.feed.status(self.provider);
        self.held.drain().map(|(symbol, _)| symbol).collect()
    }

    fn release(&mut self, symbols: &[Symbol]) {
        if symbols.is_empty() {
            return;
        }
        for symbol in symbols {
            if let Some(handle) = self.held.remove(symbol) {
                handle.unsubscribe();
            }
        }
        self.forget(symbols);
    }

    fn forget(&self, symbols: &[Symbol]) {
        self.quotes.send_modify(|map| {
            for symbol in symbols {
                map.remove(symbol);
            }
        });
    }

    fn spawn_connect(&self) {
        let provider = self.provider;
        let connecting = self.feed.connect(provider);
        tokio::spawn(async move {
            match connecting.await {
                Ok(()) => tracing::debug!(provider = %provider, "Consumer connection ready"),
                Err(e) => tracing::warn!(provider = %provider, error = %e, "Consumer connection failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::streaming::StreamError;
    use crate::domain::subscription::SubscriptionRegistry;

    /// In-process feed backed by a bare registry.
    #[derive(Default)]
    struct RegistryFeed {
        registry: Arc<Mutex<SubscriptionRegistry>>,
        connects: AtomicUsize,
        first_interest: AtomicUsize,
        generation: AtomicU64,
    }

    impl RegistryFeed {
        fn publish(&self, quote: &Quote) {
            let targets = self.registry.lock().targets(&quote.symbol);
            for target in targets {
                target.call(quote);
            }
        }

        fn tear_down(&self) {
            self.registry.lock().clear();
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl QuoteFeed for RegistryFeed {
        fn connect(&self, _provider: ProviderId) -> BoxFuture<'static, Result<(), StreamError>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn subscribe(
            &self,
            _provider: ProviderId,
            key: SubscriptionKey,
            callback: QuoteCallback,
        ) -> SubscriptionHandle {
            let id = callback.id();
            if self.registry.lock().subscribe(key.clone(), callback) {
                self.first_interest.fetch_add(1, Ordering::SeqCst);
            }
            let registry = Arc::clone(&self.registry);
            let release_key = key.clone();
            SubscriptionHandle::new(key, id, move || {
                registry.lock().unsubscribe(&release_key, Some(id));
            })
        }

        fn status(&self, _provider: ProviderId) -> watch::Receiver<ConnectionState> {
            watch::channel(ConnectionState::Connected).1
        }

        fn generation(&self) -> u64 {
            self.generation.load(Ordering::SeqCst)
        }
    }

    fn consumer(feed: &Arc<RegistryFeed>) -> QuoteConsumer {
        QuoteConsumer::new(Arc::clone(feed) as Arc<dyn QuoteFeed>, ProviderId::JsonControl)
    }

    #[tokio::test]
    async fn attach_diffs_against_previous_set() {
        let feed = Arc::new(RegistryFeed::default());
        let mut consumer = consumer(&feed);

        let diff = consumer.attach(["AAPL", "MSFT"]);
        assert_eq!(diff.added, vec!["AAPL".to_string(), "MSFT".to_string()]);
        assert!(diff.removed.is_empty());

        let diff = consumer.attach(["MSFT", "GOOG"]);
        assert_eq!(diff.added, vec!["GOOG".to_string()]);
        assert_eq!(diff.removed, vec!["AAPL".to_string()]);
        assert_eq!(consumer.symbols(), vec!["GOOG".to_string(), "MSFT".to_string()]);
        assert_eq!(feed.first_interest.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unchanged_set_is_a_noop() {
        let feed = Arc::new(RegistryFeed::default());
        let mut consumer = consumer(&feed);

        consumer.attach(["AAPL"]);
        let diff = consumer.attach(vec!["AAPL".to_string(), "AAPL".to_string()]);

        assert!(diff.is_empty());
        assert_eq!(feed.connects.load(Ordering::SeqCst), 1);
        assert_eq!(feed.registry.lock().stats().callback_count, 1);
    }

    #[tokio::test]
    async fn quotes_merge_into_the_map() {
        let feed = Arc::new(RegistryFeed::default());
        let mut consumer = consumer(&feed);
        consumer.attach(["AAPL"]);

        let full = Quote::new("AAPL", Decimal::new(18950, 2), 1)
            .with_change(Decimal::new(125, 2))
            .with_volume(Decimal::from(1000));
        feed.publish(&full);
        feed.publish(&Quote::new("AAPL", Decimal::new(19000, 2), 2));

        let held = consumer.get("AAPL").expect("quote present");
        assert_eq!(held.price, Decimal::new(19000, 2));
        assert_eq!(held.change, Some(Decimal::new(125, 2)));
        assert_eq!(held.volume, Some(Decimal::from(1000)));
        assert_eq!(held.timestamp_ms, 2);
    }

    #[tokio::test]
    async fn detach_releases_everything_once() {
        let feed = Arc::new(RegistryFeed::default());
        let mut consumer = consumer(&feed);
        consumer.attach(["AAPL", "MSFT"]);
        feed.publish(&Quote::new("AAPL", Decimal::ONE, 1));

        consumer.detach();
        consumer.detach();

        assert!(feed.registry.lock().is_empty());
        assert!(consumer.snapshot().is_empty());
        assert!(consumer.symbols().is_empty());
    }

    #[tokio::test]
    async fn overlapping_consumers_share_interest() {
        let feed = Arc::new(RegistryFeed::default());
        let mut first = consumer(&feed);
        let mut second = consumer(&feed);

        first.attach(["AAPL", "MSFT"]);
        second.attach(["MSFT", "GOOG"]);
        feed.publish(&Quote::new("MSFT", Decimal::TEN, 1));

        assert_eq!(feed.first_interest.load(Ordering::SeqCst), 3);
        assert!(first.get("MSFT").is_some());
        assert!(second.get("MSFT").is_some());

        drop(first);
        assert_eq!(
            feed.registry.lock().active_symbols(),
            vec!["GOOG".to_string(), "MSFT".to_string()]
        );
    }

    #[tokio::test]
    async fn attach_after_teardown_resubscribes() {
        let feed = Arc::new(RegistryFeed::default());
        let mut consumer = consumer(&feed);
        consumer.attach(["AAPL", "MSFT"]);
        feed.publish(&Quote::new("MSFT", Decimal::TEN, 1));

        feed.tear_down();
        let diff = consumer.attach(["AAPL"]);

        assert_eq!(diff.added, vec!["AAPL".to_string()]);
        assert_eq!(diff.removed, vec!["MSFT".to_string()]);
        assert_eq!(feed.registry.lock().active_symbols(), vec!["AAPL".to_string()]);
        assert!(consumer.get("MSFT").is_none());
        assert_eq!(feed.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn state_follows_the_feed() {
        let feed = Arc::new(RegistryFeed::default());
        let consumer = consumer(&feed);
        assert!(consumer.is_live());
    }
}
