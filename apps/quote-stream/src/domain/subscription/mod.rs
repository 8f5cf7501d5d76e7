//! Subscription Registry
//!
//! Maps a subscription key (a symbol or the wildcard) to the callbacks
//! interested in it and fans decoded quotes out to them.
//!
//! # Design
//!
//! The registry tracks:
//! - An ordered callback set per key; a key exists only while its set is
//!   non-empty
//! - First-interest and last-interest transitions, which drive upstream
//!   subscribe and unsubscribe traffic
//! - Wildcard callbacks, which receive every quote and are never sent
//!   upstream
//!
//! Many consumers can register for the same symbol while the connection
//! keeps exactly one upstream subscription for it.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::quote::{Quote, Symbol};

// =============================================================================
// Types
// =============================================================================

/// Token that selects every quote regardless of symbol.
pub const WILDCARD: &str = "*";

/// Key a callback is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKey {
    /// A specific symbol.
    Symbol(Symbol),
    /// Every quote on the connection.
    Wildcard,
}

impl SubscriptionKey {
    /// Key for a symbol, mapping the `*` token to the wildcard.
    #[must_use]
    pub fn symbol(symbol: impl Into<Symbol>) -> Self {
        let symbol = symbol.into();
        if symbol == WILDCARD {
            Self::Wildcard
        } else {
            Self::Symbol(symbol)
        }
    }

    /// The symbol, if this is not the wildcard.
    #[must_use]
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Self::Symbol(symbol) => Some(symbol),
            Self::Wildcard => None,
        }
    }

    /// Check if this is the wildcard key.
    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Symbol(symbol) => f.write_str(symbol),
            Self::Wildcard => f.write_str(WILDCARD),
        }
    }
}

/// Identity of a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    /// Allocate a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

/// A consumer callback invoked for each delivered quote.
///
/// Cloning keeps the identity; two callbacks are equal when their ids are.
#[derive(Clone)]
pub struct QuoteCallback {
    id: CallbackId,
    f: Arc<dyn Fn(&Quote) + Send + Sync>,
}

impl QuoteCallback {
    /// Wrap a closure under a fresh id.
    pub fn new(f: impl Fn(&Quote) + Send + Sync + 'static) -> Self {
        Self {
            id: CallbackId::next(),
            f: Arc::new(f),
        }
    }

    /// Callback identity.
    #[must_use]
    pub const fn id(&self) -> CallbackId {
        self.id
    }

    /// Invoke the callback.
    pub fn call(&self, quote: &Quote) {
        (self.f)(quote);
    }
}

impl PartialEq for QuoteCallback {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QuoteCallback {}

impl fmt::Debug for QuoteCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuoteCallback").field("id", &self.id).finish_non_exhaustive()
    }
}

// =============================================================================
// Fan-out
// =============================================================================

/// Outcome of delivering one quote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Callbacks that returned normally.
    pub delivered: usize,
    /// Callbacks that panicked.
    pub failed: usize,
}

/// Invoke each target once with the quote.
///
/// A panicking callback is contained and counted; the remaining targets
/// still receive the quote.
pub fn deliver(targets: &[QuoteCallback], quote: &Quote) -> FanoutReport {
    let mut report = FanoutReport::default();

    for callback in targets {
        match catch_unwind(AssertUnwindSafe(|| callback.call(quote))) {
            Ok(()) => report.delivered += 1,
            Err(payload) => {
                report.failed += 1;
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::warn!(
                    callback = %callback.id(),
                    symbol = %quote.symbol,
                    reason = %reason,
                    "Quote callback panicked"
                );
            }
        }
    }

    report
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Callback sets keyed by symbol or wildcard.
///
/// # Example
///
/// ```rust
/// use quote_stream::domain::subscription::{QuoteCallback, SubscriptionKey, SubscriptionRegistry};
///
/// let mut registry = SubscriptionRegistry::new();
/// let aapl = SubscriptionKey::symbol("AAPL");
///
/// // First interest in AAPL - send an upstream subscribe
/// assert!(registry.subscribe(aapl.clone(), QuoteCallback::new(|_| {})));
///
/// // Second callback - nothing to send
/// let second = QuoteCallback::new(|_| {});
/// let second_id = second.id();
/// assert!(!registry.subscribe(aapl.clone(), second));
///
/// // Removing one of two callbacks keeps the upstream subscription
/// assert!(!registry.unsubscribe(&aapl, Some(second_id)));
///
/// // Removing the rest withdraws interest - send an upstream unsubscribe
/// assert!(registry.unsubscribe(&aapl, None));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<SubscriptionKey, Vec<QuoteCallback>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback under a key.
    ///
    /// Returns `true` when this is the first callback for the key.
    /// Registering the same callback twice is a no-op.
    pub fn subscribe(&mut self, key: SubscriptionKey, callback: QuoteCallback) -> bool {
        let callbacks = self.entries.entry(key).or_default();
        if callbacks.contains(&callback) {
            return false;
        }

        callbacks.push(callback);
        callbacks.len() == 1
    }

    /// Remove one callback, or every callback when `id` is `None`.
    ///
    /// Returns `true` when the key lost its last callback and was removed.
    pub fn unsubscribe(&mut self, key: &SubscriptionKey, id: Option<CallbackId>) -> bool {
        let Some(callbacks) = self.entries.get_mut(key) else {
            return false;
        };

        match id {
            Some(id) => callbacks.retain(|callback| callback.id() != id),
            None => callbacks.clear(),
        }

        if callbacks.is_empty() {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Callbacks that should receive a quote for `symbol`.
    ///
    /// Symbol callbacks come first in registration order, then wildcard
    /// callbacks. A callback registered under both appears once.
    #[must_use]
    pub fn targets(&self, symbol: &str) -> Vec<QuoteCallback> {
        let specific = self.entries.get(&SubscriptionKey::Symbol(symbol.to_string()));
        let wildcard = self.entries.get(&SubscriptionKey::Wildcard);

        let mut targets: Vec<QuoteCallback> = specific.cloned().unwrap_or_default();
        for callback in wildcard.into_iter().flatten() {
            if !targets.contains(callback) {
                targets.push(callback.clone());
            }
        }
        targets
    }

    /// Deliver a quote to every interested callback.
    pub fn fanout(&self, quote: &Quote) -> FanoutReport {
        deliver(&self.targets(&quote.symbol), quote)
    }

    /// Check if a key has any callbacks.
    #[must_use]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Symbols with at least one callback, sorted. The wildcard is excluded.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self
            .entries
            .keys()
            .filter_map(|key| key.as_symbol().map(ToString::to_string))
            .collect();
        symbols.sort();
        symbols
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            symbol_count: self.entries.keys().filter(|key| !key.is_wildcard()).count(),
            callback_count: self.entries.values().map(Vec::len).sum(),
            wildcard_count: self
                .entries
                .get(&SubscriptionKey::Wildcard)
                .map_or(0, Vec::len),
        }
    }

    /// Check if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every key and callback.
    ///
    /// Returns the symbols that were active.
    pub fn clear(&mut self) -> Vec<Symbol> {
        let symbols = self.active_symbols();
        self.entries.clear();
        symbols
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of symbols with at least one callback.
    pub symbol_count: usize,
    /// Total callbacks, wildcard included.
    pub callback_count: usize,
    /// Callbacks registered under the wildcard.
    pub wildcard_count: usize,
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Owned registration returned by a subscribe call.
///
/// Calling [`SubscriptionHandle::unsubscribe`] or dropping the handle
/// removes exactly that callback, exactly once.
#[must_use = "dropping the handle removes the subscription"]
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    id: CallbackId,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    /// Create a handle that runs `release` when given up.
    pub fn new(key: SubscriptionKey, id: CallbackId, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            key,
            id,
            release: Some(Box::new(release)),
        }
    }

    /// Key the callback was registered under.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Identity of the registered callback.
    #[must_use]
    pub const fn id(&self) -> CallbackId {
        self.id
    }

    /// Remove the subscription now.
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.release.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;

    fn quote(symbol: &str) -> Quote {
        Quote::new(symbol, Decimal::ONE, 0)
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> QuoteCallback {
        let log = Arc::clone(log);
        QuoteCallback::new(move |q| log.lock().unwrap().push(format!("{tag}:{}", q.symbol)))
    }

    #[test]
    fn first_subscribe_reports_first_interest() {
        let mut registry = SubscriptionRegistry::new();

        assert!(registry.subscribe(SubscriptionKey::symbol("AAPL"), QuoteCallback::new(|_| {})));
        assert!(!registry.subscribe(SubscriptionKey::symbol("AAPL"), QuoteCallback::new(|_| {})));
        assert_eq!(registry.active_symbols(), vec!["AAPL".to_string()]);
    }

    #[test]
    fn duplicate_callback_is_ignored() {
        let mut registry = SubscriptionRegistry::new();
        let callback = QuoteCallback::new(|_| {});

        registry.subscribe(SubscriptionKey::symbol("AAPL"), callback.clone());
        registry.subscribe(SubscriptionKey::symbol("AAPL"), callback.clone());

        assert_eq!(registry.stats().callback_count, 1);
        assert!(registry.unsubscribe(&SubscriptionKey::symbol("AAPL"), Some(callback.id())));
    }

    #[test]
    fn unsubscribe_unknown_key_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        assert!(!registry.unsubscribe(&SubscriptionKey::symbol("AAPL"), None));
        assert!(!registry.unsubscribe(&SubscriptionKey::symbol("AAPL"), Some(CallbackId::next())));
    }

    #[test]
    fn unsubscribe_unknown_callback_keeps_entry() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(SubscriptionKey::symbol("AAPL"), QuoteCallback::new(|_| {}));

        assert!(!registry.unsubscribe(&SubscriptionKey::symbol("AAPL"), Some(CallbackId::next())));
        assert!(registry.contains(&SubscriptionKey::symbol("AAPL")));
    }

    #[test]
    fn star_token_maps_to_wildcard() {
        assert_eq!(SubscriptionKey::symbol("*"), SubscriptionKey::Wildcard);
        assert_eq!(SubscriptionKey::Wildcard.to_string(), "*");
    }

    #[test]
    fn wildcard_is_not_an_active_symbol() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(SubscriptionKey::Wildcard, QuoteCallback::new(|_| {}));

        assert!(registry.active_symbols().is_empty());
        assert_eq!(registry.stats().wildcard_count, 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn fanout_orders_symbol_before_wildcard() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(SubscriptionKey::Wildcard, recording(&log, "all"));
        registry.subscribe(SubscriptionKey::symbol("AAPL"), recording(&log, "a1"));
        registry.subscribe(SubscriptionKey::symbol("AAPL"), recording(&log, "a2"));

        let report = registry.fanout(&quote("AAPL"));

        assert_eq!(report.delivered, 3);
        assert_eq!(*log.lock().unwrap(), vec!["a1:AAPL", "a2:AAPL", "all:AAPL"]);
    }

    #[test]
    fn wildcard_receives_unsubscribed_symbols() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(SubscriptionKey::Wildcard, recording(&log, "all"));
        registry.subscribe(SubscriptionKey::symbol("AAPL"), recording(&log, "a"));

        registry.fanout(&quote("TSLA"));

        assert_eq!(*log.lock().unwrap(), vec!["all:TSLA"]);
    }

    #[test]
    fn callback_under_both_keys_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let callback = QuoteCallback::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(SubscriptionKey::symbol("AAPL"), callback.clone());
        registry.subscribe(SubscriptionKey::Wildcard, callback);

        registry.fanout(&quote("AAPL"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(
            SubscriptionKey::symbol("AAPL"),
            QuoteCallback::new(|_| panic!("consumer bug")),
        );
        registry.subscribe(SubscriptionKey::symbol("AAPL"), recording(&log, "ok"));

        let report = registry.fanout(&quote("AAPL"));

        assert_eq!(report, FanoutReport { delivered: 1, failed: 1 });
        assert_eq!(*log.lock().unwrap(), vec!["ok:AAPL"]);
    }

    #[test]
    fn clear_returns_active_symbols() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(SubscriptionKey::symbol("MSFT"), QuoteCallback::new(|_| {}));
        registry.subscribe(SubscriptionKey::symbol("AAPL"), QuoteCallback::new(|_| {}));
        registry.subscribe(SubscriptionKey::Wildcard, QuoteCallback::new(|_| {}));

        assert_eq!(registry.clear(), vec!["AAPL".to_string(), "MSFT".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn handle_releases_once_on_unsubscribe() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let handle = SubscriptionHandle::new(SubscriptionKey::Wildcard, CallbackId::next(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.unsubscribe();

        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_releases_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        {
            let _handle =
                SubscriptionHandle::new(SubscriptionKey::symbol("AAPL"), CallbackId::next(), move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe { key: usize, callback: usize },
        Unsubscribe { key: usize, callback: usize },
        UnsubscribeAll { key: usize },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4usize, 0..3usize).prop_map(|(key, callback)| Op::Subscribe { key, callback }),
            (0..4usize, 0..3usize).prop_map(|(key, callback)| Op::Unsubscribe { key, callback }),
            (0..4usize).prop_map(|key| Op::UnsubscribeAll { key }),
        ]
    }

    fn key_for(index: usize) -> SubscriptionKey {
        match index {
            0 => SubscriptionKey::Wildcard,
            n => SubscriptionKey::symbol(format!("SYM{n}")),
        }
    }

    proptest! {
        #[test]
        fn transitions_match_reference_count_model(ops in proptest::collection::vec(op(), 0..64)) {
            let callbacks: Vec<QuoteCallback> = (0..3).map(|_| QuoteCallback::new(|_| {})).collect();
            let mut registry = SubscriptionRegistry::new();
            let mut model: HashMap<usize, HashSet<usize>> = HashMap::new();

            for op in ops {
                match op {
                    Op::Subscribe { key, callback } => {
                        let set = model.entry(key).or_default();
                        let expected = set.is_empty() && set.insert(callback);
                        set.insert(callback);
                        let first = registry.subscribe(key_for(key), callbacks[callback].clone());
                        prop_assert_eq!(first, expected);
                    }
                    Op::Unsubscribe { key, callback } => {
                        let expected = model.get_mut(&key).is_some_and(|set| {
                            set.remove(&callback) && set.is_empty()
                        });
                        if model.get(&key).is_some_and(HashSet::is_empty) {
                            model.remove(&key);
                        }
                        let last = registry.unsubscribe(&key_for(key), Some(callbacks[callback].id()));
                        prop_assert_eq!(last, expected);
                    }
                    Op::UnsubscribeAll { key } => {
                        let expected = model.remove(&key).is_some();
                        let last = registry.unsubscribe(&key_for(key), None);
                        prop_assert_eq!(last, expected);
                    }
                }
            }

            let mut expected_symbols: Vec<String> = model
                .keys()
                .filter(|key| **key != 0)
                .map(|key| format!("SYM{key}"))
                .collect();
            expected_symbols.sort();
            prop_assert_eq!(registry.active_symbols(), expected_symbols);
        }
    }
}
