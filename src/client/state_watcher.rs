//! Generic pairwise matcher for coordinated proposals.
//!
//! A caller blocks until some other entry satisfies the match predicate; at
//! that point both callers are released with each other's entries, and the
//! pair is consumed. The predicate runs under the internal lock and must be
//! side-effect-free.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

pub(crate) struct Watcher<T> {
    predicate: fn(&T, &T) -> bool,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    entries: HashMap<u64, Entry<T>>,
    counter: u64,
}

struct Entry<T> {
    value: Arc<T>,
    release: oneshot::Sender<Arc<T>>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MatchTimedOut;

impl<T> Watcher<T> {
    pub fn new(predicate: fn(&T, &T) -> bool) -> Self {
        Watcher {
            predicate,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                counter: 0,
            }),
        }
    }

    /// Blocks until an entry matching `value` is offered by another caller,
    /// returning that entry. Each pair is matched at most once.
    pub async fn await_match(&self, value: T, timeout: Duration) -> Result<Arc<T>, MatchTimedOut> {
        let value = Arc::new(value);
        let (tx, rx) = oneshot::channel();

        let key = {
            let mut inner = self.inner.lock().unwrap();

            let matched = inner
                .entries
                .iter()
                .find(|(_, e)| (self.predicate)(&value, &e.value))
                .map(|(k, _)| *k);
            if let Some(key) = matched {
                let entry = inner.entries.remove(&key).unwrap();
                let _ = entry.release.send(Arc::clone(&value));
                return Ok(entry.value);
            }

            let key = inner.counter;
            inner.counter = inner.counter.checked_add(1).expect("watcher key overflow");
            inner.entries.insert(
                key,
                Entry {
                    value,
                    release: tx,
                },
            );
            key
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(counterpart)) => Ok(counterpart),
            _ => {
                self.inner.lock().unwrap().entries.remove(&key);
                Err(MatchTimedOut)
            }
        }
    }
}
