use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use super::AdjudicatorEvent;

/// Merged adjudicator event stream over several backends.
///
/// Each backend feeds one slot. An arriving event replaces the slot's
/// occupant iff it has a newer version, or the same version with a later
/// timeout; older events are dropped on arrival. So per backend at most one
/// event is ever queued.
pub struct EventSub {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    slots: Mutex<Vec<Option<AdjudicatorEvent>>>,
    notify: Notify,
    live: AtomicUsize,
}

impl EventSub {
    pub(crate) fn new(receivers: Vec<mpsc::Receiver<AdjudicatorEvent>>) -> Self {
        let inner = Arc::new(Inner {
            slots: Mutex::new(vec![None; receivers.len()]),
            notify: Notify::new(),
            live: AtomicUsize::new(receivers.len()),
        });

        let tasks = receivers
            .into_iter()
            .enumerate()
            .map(|(slot_idx, mut rx)| {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        inner.offer(slot_idx, event);
                    }
                    inner.live.fetch_sub(1, Ordering::SeqCst);
                    inner.notify.notify_one();
                })
            })
            .collect();

        EventSub { inner, tasks }
    }

    /// The next queued event, or `None` once every backend stream closed.
    pub async fn next(&mut self) -> Option<AdjudicatorEvent> {
        loop {
            {
                let mut slots = self.inner.slots.lock().unwrap();
                if let Some(slot) = slots.iter_mut().find(|s| s.is_some()) {
                    return slot.take();
                }
            }
            if self.inner.live.load(Ordering::SeqCst) == 0 {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }
}

impl Inner {
    fn offer(&self, slot_idx: usize, event: AdjudicatorEvent) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[slot_idx];
        let replace = match slot.as_ref() {
            None => true,
            Some(queued) => {
                event.version() > queued.version()
                    || (event.version() == queued.version() && event.timeout() > queued.timeout())
            }
        };
        if replace {
            *slot = Some(event);
            drop(slots);
            self.notify.notify_one();
        }
    }
}

impl Drop for EventSub {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
