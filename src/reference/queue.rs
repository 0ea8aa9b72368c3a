//! [`ReclamationQueue`] is a lock-free channel of reclamation notifications.

use std::sync::atomic::Ordering::{AcqRel, Acquire};

use sdd::{AtomicShared, Guard, Shared, Tag};

/// A notification that the entry identified by `entry_id` has been reclaimed or released.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Reclaimed {
    /// Identifier of the reclaimed entry.
    pub(crate) entry_id: u64,
    /// Segment generation at the time the entry was created.
    pub(crate) generation: u64,
}

/// [`ReclamationQueue`] collects [`Reclaimed`] notifications from any thread.
///
/// Notifications are pushed and polled without blocking; polling order is unspecified.
pub(crate) struct ReclamationQueue {
    newest: AtomicShared<Node>,
}

struct Node {
    reclaimed: Reclaimed,
    next: AtomicShared<Node>,
}

impl ReclamationQueue {
    /// Pushes a notification.
    pub(crate) fn push(&self, reclaimed: Reclaimed) {
        let guard = Guard::new();
        let new_node = Shared::new(Node {
            reclaimed,
            next: AtomicShared::null(),
        });
        let mut newest_ptr = self.newest.load(Acquire, &guard);
        loop {
            new_node
                .next
                .swap((newest_ptr.get_shared(), Tag::None), Acquire);
            match self.newest.compare_exchange(
                newest_ptr,
                (Some(new_node.clone()), Tag::None),
                AcqRel,
                Acquire,
                &guard,
            ) {
                Ok(_) => return,
                Err((_, actual_ptr)) => newest_ptr = actual_ptr,
            }
        }
    }

    /// Pops a single notification.
    ///
    /// Returns `None` if no notification is pending.
    pub(crate) fn poll(&self) -> Option<Reclaimed> {
        let guard = Guard::new();
        let mut newest_ptr = self.newest.load(Acquire, &guard);
        while let Some(newest) = newest_ptr.as_ref() {
            match self.newest.compare_exchange(
                newest_ptr,
                (newest.next.get_shared(Acquire, &guard), Tag::None),
                AcqRel,
                Acquire,
                &guard,
            ) {
                Ok(_) => return Some(newest.reclaimed),
                Err((_, actual_ptr)) => newest_ptr = actual_ptr,
            }
        }
        None
    }

    /// Returns `true` if no notification is pending.
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.newest.is_null(Acquire)
    }
}

impl Default for ReclamationQueue {
    #[inline]
    fn default() -> Self {
        Self {
            newest: AtomicShared::null(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_poll() {
        let queue = ReclamationQueue::default();
        assert!(queue.is_empty());
        assert!(queue.poll().is_none());

        for entry_id in 0..3 {
            queue.push(Reclaimed {
                entry_id,
                generation: 0,
            });
        }
        assert!(!queue.is_empty());

        let mut polled = BTreeSet::new();
        while let Some(reclaimed) = queue.poll() {
            polled.insert(reclaimed.entry_id);
        }
        assert_eq!(polled, (0..3).collect());
        assert!(queue.is_empty());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn concurrent_push_poll() {
        let num_threads = 4;
        let workload_size = 1024;
        let queue = Arc::new(ReclamationQueue::default());
        let producers: Vec<_> = (0..num_threads)
            .map(|t| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..workload_size {
                        queue.push(Reclaimed {
                            entry_id: t * workload_size + i,
                            generation: t,
                        });
                    }
                })
            })
            .collect();

        let mut polled = BTreeSet::new();
        for producer in producers {
            assert!(producer.join().is_ok());
        }
        while let Some(reclaimed) = queue.poll() {
            assert_eq!(reclaimed.entry_id / workload_size, reclaimed.generation);
            assert!(polled.insert(reclaimed.entry_id));
        }
        assert_eq!(polled.len() as u64, num_threads * workload_size);
    }
}
