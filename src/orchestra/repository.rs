use std::{collections::VecDeque, error::Error, fmt, mem, num::NonZeroUsize};

use parking_lot::{Condvar, Mutex};

/// Returned when submitting to, or closing, a repository that's already closed.
///
/// Both cases are protocol violations on the producer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedQueueError;

impl fmt::Display for ClosedQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExampleRepository error: the repository is already closed")
    }
}

impl Error for ClosedQueueError {}

#[derive(Debug)]
struct Backlog<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A bounded FIFO handoff between exactly one producer and any amount of consumers.
///
/// The producer blocks in `submit` while `capacity` items are resident and consumers
/// block in `take` while the repository is empty and still open. Once `close` is called
/// the backlog is still delivered, and only after it's drained does `take` start
/// returning `None`.
///
/// Every item is handed to exactly one consumer, `take` moves it out of the backlog
/// before returning it.
#[derive(Debug)]
pub struct ExampleRepository<T> {
    capacity: NonZeroUsize,
    backlog: Mutex<Backlog<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> ExampleRepository<T> {
    /// Creates a new empty and open `ExampleRepository`.
    ///
    /// # Arguments
    /// * `capacity` - The maximum amount of resident items, `1` makes it a rendezvous.
    ///
    /// # Returns
    /// A new `ExampleRepository` instance.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            backlog: Mutex::new(Backlog {
                items: VecDeque::with_capacity(capacity.get()),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Appends `item` at the tail, blocking while the repository is full.
    ///
    /// # Arguments
    /// * `item` - The item to hand off.
    ///
    /// # Returns
    /// A `ClosedQueueError` if the repository was closed or aborted, before or while waiting
    /// for free space. The item is dropped in that case.
    pub fn submit(&self, item: T) -> Result<(), ClosedQueueError> {
        let mut backlog = self.backlog.lock();

        while !backlog.closed && backlog.items.len() == self.capacity.get() {
            self.not_full.wait(&mut backlog);
        }

        if backlog.closed {
            return Err(ClosedQueueError);
        }

        backlog.items.push_back(item);
        drop(backlog);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the head item, blocking while the repository is empty and open.
    ///
    /// # Returns
    /// The head item, or `None` once the repository is closed and drained. Every
    /// call after that also returns `None` without blocking.
    pub fn take(&self) -> Option<T> {
        let mut backlog = self.backlog.lock();

        loop {
            if let Some(item) = backlog.items.pop_front() {
                drop(backlog);
                self.not_full.notify_one();
                return Some(item);
            }

            if backlog.closed {
                return None;
            }

            self.not_empty.wait(&mut backlog);
        }
    }

    /// Marks the repository as closed, items already submitted are still delivered.
    ///
    /// # Returns
    /// A `ClosedQueueError` if it was already closed.
    pub fn close(&self) -> Result<(), ClosedQueueError> {
        let mut backlog = self.backlog.lock();

        if backlog.closed {
            return Err(ClosedQueueError);
        }

        backlog.closed = true;
        drop(backlog);

        self.not_empty.notify_all();
        self.not_full.notify_all();
        Ok(())
    }

    /// Closes the repository discarding its backlog and wakes up every blocked thread.
    ///
    /// Used for cooperative shutdown when training can't go on, a producer blocked on a
    /// full repository gets released even if no consumer is left. Calling it more than
    /// once is fine.
    ///
    /// # Returns
    /// The amount of discarded items.
    pub fn abort(&self) -> usize {
        let mut backlog = self.backlog.lock();
        backlog.closed = true;
        let discarded = mem::take(&mut backlog.items);
        drop(backlog);

        self.not_empty.notify_all();
        self.not_full.notify_all();
        discarded.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// The amount of resident items.
    pub fn len(&self) -> usize {
        self.backlog.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.backlog.lock().closed
    }

    /// Whether the repository is closed and has no items left to deliver.
    pub fn is_drained(&self) -> bool {
        let backlog = self.backlog.lock();
        backlog.closed && backlog.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    use super::*;

    fn repository<T>(capacity: usize) -> ExampleRepository<T> {
        ExampleRepository::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn test_fifo_delivery() {
        let repo = repository(4);

        for i in 0..4 {
            repo.submit(i).unwrap();
        }
        repo.close().unwrap();

        let taken: Vec<_> = std::iter::from_fn(|| repo.take()).collect();
        assert_eq!(taken, [0, 1, 2, 3]);
    }

    #[test]
    fn test_submit_blocks_while_full() {
        let repo = Arc::new(repository(1));
        let submitted = Arc::new(AtomicBool::new(false));

        repo.submit(1).unwrap();

        let handle = {
            let repo = Arc::clone(&repo);
            let submitted = Arc::clone(&submitted);
            thread::spawn(move || {
                repo.submit(2).unwrap();
                submitted.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!submitted.load(Ordering::SeqCst));
        assert_eq!(repo.len(), 1);

        assert_eq!(repo.take(), Some(1));
        handle.join().unwrap();

        assert!(submitted.load(Ordering::SeqCst));
        assert_eq!(repo.take(), Some(2));
    }

    #[test]
    fn test_close_keeps_the_backlog() {
        let repo = repository(3);

        for c in ['a', 'b', 'c'] {
            repo.submit(c).unwrap();
        }
        repo.close().unwrap();

        assert!(repo.is_closed());
        assert!(!repo.is_drained());
        assert_eq!(repo.take(), Some('a'));
        assert_eq!(repo.take(), Some('b'));
        assert_eq!(repo.take(), Some('c'));
        assert!(repo.is_drained());
        assert_eq!(repo.take(), None);
    }

    #[test]
    fn test_submit_after_close_fails() {
        let repo = repository(2);
        repo.close().unwrap();

        assert_eq!(repo.submit(1), Err(ClosedQueueError));
        assert!(repo.is_empty());
    }

    #[test]
    fn test_double_close_fails() {
        let repo = repository::<u8>(2);
        repo.close().unwrap();
        assert_eq!(repo.close(), Err(ClosedQueueError));
    }

    #[test]
    fn test_drained_take_never_blocks() {
        let repo = repository::<u8>(1);
        repo.close().unwrap();

        for _ in 0..10 {
            assert_eq!(repo.take(), None);
        }
    }

    #[test]
    fn test_close_releases_waiting_consumers() {
        let repo = Arc::new(repository::<u32>(1));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let repo = Arc::clone(&repo);
                thread::spawn(move || repo.take())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        repo.close().unwrap();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), None);
        }
    }

    #[test]
    fn test_abort_releases_a_blocked_producer() {
        let repo = Arc::new(repository(1));
        repo.submit(0).unwrap();

        let handle = {
            let repo = Arc::clone(&repo);
            thread::spawn(move || repo.submit(1))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(repo.abort(), 1);

        assert_eq!(handle.join().unwrap(), Err(ClosedQueueError));
        assert_eq!(repo.take(), None);
        assert_eq!(repo.abort(), 0);
    }
}
