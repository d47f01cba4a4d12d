//! Build-then-swap container for read-mostly shared state.
//!
//! Readers clone an `Arc` to the current immutable value and never block each other.
//! Writers build a complete replacement outside any lock shared with readers and swap it
//! in under a brief exclusive section, so a reader sees either the prior or the new value.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

pub struct Snapshot<T> {
    current: RwLock<Arc<T>>,
    writer: Mutex<()>,
}

impl<T> Snapshot<T> {
    pub fn new(initial: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            writer: Mutex::new(()),
        }
    }

    /// The current value. Holding the returned `Arc` keeps that version alive.
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.current.read())
    }

    /// Replace the value wholesale and return the previous one.
    pub fn store(&self, next: T) -> Arc<T> {
        let _writer = self.writer.lock();
        self.swap(Arc::new(next))
    }

    /// Build a replacement from the current value and swap it in.
    ///
    /// Concurrent writers are serialised so no update is lost; readers keep reading the
    /// previous value while `build` runs.
    pub fn rebuild(&self, build: impl FnOnce(&T) -> T) -> Arc<T> {
        let _writer = self.writer.lock();
        let base = self.load();
        let next = Arc::new(build(&base));
        self.swap(next)
    }

    /// Like [`Snapshot::rebuild`] but `build` may decline to produce a replacement.
    pub fn try_rebuild<R>(&self, build: impl FnOnce(&T) -> Option<(T, R)>) -> Option<R> {
        let _writer = self.writer.lock();
        let base = self.load();
        let (next, outcome) = build(&base)?;
        self.swap(Arc::new(next));
        Some(outcome)
    }

    fn swap(&self, next: Arc<T>) -> Arc<T> {
        std::mem::replace(&mut *self.current.write(), next)
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Snapshot").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_store_returns_previous_value() {
        let snapshot = Snapshot::new(vec![1, 2]);
        let previous = snapshot.store(vec![3]);
        assert_eq!(*previous, vec![1, 2]);
        assert_eq!(*snapshot.load(), vec![3]);
    }

    #[test]
    fn test_loaded_value_survives_swap() {
        let snapshot = Snapshot::new(String::from("old"));
        let held = snapshot.load();
        snapshot.store(String::from("new"));
        assert_eq!(held.as_str(), "old");
        assert_eq!(snapshot.load().as_str(), "new");
    }

    #[test]
    fn test_rebuild_serialises_writers() {
        let snapshot = Arc::new(Snapshot::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let snapshot = Arc::clone(&snapshot);
                thread::spawn(move || {
                    for _ in 0..250 {
                        snapshot.rebuild(|n| n + 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread should finish");
        }
        assert_eq!(*snapshot.load(), 2000);
    }

    #[test]
    fn test_readers_never_observe_torn_collection() {
        let snapshot = Arc::new(Snapshot::new(vec![0u32; 512]));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let snapshot = Arc::clone(&snapshot);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut generation = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    generation += 1;
                    snapshot.store(vec![generation; 512]);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let snapshot = Arc::clone(&snapshot);
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        let view = snapshot.load();
                        let first = view[0];
                        assert!(view.iter().all(|v| *v == first), "torn snapshot observed");
                    }
                })
            })
            .collect();

        for reader in readers {
            reader.join().expect("reader thread should finish");
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().expect("writer thread should finish");
    }
}
