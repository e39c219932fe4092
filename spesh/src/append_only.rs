//! A fixed-capacity list that readers can iterate without taking a lock.
//!
//! Writers are serialised by a mutex. A new element is fully stored in its slot before the length
//! is published with a release store; readers load the length with acquire ordering and so never
//! see a partially constructed element.

use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    OnceLock,
};

pub(crate) struct AppendOnly<T> {
    slots: Box<[OnceLock<T>]>,
    len: AtomicUsize,
    write_lock: Mutex<()>,
}

impl<T> AppendOnly<T> {
    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self {
            slots: (0..cap).map(|_| OnceLock::new()).collect(),
            len: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Append `v`, returning its index, or give it back if the list is full.
    pub(crate) fn push(&self, v: T) -> Result<usize, T> {
        let _lk = self.write_lock.lock();
        let idx = self.len.load(Ordering::Relaxed);
        let Some(slot) = self.slots.get(idx) else {
            return Err(v);
        };
        slot.set(v)?;
        self.len.store(idx + 1, Ordering::Release);
        Ok(idx)
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&T> {
        if idx < self.len() {
            self.slots[idx].get()
        } else {
            None
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots[..self.len()].iter().filter_map(OnceLock::get)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn push_until_full() {
        let l = AppendOnly::with_capacity(2);
        assert_eq!(l.push(1), Ok(0));
        assert_eq!(l.push(2), Ok(1));
        assert_eq!(l.push(3), Err(3));
        assert_eq!(l.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(l.get(1), Some(&2));
        assert_eq!(l.get(2), None);
    }

    #[test]
    fn concurrent_readers() {
        let l = Arc::new(AppendOnly::with_capacity(64));
        let reader = {
            let l = Arc::clone(&l);
            thread::spawn(move || {
                let mut seen = 0;
                while seen < 64 {
                    let n = l.iter().count();
                    assert!(n >= seen);
                    seen = n;
                }
            })
        };
        for i in 0..64 {
            l.push(vec![i; 16]).unwrap();
        }
        reader.join().unwrap();
        assert!(l.iter().enumerate().all(|(i, v)| v == &vec![i; 16]));
    }
}
