//! Double-buffered command queue.
//!
//! Producers push onto the "writing" side under a short spinlock hold;
//! a single consumer periodically flips the writing and reading sides
//! and drains the reading side without holding the lock. This keeps
//! the lock held only for a `Vec::push`, never for the (potentially
//! large) batch-processing step.
//!
//! This is the queueing discipline the timer wheel and socket reactor
//! use for their command surfaces (`timer_after`/`timer_cancel`,
//! `socket_listen`/`socket_close`, ...): callers on arbitrary threads
//! enqueue commands, and the owning thread drains them once per loop
//! iteration.

use crate::spinlock::SpinLock;

struct Sides<T> {
    a: Vec<T>,
    b: Vec<T>,
    /// `false` -> `a` is being written to, `true` -> `b` is.
    writing_b: bool,
}

/// A double-buffered queue: push from any thread, drain from one.
pub struct FlipBuf<T> {
    sides: SpinLock<Sides<T>>,
}

impl<T> FlipBuf<T> {
    pub fn new() -> Self {
        Self {
            sides: SpinLock::new(Sides {
                a: Vec::new(),
                b: Vec::new(),
                writing_b: false,
            }),
        }
    }

    /// Push a value onto the writing side.
    ///
    /// Returns `true` if the writing side was empty before this push,
    /// i.e. the consumer may be idle and should be woken.
    pub fn write(&self, value: T) -> bool {
        let mut sides = self.sides.lock();
        let was_empty = if sides.writing_b {
            sides.b.is_empty()
        } else {
            sides.a.is_empty()
        };
        if sides.writing_b {
            sides.b.push(value);
        } else {
            sides.a.push(value);
        }
        was_empty
    }

    /// Flip sides and return everything that was written to the
    /// previously-active side. The returned `Vec` is reused as the
    /// new inactive side's backing storage on the next flip.
    pub fn flip(&self) -> Vec<T> {
        let mut sides = self.sides.lock();
        let drained = if sides.writing_b {
            std::mem::take(&mut sides.b)
        } else {
            std::mem::take(&mut sides.a)
        };
        sides.writing_b = !sides.writing_b;
        drained
    }

    /// True if the writing side currently has no pending entries.
    pub fn is_empty(&self) -> bool {
        let sides = self.sides.lock();
        if sides.writing_b {
            sides.b.is_empty()
        } else {
            sides.a.is_empty()
        }
    }
}

impl<T> Default for FlipBuf<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_write_then_flip() {
        let fb: FlipBuf<i32> = FlipBuf::new();
        assert!(fb.write(1));
        assert!(!fb.write(2));
        assert!(!fb.write(3));

        let drained = fb.flip();
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(fb.is_empty());
    }

    #[test]
    fn test_flip_empty() {
        let fb: FlipBuf<i32> = FlipBuf::new();
        let drained = fb.flip();
        assert!(drained.is_empty());
    }

    #[test]
    fn test_write_while_draining_goes_to_other_side() {
        let fb: FlipBuf<i32> = FlipBuf::new();
        fb.write(1);
        fb.write(2);

        let first_batch = fb.flip();
        assert_eq!(first_batch, vec![1, 2]);

        // New writes land on the side that was just vacated.
        fb.write(3);
        let second_batch = fb.flip();
        assert_eq!(second_batch, vec![3]);
    }

    #[test]
    fn test_concurrent_writers() {
        let fb = Arc::new(FlipBuf::new());
        let mut handles = vec![];

        for t in 0..4 {
            let fb = Arc::clone(&fb);
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    fb.write(t * 1000 + i);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let drained = fb.flip();
        assert_eq!(drained.len(), 1000);
    }
}
