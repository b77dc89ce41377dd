//! A triple buffer with explicit commits
//!
//! In this crate, we implement a triple buffering mechanism suitable for
//! handing the latest value of some data from one single producer thread to one
//! single consumer thread, without either of them ever blocking the other.
//!
//! The producer prepares a value in its private "back" slot, then publishes it
//! by committing it into the shared "middle" slot. The consumer asks for the
//! latest value whenever it likes, and either gets a freshly committed value
//! or the one it has already seen, which lives in its private "front" slot.
//! Values which the consumer did not get around to reading before the next
//! commit are dropped on the floor.
//!
//! ```
//! use triplebuf::TripleBuffer;
//!
//! // Create a buffer and split it into a producer and a consumer
//! let (mut producer, mut consumer) = TripleBuffer::new().split();
//!
//! // Nothing has been published yet
//! assert_eq!(consumer.read(), (None, false));
//!
//! // The producer prepares a value, then publishes it
//! producer.write(42);
//! producer.commit().unwrap();
//!
//! // The consumer gets the new value once, then sees it as stale
//! assert_eq!(consumer.read(), (Some(&42), true));
//! assert_eq!(consumer.read(), (Some(&42), false));
//! ```
//!
//! Producer and consumer can be moved to different threads:
//!
//! ```
//! use std::thread;
//! use triplebuf::TripleBuffer;
//!
//! let (mut producer, mut consumer) = TripleBuffer::<u32>::new().split();
//!
//! let writer = thread::spawn(move || {
//!     for value in 1..=100 {
//!         producer.write(value);
//!         producer.commit().unwrap();
//!     }
//! });
//!
//! // The consumer polls until it has seen the last value, possibly skipping
//! // some of the intermediate ones
//! let mut last_seen = 0;
//! while last_seen < 100 {
//!     if let (Some(&value), true) = consumer.read() {
//!         assert!(value > last_seen);
//!         last_seen = value;
//!     }
//! }
//! writer.join().unwrap();
//! ```

#![deny(missing_debug_implementations, missing_docs)]

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// A triple buffer, useful for nonblocking and thread-safe data sharing
///
/// A triple buffer is a single-producer single-consumer nonblocking
/// communication channel which behaves like a shared variable: the producer
/// commits regular updates, the consumer accesses the latest available value
/// at any time.
///
/// The producer and consumer halves are what one uses in practice. They can be
/// extracted with [`split()`](TripleBuffer::split) and moved to their own
/// threads. For single-threaded use, the buffer also forwards the producer and
/// consumer operations directly.
///
/// ```
/// use triplebuf::TripleBuffer;
///
/// // Pre-populate all three slots, the middle one being treated as pending
/// let mut buf = TripleBuffer::new_populated(Some('b'), Some('m'), Some('f'));
/// assert_eq!(buf.read(), (Some(&'m'), true));
///
/// // A commit publishes the back value, the old front is recycled
/// buf.commit().unwrap();
/// assert_eq!(buf.read(), (Some(&'b'), true));
/// ```
///
#[derive(Debug)]
pub struct TripleBuffer<T: Send> {
    producer: Producer<T>,
    consumer: Consumer<T>,
}
//
impl<T: Send> TripleBuffer<T> {
    /// Construct a triple buffer whose three slots are empty
    pub fn new() -> Self {
        Self::new_populated(None, None, None)
    }

    /// Construct a triple buffer whose front slot already holds a value
    ///
    /// The consumer can read this value right away, before the producer has
    /// committed anything. It is reported as stale.
    ///
    pub fn new_with_front(front: T) -> Self {
        Self::new_populated(None, None, Some(front))
    }

    /// Construct a triple buffer with arbitrary contents in each slot
    ///
    /// The middle slot is considered pending if and only if `middle` holds a
    /// value. A back value counts as freshly produced, so it may be committed
    /// without a prior `write`.
    ///
    pub fn new_populated(back: Option<T>, middle: Option<T>, front: Option<T>) -> Self {
        // The middle slot is pending iff something has been put there
        let middle_info = MIDDLE_IDX | if middle.is_some() { PENDING_BIT } else { 0 };
        let back_is_fresh = back.is_some();

        // Start with the shared state...
        let shared_state = Arc::new(SharedState {
            slots: [
                UnsafeCell::new(back),
                UnsafeCell::new(middle),
                UnsafeCell::new(front),
            ],
            middle_info: CachePadded::new(AtomicMiddleInfo::new(middle_info)),
        });
        log::trace!("Created triple buffer with middle slot info {middle_info:#04b}");

        // ...then construct the producer and consumer structs
        Self {
            producer: Producer {
                shared: shared_state.clone(),
                back_idx: BACK_IDX,
                back_is_fresh,
            },
            consumer: Consumer {
                shared: shared_state,
                front_idx: FRONT_IDX,
            },
        }
    }

    /// Extract the producer and consumer halves of the triple buffer
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        (self.producer, self.consumer)
    }

    /// Store a value into the back slot, see [`Producer::write()`]
    pub fn write(&mut self, value: T) {
        self.producer.write(value)
    }

    /// Publish the back slot, see [`Producer::commit()`]
    pub fn commit(&mut self) -> Result<(), InvalidCommit> {
        self.producer.commit()
    }

    /// Fetch the latest value, see [`Consumer::read()`]
    pub fn read(&mut self) -> (Option<&T>, bool) {
        self.consumer.read()
    }
}
//
impl<T: Send> Default for TripleBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
//
// Raw slot accessors, only meant for checking the buffer's internal state.
//
// They are sound because both halves are owned by the TripleBuffer, so a shared
// reference to it guarantees that nobody is mutating any slot.
//
#[cfg(test)]
impl<T: Send> TripleBuffer<T> {
    fn back(&self) -> Option<&T> {
        unsafe { self.producer.shared.slot(self.producer.back_idx) }.as_ref()
    }

    fn middle(&self) -> (Option<&T>, bool) {
        let shared_state = &*self.producer.shared;
        let middle_info = shared_state.middle_info.load(Ordering::Relaxed);
        let value = unsafe { shared_state.slot(middle_info & INDEX_MASK) }.as_ref();
        (value, middle_info & PENDING_BIT != 0)
    }

    fn front(&self) -> Option<&T> {
        unsafe { self.consumer.shared.slot(self.consumer.front_idx) }.as_ref()
    }
}

/// Producer interface to the triple buffer
///
/// The producer of data can use this struct to prepare a value in the back
/// slot and publish it whenever it likes. Publication is wait-free: a
/// collision between the producer and the consumer will result in cache
/// contention, but deadlocks and scheduling-induced slowdowns cannot happen.
///
pub struct Producer<T: Send> {
    /// Shared state
    shared: Arc<SharedState<T>>,

    /// Index of the back slot, which is private to the producer
    back_idx: SlotIndex,

    /// Truth that the back slot was filled since the last commit
    back_is_fresh: bool,
}
//
impl<T: Send> Producer<T> {
    /// Store a value into the back slot
    ///
    /// Whatever the back slot held before, be it an uncommitted value or a
    /// value salvaged by the last commit, is dropped. The new value is not
    /// visible to the consumer until [`commit()`](Producer::commit) is called.
    ///
    pub fn write(&mut self, value: T) {
        *self.back_slot_mut() = Some(value);
        self.back_is_fresh = true;
    }

    /// Access the back slot for in-place production
    ///
    /// After a commit, the back slot holds whatever value was displaced from
    /// the middle slot, if any. This lets the producer reuse that value's
    /// storage (e.g. a `Vec` allocation) instead of building a new one. When
    /// a value is returned, it is considered freshly produced and may be
    /// committed.
    ///
    pub fn back_mut(&mut self) -> Option<&mut T> {
        let back = unsafe { self.shared.slot_mut(self.back_idx) }.as_mut();
        if back.is_some() {
            self.back_is_fresh = true;
        }
        back
    }

    /// Publish the back slot's value to the consumer
    ///
    /// The back value and the middle slot are exchanged in one atomic step.
    /// The value which was in the middle slot, if any, becomes the new back
    /// value: it is salvaged for reuse, not guaranteed to have been read. A
    /// pending value which the consumer did not read yet is thereby discarded.
    ///
    /// Committing fails if nothing was produced since the last commit (or
    /// since construction), which includes every case where the back slot is
    /// empty. The buffer is left untouched in that case.
    ///
    pub fn commit(&mut self) -> Result<(), InvalidCommit> {
        // Refuse to re-publish stale or missing data
        if !self.back_is_fresh {
            log::debug!("Rejected a commit with nothing produced since the last one");
            return Err(InvalidCommit);
        }
        debug_assert!(unsafe { self.shared.slot(self.back_idx) }.is_some());

        // Swap the back slot and the middle slot. This makes the new data
        // available to the consumer and gives us a new back slot. Release
        // ordering makes our write visible to the consumer, acquire ordering
        // makes sure that the consumer is done with the slot we get back.
        let former_middle_info = self
            .shared
            .middle_info
            .swap(self.back_idx | PENDING_BIT, Ordering::AcqRel);
        self.back_idx = former_middle_info & INDEX_MASK;
        self.back_is_fresh = false;

        log::trace!(
            "Committed a value, {} middle slot salvaged",
            if former_middle_info & PENDING_BIT != 0 {
                "unread"
            } else {
                "consumed"
            }
        );
        Ok(())
    }

    /// Check whether the last committed value has been read by the consumer
    ///
    /// This is only a snapshot: the consumer may pick the value up right after
    /// this function returns `false`.
    ///
    pub fn consumed(&self) -> bool {
        let middle_info = self.shared.middle_info.load(Ordering::Relaxed);
        middle_info & PENDING_BIT == 0
    }

    /// Exclusive access to the back slot
    fn back_slot_mut(&mut self) -> &mut Option<T> {
        // This is safe because the back slot is private to the producer, and
        // &mut self guarantees that there is only one user of the producer.
        unsafe { self.shared.slot_mut(self.back_idx) }
    }
}
//
impl<T: Send + fmt::Debug> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The producer may only look at the back slot
        let back = unsafe { self.shared.slot(self.back_idx) };
        f.debug_struct("Producer")
            .field("back", back)
            .field("back_is_fresh", &self.back_is_fresh)
            .finish_non_exhaustive()
    }
}

/// Consumer interface to the triple buffer
///
/// The consumer of data can use this struct to access the latest committed
/// value whenever it likes. Readout is wait-free: a collision between the
/// producer and consumer will result in cache contention, but deadlocks and
/// scheduling-induced slowdowns cannot happen.
///
pub struct Consumer<T: Send> {
    /// Shared state
    shared: Arc<SharedState<T>>,

    /// Index of the front slot, which is private to the consumer
    front_idx: SlotIndex,
}
//
impl<T: Send> Consumer<T> {
    /// Access the latest value
    ///
    /// If a value was committed since the last read, it becomes the new front
    /// value and the returned flag is `true`. Otherwise, the current front
    /// value is returned again with a `false` flag, and nothing is modified.
    ///
    /// The front value is `None` until something has been committed, unless
    /// the buffer was constructed with a front value.
    ///
    pub fn read(&mut self) -> (Option<&T>, bool) {
        // Check if the producer has committed an update. Only we ever clear
        // the pending bit, so it cannot go away before the swap below.
        let pending = self.has_pending();

        // If an update is pending, make the middle slot our front slot
        if pending {
            // Swap the middle slot and the front slot. We get exclusive read
            // access to the new data, and the producer gets a stale slot to
            // salvage. Acquire ordering makes the committed value visible,
            // release ordering hands our former front over to the producer.
            let former_middle_info = self
                .shared
                .middle_info
                .swap(self.front_idx, Ordering::AcqRel);
            debug_assert!(former_middle_info & PENDING_BIT != 0);
            self.front_idx = former_middle_info & INDEX_MASK;
            log::trace!("Delivered a freshly committed value");
        }

        (self.peek(), pending)
    }

    /// Check whether a value was committed since the last read
    ///
    /// A `true` answer stays valid until the next [`read()`](Consumer::read).
    /// A `false` answer is only a snapshot.
    ///
    pub fn has_pending(&self) -> bool {
        let middle_info = self.shared.middle_info.load(Ordering::Relaxed);
        middle_info & PENDING_BIT != 0
    }

    /// Access the current front value without checking for updates
    pub fn peek(&self) -> Option<&T> {
        // This is safe because the front slot is private to the consumer, and
        // the producer cannot get hold of it before the next read(), which
        // requires &mut self.
        unsafe { self.shared.slot(self.front_idx) }.as_ref()
    }
}
//
impl<T: Send + fmt::Debug> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("front", &self.peek())
            .finish_non_exhaustive()
    }
}

/// Error returned when committing with nothing new in the back slot
///
/// This is a bug in the producer's logic, not a transient condition. Retrying
/// without writing a value first will fail again.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("cannot commit: nothing was written to the back slot since the last commit")]
pub struct InvalidCommit;

/// Triple buffer shared state
///
/// In a triple buffering communication protocol, the producer and consumer
/// share the following storage:
///
/// - Three slots suitable for storing the data at hand
/// - One atomic byte identifying the middle slot, which neither the producer
///   nor the consumer is currently using, along with its pending flag
///
struct SharedState<T: Send> {
    /// Data storage slots
    slots: [UnsafeCell<Option<T>>; 3],

    /// Index of the middle slot and pending flag, replaced as a whole
    middle_info: CachePadded<AtomicMiddleInfo>,
}
//
impl<T: Send> SharedState<T> {
    /// Shared access to a slot
    ///
    /// # Safety
    ///
    /// The caller must own the slot (back for the producer, front for the
    /// consumer), or otherwise guarantee that nobody is mutating it.
    ///
    unsafe fn slot(&self, idx: SlotIndex) -> &Option<T> {
        &*self.slots[idx as usize].get()
    }

    /// Exclusive access to a slot
    ///
    /// # Safety
    ///
    /// The caller must own the slot and hold no other reference to it.
    ///
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot_mut(&self, idx: SlotIndex) -> &mut Option<T> {
        &mut *self.slots[idx as usize].get()
    }
}
//
// The slots are only ever accessed by their owner, according to the protocol
// above, so moving a producer or consumer to another thread amounts to moving
// values of type T around. Sharing one by reference hands out &T.
//
unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send + Sync> Sync for Producer<T> {}
unsafe impl<T: Send> Send for Consumer<T> {}
unsafe impl<T: Send + Sync> Sync for Consumer<T> {}

/// Slot index, packed together with the pending flag in the middle slot info
type SlotIndex = u8;
type AtomicMiddleInfo = AtomicU8;

/// Initial slot assignment
const BACK_IDX: SlotIndex = 0;
const MIDDLE_IDX: SlotIndex = 1;
const FRONT_IDX: SlotIndex = 2;

/// Middle slot info layout
const INDEX_MASK: u8 = 0b11;
const PENDING_BIT: u8 = 0b100;
