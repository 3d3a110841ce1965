// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a FIFO queue of handles, with removal by value and a
//! traversal that tolerates mutation.
//!
//! The queue is a singly-linked list whose nodes live in a slab of
//! slots, linked by index. Released slots are kept on a free list and
//! reused by later insertions, so a queue that has reached its working
//! size never allocates again. In particular, inserting an item
//! straight after removing one always succeeds.
//!
//! The queue stores items by value, but is intended for small handles
//! (such as thread ids) whose owners live elsewhere. It never drops
//! anything other than the handles it was given.
//!
//! # Examples
//!
//! ```
//! use queue::Queue;
//!
//! let mut queue = Queue::new();
//! queue.enqueue('a').unwrap();
//! queue.enqueue('b').unwrap();
//! queue.enqueue('c').unwrap();
//!
//! queue.delete(&'b').unwrap();
//! assert_eq!(queue.dequeue(), Ok('a'));
//! assert_eq!(queue.dequeue(), Ok('c'));
//! assert_eq!(queue.len(), 0);
//! assert!(queue.destroy().is_ok());
//! ```

#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(deprecated_in_future)]
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(missing_abi)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

use std::fmt;
use std::iter::FusedIterator;

/// Describes a failed queue operation.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The queue holds no items.
    Empty,

    /// No item in the queue matched.
    NotFound,

    /// Memory for a new node could not be
    /// allocated.
    ResourceExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Empty => write!(f, "queue is empty"),
            Error::NotFound => write!(f, "item not found in queue"),
            Error::ResourceExhausted => write!(f, "out of memory for queue node"),
        }
    }
}

impl std::error::Error for Error {}

/// Returned by [`Queue::destroy`] when the queue still
/// holds items.
///
/// The queue is handed back unchanged, so its items
/// can still be drained.
///
pub struct NonEmpty<T> {
    queue: Queue<T>,
}

impl<T> NonEmpty<T> {
    /// Returns the queue that could not be destroyed.
    ///
    pub fn into_queue(self) -> Queue<T> {
        self.queue
    }
}

impl<T> fmt::Debug for NonEmpty<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NonEmpty")
            .field("len", &self.queue.len())
            .finish()
    }
}

impl<T> fmt::Display for NonEmpty<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "cannot destroy a queue still holding {} items",
            self.queue.len()
        )
    }
}

impl<T> std::error::Error for NonEmpty<T> {}

// A single link in the queue.
//
struct Node<T> {
    item: T,
    next: Option<usize>,
}

/// An ordered FIFO container.
///
pub struct Queue<T> {
    // Node storage. A slot is `None` while it
    // is on the free list.
    slots: Vec<Option<Node<T>>>,

    // Indices of released slots. The capacity
    // of `free` is kept at least as large as
    // `slots.len()`, so releasing a slot never
    // allocates.
    free: Vec<usize>,

    front: Option<usize>,
    rear: Option<usize>,
    length: usize,
}

impl<T> Queue<T> {
    /// Returns a new, empty queue.
    ///
    /// No memory is allocated until the first item
    /// is added.
    ///
    pub const fn new() -> Self {
        Queue {
            slots: Vec::new(),
            free: Vec::new(),
            front: None,
            rear: None,
            length: 0,
        }
    }

    /// Returns a new, empty queue with room for
    /// `capacity` items.
    ///
    pub fn with_capacity(capacity: usize) -> Self {
        Queue {
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            front: None,
            rear: None,
            length: 0,
        }
    }

    /// Consumes an empty queue.
    ///
    /// If the queue still holds items, it is returned
    /// inside the error.
    ///
    pub fn destroy(self) -> Result<(), NonEmpty<T>> {
        if self.length > 0 {
            return Err(NonEmpty { queue: self });
        }

        Ok(())
    }

    /// Returns the number of items in the queue.
    ///
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns whether the queue holds no items.
    ///
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Appends `item` at the rear of the queue.
    ///
    pub fn enqueue(&mut self, item: T) -> Result<(), Error> {
        let node = Node { item, next: None };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                index
            }
            None => {
                let needed = (self.slots.len() + 1).saturating_sub(self.free.len());
                self.slots
                    .try_reserve(1)
                    .map_err(|_| Error::ResourceExhausted)?;
                self.free
                    .try_reserve(needed)
                    .map_err(|_| Error::ResourceExhausted)?;
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        match self.rear {
            Some(rear) => self.node_mut(rear).next = Some(index),
            None => self.front = Some(index),
        }

        self.rear = Some(index);
        self.length += 1;

        Ok(())
    }

    /// Removes and returns the item at the front of
    /// the queue.
    ///
    pub fn dequeue(&mut self) -> Result<T, Error> {
        let front = self.front.ok_or(Error::Empty)?;
        let node = self.release(front);
        self.front = node.next;
        if self.front.is_none() {
            self.rear = None;
        }

        self.length -= 1;

        Ok(node.item)
    }

    /// Removes the first item equal to `item`, wherever
    /// it is in the queue.
    ///
    /// The order of the remaining items is unchanged.
    ///
    pub fn delete(&mut self, item: &T) -> Result<(), Error>
    where
        T: PartialEq,
    {
        if self.front.is_none() {
            return Err(Error::Empty);
        }

        let mut prev = None;
        let mut cursor = self.front;
        while let Some(index) = cursor {
            let node = self.node(index);
            let next = node.next;
            if node.item != *item {
                prev = Some(index);
                cursor = next;
                continue;
            }

            match prev {
                Some(prev) => self.node_mut(prev).next = next,
                None => self.front = next,
            }

            if self.rear == Some(index) {
                self.rear = prev;
            }

            self.release(index);
            self.length -= 1;

            return Ok(());
        }

        Err(Error::NotFound)
    }

    /// Calls `predicate` on each item, from front to rear,
    /// returning the first item for which it returns `true`.
    ///
    /// The predicate is also given the queue, so it may
    /// delete or re-enqueue the item it is called with.
    /// The link to the following item is read before the
    /// predicate runs, so doing so does not disturb the
    /// traversal. Removing any other item from inside the
    /// predicate leaves the rest of the traversal
    /// unspecified.
    ///
    /// Returns `None` if no item matched.
    ///
    pub fn iterate<F>(&mut self, mut predicate: F) -> Option<T>
    where
        T: Clone,
        F: FnMut(&mut Queue<T>, &T) -> bool,
    {
        let mut cursor = self.front;
        while let Some(index) = cursor {
            let (item, next) = match self.slots.get(index).and_then(Option::as_ref) {
                Some(node) => (node.item.clone(), node.next),
                None => break,
            };

            cursor = next;
            if predicate(self, &item) {
                return Some(item);
            }
        }

        None
    }

    /// Returns an iterator over the items, from front
    /// to rear.
    ///
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.front,
            remaining: self.length,
        }
    }

    fn node(&self, index: usize) -> &Node<T> {
        match &self.slots[index] {
            Some(node) => node,
            None => unreachable!("queue link to released slot {}", index),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<T> {
        match &mut self.slots[index] {
            Some(node) => node,
            None => unreachable!("queue link to released slot {}", index),
        }
    }

    // Takes the node out of its slot and puts the
    // slot on the free list. The caller is responsible
    // for the links.
    //
    fn release(&mut self, index: usize) -> Node<T> {
        let node = match self.slots[index].take() {
            Some(node) => node,
            None => unreachable!("queue slot {} released twice", index),
        };

        self.free.push(index);

        node
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'queue, T> IntoIterator for &'queue Queue<T> {
    type Item = &'queue T;
    type IntoIter = Iter<'queue, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// An iterator over the items in a [`Queue`], from
/// front to rear.
///
pub struct Iter<'queue, T> {
    queue: &'queue Queue<T>,
    cursor: Option<usize>,
    remaining: usize,
}

impl<'queue, T> Iterator for Iter<'queue, T> {
    type Item = &'queue T;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.queue.node(index);
        self.cursor = node.next;
        self.remaining -= 1;

        Some(&node.item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'queue, T> ExactSizeIterator for Iter<'queue, T> {}

impl<'queue, T> FusedIterator for Iter<'queue, T> {}
