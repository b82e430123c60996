use std::{marker::PhantomData, ptr::NonNull};

use crate::Pointer;

/// Linked list node. See also [`crate::header::Header<T>`].
pub struct Node<T> {
    pub next: Pointer<Self>,
    pub prev: Pointer<Self>,
    pub data: T,
}

/// Intrusive doubly linked list used for everything this crate threads
/// through arena memory: free and allocated node lists, and the nested heap
/// index of every heap. Nodes never point back to the list, so the list value
/// itself can be moved or copied freely as long as only one copy is used to
/// mutate.
///
/// The list cannot allocate (WE ARE THE ALLOCATOR!), so every node lives
/// somewhere in an arena and the caller tells us where. All the mutating
/// functions are unsafe for the same reason: the caller must guarantee that
/// the nodes are valid and that a node is only ever linked into one list.
#[derive(Clone, Copy)]
pub struct LinkedList<T> {
    pub head: Pointer<Node<T>>,
    pub tail: Pointer<Node<T>>,
    pub len: usize,
    marker: PhantomData<T>,
}

impl<T> LinkedList<T> {
    /// Creates an empty linked list.
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    /// First node of the list.
    #[inline]
    pub fn first(&self) -> Pointer<Node<T>> {
        self.head
    }

    /// Last node of the list.
    #[inline]
    pub fn last(&self) -> Pointer<Node<T>> {
        self.tail
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes an unlinked node holding `data` at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be valid for writes of [`Node<T>`] and suitably
    /// aligned.
    pub unsafe fn write(data: T, address: NonNull<u8>) -> NonNull<Node<T>> {
        let node = address.cast::<Node<T>>();

        node.as_ptr().write(Node {
            next: None,
            prev: None,
            data,
        });

        node
    }

    /// Writes a new node at `address` and appends it.
    ///
    /// # Safety
    ///
    /// See [`Self::write`].
    pub unsafe fn append(&mut self, data: T, address: NonNull<u8>) -> NonNull<Node<T>> {
        let node = Self::write(data, address);
        self.push_back(node);
        node
    }

    /// Links an unlinked `node` at the front.
    ///
    /// # Safety
    ///
    /// `node` must be valid and not part of any list.
    pub unsafe fn push_front(&mut self, mut node: NonNull<Node<T>>) {
        node.as_mut().prev = None;
        node.as_mut().next = self.head;

        match self.head {
            Some(mut head) => head.as_mut().prev = Some(node),
            None => self.tail = Some(node),
        }

        self.head = Some(node);
        self.len += 1;
    }

    /// Links an unlinked `node` at the back.
    ///
    /// # Safety
    ///
    /// `node` must be valid and not part of any list.
    pub unsafe fn push_back(&mut self, mut node: NonNull<Node<T>>) {
        node.as_mut().next = None;
        node.as_mut().prev = self.tail;

        match self.tail {
            Some(mut tail) => tail.as_mut().next = Some(node),
            None => self.head = Some(node),
        }

        self.tail = Some(node);
        self.len += 1;
    }

    /// Links `node` right after `after`. `None` means "at the front".
    ///
    /// # Safety
    ///
    /// `after` must belong to this list, `node` must be unlinked.
    pub unsafe fn insert_after(&mut self, after: Pointer<Node<T>>, mut node: NonNull<Node<T>>) {
        let Some(mut after) = after else {
            return self.push_front(node);
        };

        let next = after.as_ref().next;
        node.as_mut().prev = Some(after);
        node.as_mut().next = next;
        after.as_mut().next = Some(node);

        match next {
            Some(mut next) => next.as_mut().prev = Some(node),
            None => self.tail = Some(node),
        }

        self.len += 1;
    }

    /// Links `node` right before `before`. `None` means "at the back".
    ///
    /// # Safety
    ///
    /// `before` must belong to this list, `node` must be unlinked.
    pub unsafe fn insert_before(&mut self, before: Pointer<Node<T>>, mut node: NonNull<Node<T>>) {
        let Some(mut before) = before else {
            return self.push_back(node);
        };

        let prev = before.as_ref().prev;
        node.as_mut().next = Some(before);
        node.as_mut().prev = prev;
        before.as_mut().prev = Some(node);

        match prev {
            Some(mut prev) => prev.as_mut().next = Some(node),
            None => self.head = Some(node),
        }

        self.len += 1;
    }

    /// Removes `node` from the linked list and clears its links.
    ///
    /// # Safety
    ///
    /// `node` must be valid and belong to this list.
    pub unsafe fn remove(&mut self, mut node: NonNull<Node<T>>) {
        let prev = node.as_ref().prev;
        let next = node.as_ref().next;

        match prev {
            Some(mut prev) => prev.as_mut().next = next,
            None => self.head = next,
        }

        match next {
            Some(mut next) => next.as_mut().prev = prev,
            None => self.tail = prev,
        }

        node.as_mut().prev = None;
        node.as_mut().next = None;
        self.len -= 1;
    }

    /// Iterates from head to tail. The next pointer is read before a node is
    /// yielded, so the yielded node may be unlinked by the caller.
    ///
    /// # Safety
    ///
    /// The list must not be modified through other nodes during iteration.
    pub unsafe fn iter(&self) -> Iter<T> {
        Iter {
            current: self.head,
            backwards: false,
            marker: PhantomData,
        }
    }

    /// Same as [`Self::iter`] from tail to head.
    ///
    /// # Safety
    ///
    /// See [`Self::iter`].
    pub unsafe fn iter_rev(&self) -> Iter<T> {
        Iter {
            current: self.tail,
            backwards: true,
            marker: PhantomData,
        }
    }
}

impl<T> Default for LinkedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the raw nodes of a [`LinkedList`].
pub struct Iter<T> {
    current: Pointer<Node<T>>,
    backwards: bool,
    marker: PhantomData<T>,
}

impl<T> Iterator for Iter<T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        self.current = unsafe {
            if self.backwards {
                node.as_ref().prev
            } else {
                node.as_ref().next
            }
        };

        Some(node)
    }
}
