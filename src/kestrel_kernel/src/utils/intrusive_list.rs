//! Intrusive circular doubly-linked list.
//!
//! The nodes of a list are embedded in the listed objects themselves; the list
//! is manipulated through [`ListAccessorCell`], which combines a head cell, a
//! "pool" that resolves an abstract index type to an element, and a projection
//! from an element to its link cell. This lets the same code serve lists of
//! `&'static` control blocks and lists of stack-borrowed wait objects, with
//! the link cells guarded by whatever cell discipline the caller uses (plain
//! `Cell` in tests, CPU Lock token cells in the kernel).
//!
//! All mutation must happen inside a critical section; the accessor does not
//! provide any synchronization of its own.
#![allow(dead_code)]
use core::{fmt, ops};

use super::Init;

/// Circular linked list header.
#[derive(Copy, Clone)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self { first: None };
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to the neighbor items of a linked node.
///
/// A node that is not part of any list has no `Link` at all (the link cell
/// holds `None`), which is what makes unlink-on-every-exit-path cleanup safe:
/// removing an already-removed node is reported as [`ItemError::NotLinked`]
/// instead of corrupting the structure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// A virtual container of `T`s that can be indexed by `Ident<&'static T>`.
#[derive(Debug, Clone, Copy)]
pub struct Static;

impl<T> ops::Index<Ident<&'static T>> for Static {
    type Output = T;

    fn index(&self, index: Ident<&'static T>) -> &Self::Output {
        index.0
    }
}

/// Reference wrapper that implements `PartialEq` and `Eq` by identity
/// comparison.
#[derive(Clone, Copy)]
pub struct Ident<T>(pub T);

impl<T> fmt::Debug for Ident<&'_ T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Do not print the pointee. This is a safe measure against infinite
        // recursion.
        f.debug_tuple("Ident").field(&(self.0 as *const T)).finish()
    }
}

impl<T: ?Sized> PartialEq for Ident<&'_ T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl<T: ?Sized> Eq for Ident<&'_ T> {}

/// Circular linked list header where elements are linked by
/// [`StaticLink`]`<Element>` (a pair of `&'static Element`).
pub type StaticListHead<Element> = ListHead<Ident<&'static Element>>;

/// Links to neighbor items with a `'static` lifetime.
pub type StaticLink<Element> = Link<Ident<&'static Element>>;

/// Abstraction over cells whose contents are read and written under some
/// key — `()` for a plain `Cell`, a CPU Lock token for the kernel's cells.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    #[inline]
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T
    where
        Self: Sized,
    {
        let mut x = self.get(key);
        let ret = f(&mut x);
        self.set(key, x);
        ret
    }
}

impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<'a, Element: Clone, Keyhole, Key> CellLike<&'a mut Key>
    for tokenlock::UnsyncTokenLock<Element, Keyhole>
where
    Key: tokenlock::Token<Keyhole> + tokenlock::Unsync,
{
    type Target = Element;

    fn get(&self, key: &&'a mut Key) -> Self::Target {
        self.read(*key).clone()
    }
    fn set(&self, key: &mut &'a mut Key, value: Self::Target) {
        self.replace(*key, value);
    }
    fn modify<T>(&self, key: &mut &'a mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T {
        let x = self.write(*key);
        f(x)
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
}

/// An error type indicating inconsistency in a linked list structure.
///
/// Structural corruption is detected where economically possible and reported
/// rather than silently ignored; it is not recoverable.
#[derive(Debug, Clone, Copy)]
pub struct InconsistentError;

#[derive(Debug, Clone, Copy)]
pub enum InsertError {
    AlreadyLinked,
    Inconsistent(InconsistentError),
}

impl From<InconsistentError> for InsertError {
    #[inline(always)]
    fn from(x: InconsistentError) -> Self {
        Self::Inconsistent(x)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ItemError {
    NotLinked,
    Inconsistent(InconsistentError),
}

impl From<InconsistentError> for ItemError {
    #[inline(always)]
    fn from(x: InconsistentError) -> Self {
        Self::Inconsistent(x)
    }
}

/// `Cell`-based accessor to a linked list.
#[derive(Debug)]
pub struct ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    /// `Key` used to read or write cells.
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        ListAccessorCell {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    pub fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    pub fn pool(&self) -> &Pool {
        self.pool
    }

    pub fn cell_key(&self) -> &CellKey {
        &self.cell_key
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }

    /// Count the elements. O(list length).
    pub fn len(&self) -> Result<usize, InconsistentError> {
        let mut len = 0;
        let mut cursor = self.front();
        while let Some(i) = cursor {
            len += 1;
            cursor = self.next(i).map_err(|_| InconsistentError)?;
        }
        Ok(len)
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.head().first
    }

    #[inline]
    pub fn back(&self) -> Result<Option<Index>, InconsistentError> {
        self.head()
            .first
            .map(|p| {
                Ok((self.map_link)(&self.pool[p])
                    .get(&self.cell_key)
                    .ok_or(InconsistentError)?
                    .prev)
            })
            .transpose()
    }

    #[inline]
    pub fn front_data(&self) -> Option<&Element> {
        self.front().map(|p| &self.pool[p])
    }

    #[inline]
    pub fn back_data(&self) -> Result<Option<&Element>, InconsistentError> {
        Ok(self.back()?.map(|p| &self.pool[p]))
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or at the
    /// list's back (if `at` is `None`).
    #[inline]
    pub fn insert(&mut self, item: Index, at: Option<Index>) -> Result<(), InsertError> {
        if (self.map_link)(&self.pool[item.clone()])
            .get(&self.cell_key)
            .is_some()
        {
            return Err(InsertError::AlreadyLinked);
        }

        let mut head = self.head();

        if let Some(first) = head.first {
            let (next, update_first) = if let Some(at) = at {
                let update_first = at == first;
                (at, update_first)
            } else {
                (first, false)
            };

            let prev = (self.map_link)(&self.pool[next.clone()])
                .get(&self.cell_key)
                .ok_or(InconsistentError)?
                .prev;
            (self.map_link)(&self.pool[prev.clone()]).modify(&mut self.cell_key, |l| {
                l.as_mut().ok_or(InconsistentError)?.next = item.clone();
                Ok::<(), InconsistentError>(())
            })?;
            (self.map_link)(&self.pool[next.clone()]).modify(&mut self.cell_key, |l| {
                l.as_mut().ok_or(InconsistentError)?.prev = item.clone();
                Ok::<(), InconsistentError>(())
            })?;
            (self.map_link)(&self.pool[item.clone()])
                .set(&mut self.cell_key, Some(Link { prev, next }));

            if update_first {
                head.first = Some(item);
                self.set_head(head);
            }
        } else {
            debug_assert!(at.is_none());

            let link = (self.map_link)(&self.pool[item.clone()]);
            link.set(
                &mut self.cell_key,
                Some(Link {
                    prev: item.clone(),
                    next: item.clone(),
                }),
            );

            head.first = Some(item);
            self.set_head(head);
        }

        Ok(())
    }

    #[inline]
    pub fn push_back(&mut self, item: Index) -> Result<(), InsertError> {
        self.insert(item, None)
    }

    #[inline]
    pub fn push_front(&mut self, item: Index) -> Result<(), InsertError> {
        let at = self.front();
        self.insert(item, at)
    }

    /// Remove `item` from the list. Returns `item`.
    ///
    /// Removing an item that is not currently linked fails with
    /// [`ItemError::NotLinked`] and leaves the list untouched, so cleanup code
    /// running on every exit path can call this without tracking whether a
    /// wake-upper got there first.
    #[inline]
    pub fn remove(&mut self, item: Index) -> Result<Index, ItemError> {
        if (self.map_link)(&self.pool[item.clone()])
            .get(&self.cell_key)
            .is_none()
        {
            return Err(ItemError::NotLinked);
        }

        let link: Link<Index> = {
            let link_ref = (self.map_link)(&self.pool[item.clone()]);
            let mut head = self.head();
            if head.first.as_ref() == Some(&item) {
                let next = link_ref.get(&self.cell_key).ok_or(InconsistentError)?.next;
                if next == item {
                    // The list just became empty
                    head.first = None;
                    self.set_head(head);

                    link_ref.set(&mut self.cell_key, None);
                    return Ok(item);
                }

                // Move the head pointer
                head.first = Some(next);
                self.set_head(head);
            }

            link_ref.get(&self.cell_key).ok_or(InconsistentError)?
        };

        (self.map_link)(&self.pool[link.prev.clone()]).modify(&mut self.cell_key, |l| {
            l.as_mut().ok_or(InconsistentError)?.next = link.next.clone();
            Ok::<(), InconsistentError>(())
        })?;
        (self.map_link)(&self.pool[link.next.clone()]).modify(&mut self.cell_key, |l| {
            l.as_mut().ok_or(InconsistentError)?.prev = link.prev.clone();
            Ok::<(), InconsistentError>(())
        })?;
        (self.map_link)(&self.pool[item.clone()]).set(&mut self.cell_key, None);

        Ok(item)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Result<Option<Index>, InconsistentError> {
        self.front()
            .map(|item| {
                // `ItemError::NotLinked` would be unexpected here, so convert
                // it to `InconsistentError`
                self.remove(item).map_err(|_| InconsistentError)
            })
            .transpose()
    }

    /// Get the next element of the specified element.
    #[inline]
    pub fn next(&self, i: Index) -> Result<Option<Index>, ItemError> {
        let next = (self.map_link)(&self.pool[i])
            .get(&self.cell_key)
            .ok_or(ItemError::NotLinked)?
            .next;
        Ok(if Some(&next) == self.head().first.as_ref() {
            None
        } else {
            Some(next)
        })
    }

    /// Get the previous element of the specified element.
    #[inline]
    pub fn prev(&self, i: Index) -> Result<Option<Index>, ItemError> {
        Ok(if Some(&i) == self.head().first.as_ref() {
            None
        } else {
            Some(
                (self.map_link)(&self.pool[i])
                    .get(&self.cell_key)
                    .ok_or(ItemError::NotLinked)?
                    .prev,
            )
        })
    }

    pub fn iter(&self) -> Iter<&Self, Index> {
        Iter {
            next: self.head().first,
            accessor: self,
        }
    }
}

/// An iterator over the elements of `ListAccessorCell`.
#[derive(Debug)]
pub struct Iter<Accessor, Index> {
    accessor: Accessor,
    next: Option<Index>,
}

impl<'a, 'b, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey> Iterator
    for Iter<&'b ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>, Index>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: 'a + Fn(&Element) -> &LinkCell,
    Element: 'a + 'b,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    type Item = Result<(Index, &'a Element), InconsistentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(next) = self.next.take() {
            self.next = match self.accessor.next(next.clone()) {
                Ok(x) => x,
                Err(_) => return Some(Err(InconsistentError)),
            };
            Some(Ok((next.clone(), &self.accessor.pool[next])))
        } else {
            None
        }
    }
}

/// A virtual container of elements addressed by raw pointers.
///
/// Used for lists whose elements live on the waiting threads' stacks (wait
/// objects, timeout objects). All pointees reachable through an
/// `UnsafeStatic` must be extant for as long as they are linked; the modules
/// using this type uphold that by unlinking every node before the stack frame
/// owning it goes away.
pub(crate) struct UnsafeStatic {
    _nonexhaustive: (),
}

impl UnsafeStatic {
    /// Construct an `UnsafeStatic`.
    ///
    /// # Safety
    ///
    /// All pointees to be accessed through the constructed `UnsafeStatic`
    /// must be valid.
    pub(crate) const unsafe fn new() -> &'static Self {
        &Self { _nonexhaustive: () }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, vec, vec::Vec};

    fn push<Element>(this: &mut Vec<Element>, x: Element) -> usize {
        let i = this.len();
        this.push(x);
        i
    }

    #[test]
    fn basic_cell() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &pool, |(_, link): &(_, _)| link, ())
            };
        }

        let ptr1 = push(&mut pool, (1, Cell::new(None)));
        get_accessor!().push_back(ptr1).unwrap();

        let ptr2 = push(&mut pool, (2, Cell::new(None)));
        get_accessor!().push_back(ptr2).unwrap();

        let ptr3 = push(&mut pool, (3, Cell::new(None)));
        get_accessor!().push_front(ptr3).unwrap();

        let mut accessor = get_accessor!();
        assert!(!accessor.is_empty());
        assert_eq!(accessor.len().unwrap(), 3);
        assert_eq!(accessor.front(), Some(ptr3));
        assert_eq!(accessor.back().unwrap(), Some(ptr2));
        assert_eq!(accessor.front_data().unwrap().0, 3);
        assert_eq!(accessor.back_data().unwrap().unwrap().0, 2);

        let items: Vec<_> = accessor
            .iter()
            .map(Result::unwrap)
            .map(|(_, (x, _))| *x)
            .collect();
        assert_eq!(items, vec![3, 1, 2]);

        accessor.remove(ptr1).unwrap();
        accessor.remove(ptr2).unwrap();
        accessor.remove(ptr3).unwrap();

        assert!(accessor.is_empty());
    }

    #[test]
    fn remove_unlinked_is_reported() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());
        let ptr = push(&mut pool, (1, Cell::new(None)));

        let mut accessor = ListAccessorCell::new(&head, &pool, |(_, link): &(_, _)| link, ());
        assert!(matches!(accessor.remove(ptr), Err(ItemError::NotLinked)));

        accessor.push_back(ptr).unwrap();
        accessor.remove(ptr).unwrap();
        // A second removal finds the node unlinked and leaves the list alone.
        assert!(matches!(accessor.remove(ptr), Err(ItemError::NotLinked)));
        assert!(accessor.is_empty());
    }

    #[test]
    fn insert_linked_is_rejected() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());
        let ptr = push(&mut pool, (1, Cell::new(None)));

        let mut accessor = ListAccessorCell::new(&head, &pool, |(_, link): &(_, _)| link, ());
        accessor.push_back(ptr).unwrap();
        assert!(matches!(
            accessor.push_back(ptr),
            Err(InsertError::AlreadyLinked)
        ));
    }

    #[test]
    fn drain_cell() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &pool, |(_, link): &(_, _)| link, ())
            };
        }

        let ptrs = [
            push(&mut pool, (1, Cell::new(None))),
            push(&mut pool, (2, Cell::new(None))),
            push(&mut pool, (3, Cell::new(None))),
        ];

        get_accessor!().push_back(ptrs[0]).unwrap();
        get_accessor!().push_back(ptrs[1]).unwrap();
        get_accessor!().push_front(ptrs[2]).unwrap();

        while get_accessor!().pop_front().unwrap().is_some() {}

        assert_eq!(head.get().first, None);
        for &ptr in &ptrs {
            let e = &pool[ptr];
            assert!(e.1.get().is_none());
        }
    }

    fn push_static<Element>(x: Element) -> Ident<&'static Element> {
        Ident(Box::leak(Box::new(x)))
    }

    #[test]
    fn basic_cell_static() {
        let head = Cell::new(ListHead::<Ident<&'static El>>::new());

        #[derive(Debug)]
        struct El(u32, Cell<Option<Link<Ident<&'static El>>>>);

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &Static, |El(_, link)| link, ())
            };
        }

        let ptr1 = push_static(El(1, Cell::new(None)));
        get_accessor!().push_back(ptr1).unwrap();

        let ptr2 = push_static(El(2, Cell::new(None)));
        get_accessor!().push_back(ptr2).unwrap();

        let ptr3 = push_static(El(3, Cell::new(None)));
        get_accessor!().push_front(ptr3).unwrap();

        let accessor = get_accessor!();
        assert_eq!(accessor.front(), Some(ptr3));
        assert_eq!(accessor.back().unwrap(), Some(ptr2));

        assert_eq!(accessor.next(ptr3).unwrap(), Some(ptr1));
        assert_eq!(accessor.next(ptr1).unwrap(), Some(ptr2));
        assert_eq!(accessor.next(ptr2).unwrap(), None);
        assert_eq!(accessor.prev(ptr3).unwrap(), None);
        assert_eq!(accessor.prev(ptr1).unwrap(), Some(ptr3));
        assert_eq!(accessor.prev(ptr2).unwrap(), Some(ptr1));

        let mut accessor = get_accessor!();
        accessor.remove(ptr1).unwrap();
        accessor.remove(ptr2).unwrap();
        accessor.remove(ptr3).unwrap();

        assert!(accessor.is_empty());
    }
}
