use std::mem::MaybeUninit;

/// A simple slab allocator.
///
/// A `Slab` stores values of type `T` in a contiguous array and
/// returns stable indices that can be reused after removal.
///
/// Internally, it keeps track of:
/// - initialized slots,
/// - free indices,
/// - and uninitialized memory using [`MaybeUninit`].
///
/// The service event loop keeps its event sources here, so source
/// identifiers stay small and removal is O(1).
///
/// # Safety
///
/// Every slot is read only while its `used` flag is set, which the safe
/// API maintains.
pub(crate) struct Slab<T> {
    /// Storage for items (may contain uninitialized slots).
    items: Vec<MaybeUninit<T>>,
    /// Stack of free indices that can be reused.
    free: Vec<usize>,
    /// Marks whether a slot is currently initialized.
    used: Vec<bool>,
    /// Number of initialized slots.
    len: usize,
}

impl<T> Slab<T> {
    /// Creates a new `Slab` with a fixed initial capacity.
    ///
    /// All slots are initially free and uninitialized.
    pub(crate) fn new(size: usize) -> Self {
        let items = (0..size).map(|_| MaybeUninit::<T>::uninit()).collect();
        // Reversed so that low indices are handed out first.
        let free = (0..size).rev().collect();
        let used = (0..size).map(|_| false).collect();

        Self {
            items,
            free,
            used,
            len: 0,
        }
    }

    /// Inserts a value into the slab and returns its index.
    ///
    /// If a free slot is available, it is reused.
    /// Otherwise, the slab grows exponentially.
    pub(crate) fn insert(&mut self, item: T) -> usize {
        let index = if let Some(i) = self.free.pop() {
            i
        } else {
            let len = self.items.len();
            let new_len = if len == 0 { 1 } else { 2 * len };

            self.items
                .extend((len..new_len).map(|_| MaybeUninit::<T>::uninit()));
            self.free.extend(((len + 1)..new_len).rev());
            self.used.extend((len..new_len).map(|_| false));

            len
        };

        self.items[index] = MaybeUninit::new(item);
        self.used[index] = true;
        self.len += 1;

        index
    }

    /// Removes and returns the value stored at `index`.
    ///
    /// Returns `None` if the slot is out of range or free.
    pub(crate) fn remove(&mut self, index: usize) -> Option<T> {
        if !self.contains(index) {
            return None;
        }

        self.free.push(index);
        self.used[index] = false;
        self.len -= 1;

        let item = unsafe { self.items[index].assume_init_read() };
        self.items[index] = MaybeUninit::uninit();

        Some(item)
    }

    /// Returns `true` if `index` holds a value.
    pub(crate) fn contains(&self, index: usize) -> bool {
        self.used.get(index).copied().unwrap_or(false)
    }

    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        if !self.contains(index) {
            return None;
        }

        Some(unsafe { self.items[index].assume_init_ref() })
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if !self.contains(index) {
            return None;
        }

        Some(unsafe { self.items[index].assume_init_mut() })
    }

    /// Number of stored values.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Iterates over `(index, value)` pairs of the stored values.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items
            .iter()
            .zip(self.used.iter())
            .enumerate()
            .filter(|(_, (_, used))| **used)
            .map(|(index, (slot, _))| (index, unsafe { slot.assume_init_ref() }))
    }
}

impl<T> Drop for Slab<T> {
    /// Drops all initialized elements stored in the slab.
    ///
    /// Uninitialized slots are ignored.
    fn drop(&mut self) {
        for (slot, &used) in self.items.iter_mut().zip(self.used.iter()) {
            if used {
                unsafe {
                    slot.assume_init_drop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::rc::Rc;

    #[test]
    fn indices_are_reused_after_removal() {
        let mut slab = Slab::new(2);

        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!((a, b), (0, 1));

        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.insert("c"), a);
        assert_eq!(slab.len(), 2);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut slab = Slab::new(0);

        for i in 0..5 {
            assert_eq!(slab.insert(i), i);
        }

        assert_eq!(slab.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn drop_releases_stored_values() {
        let value = Rc::new(());
        let mut slab = Slab::new(1);
        slab.insert(Rc::clone(&value));
        slab.insert(Rc::clone(&value));

        assert_eq!(Rc::strong_count(&value), 3);
        drop(slab);
        assert_eq!(Rc::strong_count(&value), 1);
    }
}
