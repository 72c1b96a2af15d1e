//! Interior-mutability cells for single-threaded driver state.
//!
//! `OptionalCell` is the callback slot used throughout the chip crates: a
//! driver stores `OptionalCell<&dyn SomeClient>` and invokes the client
//! through [`OptionalCell::map`], which is a checked no-op while no client
//! is bound. `TakeCell` holds a mutable reference (typically a `'static`
//! buffer) that is moved out for the duration of an operation and put back
//! afterwards.

use core::cell::Cell;

/// A `Cell` around an `Option`.
pub struct OptionalCell<T> {
    value: Cell<Option<T>>,
}

impl<T> OptionalCell<T> {
    /// Create an empty cell with no bound value.
    pub const fn empty() -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(None),
        }
    }

    /// Create a cell already holding `value`.
    pub const fn new(value: T) -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(Some(value)),
        }
    }

    /// Bind `value`, replacing any previous binding.
    pub fn set(&self, value: T) {
        self.value.set(Some(value));
    }

    /// Store `opt` as-is.
    pub fn insert(&self, opt: Option<T>) {
        self.value.set(opt);
    }

    /// Unbind the cell.
    pub fn clear(&self) {
        self.value.set(None);
    }

    /// Move the value out, leaving the cell empty.
    pub fn take(&self) -> Option<T> {
        self.value.take()
    }

    /// Bind `value` and return the previous binding.
    pub fn replace(&self, value: T) -> Option<T> {
        let prev = self.take();
        self.set(value);
        prev
    }
}

impl<T: Copy> OptionalCell<T> {
    /// Return a copy of the contained value, if any.
    pub fn get(&self) -> Option<T> {
        self.value.get()
    }

    /// Whether a value is bound.
    pub fn is_some(&self) -> bool {
        self.value.get().is_some()
    }

    /// Whether the cell is empty.
    pub fn is_none(&self) -> bool {
        self.value.get().is_none()
    }

    /// Call `closure` on the contained value, if there is one.
    ///
    /// Returns `Some` of the closure's result, or `None` if the cell was
    /// empty and the closure did not run.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(T) -> R,
    {
        self.value.get().map(closure)
    }

    /// Call `closure` on the contained value, or return `default` if the
    /// cell is empty.
    pub fn map_or<F, R>(&self, default: R, closure: F) -> R
    where
        F: FnOnce(T) -> R,
    {
        self.value.get().map_or(default, closure)
    }

    /// Return the contained value, or `default` if the cell is empty.
    pub fn unwrap_or(&self, default: T) -> T {
        self.value.get().unwrap_or(default)
    }

    /// Whether the cell holds a value equal to `value`.
    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        self.value.get().map_or(false, |v| v == *value)
    }
}

/// A cell holding a mutable reference that can be taken and restored.
///
/// The common pattern is a driver owning `TakeCell<'static, [u8]>`: the
/// buffer is moved in when a transfer starts, accessed from the interrupt
/// handler via [`TakeCell::map`], and moved back out to the client when
/// the transfer completes.
pub struct TakeCell<'a, T: ?Sized> {
    value: Cell<Option<&'a mut T>>,
}

impl<'a, T: ?Sized> TakeCell<'a, T> {
    pub const fn empty() -> TakeCell<'a, T> {
        TakeCell {
            value: Cell::new(None),
        }
    }

    pub fn new(value: &'a mut T) -> TakeCell<'a, T> {
        TakeCell {
            value: Cell::new(Some(value)),
        }
    }

    pub fn is_some(&self) -> bool {
        let inner = self.value.take();
        let result = inner.is_some();
        self.value.set(inner);
        result
    }

    pub fn is_none(&self) -> bool {
        !self.is_some()
    }

    /// Move the reference out, leaving the cell empty.
    pub fn take(&self) -> Option<&'a mut T> {
        self.value.take()
    }

    /// Store a reference, dropping any previous one.
    pub fn put(&self, value: Option<&'a mut T>) {
        self.value.set(value);
    }

    /// Store a reference and return the previous one.
    pub fn replace(&self, value: &'a mut T) -> Option<&'a mut T> {
        self.value.replace(Some(value))
    }

    /// Call `closure` on the contained reference, restoring it afterwards.
    ///
    /// Returns `None`, without running the closure, if the cell is empty.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        self.value.take().map(|value| {
            let result = closure(&mut *value);
            self.value.set(Some(value));
            result
        })
    }

    /// Like [`TakeCell::map`], but returns `default` if the cell is empty.
    pub fn map_or<F, R>(&self, default: R, closure: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        self.map(closure).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_cell_empty_is_checked_noop() {
        let cell: OptionalCell<u32> = OptionalCell::empty();
        assert!(cell.is_none());
        // An unbound invocation must not run and must report that it
        // did not run.
        assert_eq!(cell.map(|v| v + 1), None);
        assert_eq!(cell.map_or(99, |v| v + 1), 99);
    }

    #[test]
    fn optional_cell_rebind_and_clear() {
        let cell = OptionalCell::empty();
        cell.set(7u32);
        assert!(cell.is_some());
        assert_eq!(cell.map(|v| v * 2), Some(14));
        assert_eq!(cell.replace(9), Some(7));
        cell.clear();
        assert_eq!(cell.get(), None);
    }

    #[test]
    fn take_cell_round_trip() {
        let mut buffer = [0u8; 4];
        let cell = TakeCell::new(&mut buffer[..]);
        assert!(cell.is_some());
        assert_eq!(cell.map(|b| b.len()), Some(4));
        // map restored the buffer
        assert!(cell.is_some());
        let taken = cell.take().unwrap();
        assert!(cell.is_none());
        assert_eq!(cell.map_or(0, |b| b.len()), 0);
        cell.put(Some(taken));
        assert!(cell.is_some());
    }
}
