use core::ops::Deref;

/// A pointer to statically allocated mutable data, such as a block of
/// memory-mapped I/O registers.
///
/// Wraps a raw pointer so that the unsafe dereference happens in exactly
/// one place. Constructing one is unsafe; using it afterwards is not.
#[derive(Debug)]
pub struct StaticRef<T> {
    ptr: *const T,
}

impl<T> StaticRef<T> {
    /// Create a new `StaticRef` from a raw pointer.
    ///
    /// ## Safety
    ///
    /// - `ptr` must be aligned and non-null.
    /// - `ptr` must point to a `T` that is valid for the `'static`
    ///   lifetime.
    pub const unsafe fn new(ptr: *const T) -> StaticRef<T> {
        StaticRef { ptr }
    }
}

impl<T> Clone for StaticRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StaticRef<T> {}

impl<T: 'static> Deref for StaticRef<T> {
    type Target = T;
    fn deref(&self) -> &'static T {
        unsafe { &*self.ptr }
    }
}
