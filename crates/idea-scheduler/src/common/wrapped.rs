use std::clone::Clone;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Wrapper struct containing an `Arc<Mutex<T>>`, implementing several
/// helper functions and useful traits.
///
/// It is the shared state primitive of the provisioning subsystem: every long-running loop
/// (monitor, provisioners) runs in its own task, so state shared between them has to be `Send`.
///
/// The traits `PartialEq`, `Eq` and `Hash` are implemented on the *pointer value*.
///
/// A guard returned by [`WrappedArcMutex::get_mut`] must never be held across an `.await`
/// point or while calling into another component.
#[derive(Default, Debug)]
pub struct WrappedArcMutex<T: ?Sized> {
    inner: Arc<Mutex<T>>,
}

impl<T> WrappedArcMutex<T> {
    /// Create a new wrapped instance. This is not called `new` so that you may implement
    /// your own function `new`.
    #[inline]
    pub fn wrap(t: T) -> Self {
        WrappedArcMutex {
            inner: Arc::new(Mutex::new(t)),
        }
    }
}

impl<T: ?Sized> WrappedArcMutex<T> {
    /// Locks the contents.
    ///
    /// A poisoned mutex is recovered, the protected data structures are kept consistent by
    /// short critical sections that do not call foreign code.
    #[inline]
    #[track_caller]
    pub fn get_mut(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Return the number of strong references to the contained Arc
    #[inline]
    pub fn get_num_refs(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T: ?Sized> Clone for WrappedArcMutex<T> {
    #[inline]
    fn clone(&self) -> Self {
        WrappedArcMutex {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> Hash for WrappedArcMutex<T> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        let ptr = Arc::as_ptr(&self.inner).cast::<()>();
        ptr.hash(state);
    }
}

impl<T: ?Sized> PartialEq for WrappedArcMutex<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: ?Sized> Eq for WrappedArcMutex<T> {}

/// Create a newtype that will contain a type wrapped inside [`WrappedArcMutex`].
#[macro_export]
macro_rules! define_wrapped_type {
    ($name: ident, $type: ty $(, $visibility: vis)?) => {
        #[derive(::std::clone::Clone)]
        #[repr(transparent)]
        $($visibility)* struct $name($crate::common::WrappedArcMutex<$type>);

        impl ::std::ops::Deref for $name {
            type Target = $crate::common::WrappedArcMutex<$type>;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}
