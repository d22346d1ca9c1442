use core::pin::Pin;

/// Construct a `Pin<&'static T>` from `&'static T`.
pub(crate) fn static_pin<T: ?Sized>(x: &'static T) -> Pin<&'static T> {
    // Safety: A `'static` reference outlives everything, so the pointee is
    //         never moved out of or invalidated
    unsafe { Pin::new_unchecked(x) }
}
