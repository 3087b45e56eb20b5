#![allow(unused_macros)]

/// Helper macro for locking items, mapping a poisoned lock to [`crate::Error::LockError`]
///
/// ```rust, ignore
///  let mut data = lock!(my_mutex)?;
///  data.some_field = 42;
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().map_err(|_| crate::Error::LockError)
    };
}

/// Helper macro for rounding a value up to a power-of-two alignment
///
/// ```rust, ignore
///  assert_eq!(align_up!(0x1001_usize, 0x1000), 0x2000);
/// ```
macro_rules! align_up {
    ($value:expr, $align:expr) => {
        ($value + ($align - 1)) & !($align - 1)
    };
}
