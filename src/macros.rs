#![allow(unused_macros)]

/// Helper macro for reading locked items
///
/// ```rust, ignore
///  let handler = read_lock!(self.handler);
///  handler.on_violation(module, &member)?;
/// ```
macro_rules! read_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.read().expect("Failed to acquire read lock")
    };
}

/// Helper macro for writing to locked items
///
/// ```rust, ignore
///  let mut handler = write_lock!(self.handler);
///  *handler = replacement;
/// ```
macro_rules! write_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.write().expect("Failed to acquire write lock")
    };
}
