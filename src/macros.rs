//! Macros.
//!
//! - `hydrate!`: restore several tasks of different types from one store

/// Attach a store to several tasks and restore their snapshots.
///
/// Expands to a call to [`hydrate`](crate::hydrate) with each task coerced
/// to `&dyn Hydrate`, so tasks with different argument and result types can
/// be listed together. Evaluates to `Result<usize, StoreError>`.
///
/// ```ignore
/// let restored = hydrate!(store.clone(), users, pages)?;
/// ```
#[macro_export]
macro_rules! hydrate {
    ($store:expr, $($task:expr),+ $(,)?) => {
        $crate::hydrate(
            $store,
            &[$(&$task as &dyn $crate::Hydrate),+],
        )
    };
}
