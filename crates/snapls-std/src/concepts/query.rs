use core::fmt;
use std::sync::OnceLock;

/// Represent the result of an immutable query reference.
/// The compute function should be pure enough.
///
/// [`compute`]: Self::compute
pub struct QueryRef<Res, Err> {
    /// `None` means no value has been computed yet.
    cell: OnceLock<Result<Res, Err>>,
}

impl<T, E> QueryRef<T, E> {
    pub fn with_value(value: T) -> Self {
        let cell = OnceLock::new();
        cell.get_or_init(|| Ok(value));
        Self { cell }
    }
}

impl<T, E: Clone> QueryRef<T, E> {
    /// Compute and return a checked reference guard.
    #[inline]
    pub fn compute<F: FnOnce() -> Result<T, E>>(&self, f: F) -> Result<&T, E> {
        let result = self.cell.get_or_init(f);
        result.as_ref().map_err(Clone::clone)
    }

    /// Gets the reference to the (maybe uninitialized) result.
    ///
    /// Returns `None` if the cell is empty, or being initialized. This
    /// method never blocks.
    pub fn get_uninitialized(&self) -> Option<&Result<T, E>> {
        self.cell.get()
    }
}

impl<T, E> Default for QueryRef<T, E> {
    fn default() -> Self {
        QueryRef {
            cell: OnceLock::new(),
        }
    }
}

impl<T, E> fmt::Debug for QueryRef<T, E>
where
    T: fmt::Debug,
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let res = self.cell.get();
        f.debug_struct("QueryRef").field("result", &res).finish()
    }
}
