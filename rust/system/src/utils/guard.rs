/// Runs `cleanup_fn` when dropped, including while unwinding or when the
/// owning future is cancelled. `disarm` skips the cleanup.
pub struct CleanupGuard<F>
where
    F: FnMut(),
{
    cleanup_fn: Option<F>,
}

impl<F> CleanupGuard<F>
where
    F: FnMut(),
{
    pub fn new(cleanup_fn: F) -> Self {
        Self {
            cleanup_fn: Some(cleanup_fn),
        }
    }

    pub fn disarm(mut self) {
        self.cleanup_fn = None;
    }
}

impl<F> Drop for CleanupGuard<F>
where
    F: FnMut(),
{
    fn drop(&mut self) {
        if let Some(cleanup_fn) = self.cleanup_fn.as_mut() {
            cleanup_fn();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn runs_on_drop_unless_disarmed() {
        let runs = Cell::new(0);
        {
            let _guard = CleanupGuard::new(|| runs.set(runs.get() + 1));
        }
        assert_eq!(runs.get(), 1);

        let guard = CleanupGuard::new(|| runs.set(runs.get() + 1));
        guard.disarm();
        assert_eq!(runs.get(), 1);
    }
}
