//! Interactive-context assertion
//!
//! Supervised operations block on locks, disk and native calls, so they must
//! never run on the thread that drives the UI. The host marks that thread
//! once with [`mark_interactive`] (or an [`InteractiveScope`]), and every
//! supervised entry point calls [`ensure_background`].

use std::cell::Cell;

thread_local! {
    static INTERACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Returned when a supervised operation is invoked from the interactive thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("supervised operation invoked from the interactive context")]
pub struct InteractiveContext;

/// Mark the current thread as the interactive (UI) thread
pub fn mark_interactive() {
    INTERACTIVE.with(|flag| flag.set(true));
}

/// Clear the interactive marker on the current thread
pub fn unmark_interactive() {
    INTERACTIVE.with(|flag| flag.set(false));
}

/// Whether the current thread is marked interactive
pub fn is_interactive() -> bool {
    INTERACTIVE.with(Cell::get)
}

/// Reject the call if it runs on the interactive thread
pub fn ensure_background() -> Result<(), InteractiveContext> {
    if is_interactive() {
        Err(InteractiveContext)
    } else {
        Ok(())
    }
}

/// Marks the current thread interactive until dropped
pub struct InteractiveScope {
    previous: bool,
}

impl InteractiveScope {
    pub fn enter() -> Self {
        let previous = is_interactive();
        mark_interactive();
        Self { previous }
    }
}

impl Drop for InteractiveScope {
    fn drop(&mut self) {
        INTERACTIVE.with(|flag| flag.set(self.previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_by_default() {
        assert!(ensure_background().is_ok());
    }

    #[test]
    fn test_scope_marks_and_restores() {
        {
            let _scope = InteractiveScope::enter();
            assert_eq!(ensure_background(), Err(InteractiveContext));
        }
        assert!(ensure_background().is_ok());
    }

    #[test]
    fn test_marker_is_per_thread() {
        let _scope = InteractiveScope::enter();

        let other = std::thread::spawn(ensure_background)
            .join()
            .expect("thread should not panic");

        assert!(other.is_ok());
        assert!(is_interactive());
    }
}
