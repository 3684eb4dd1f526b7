//! Caller-supplied interaction hooks.
//!
//! Reprogramming a device is destructive, so the orchestrators ask before
//! acting. Callers that want unattended operation use [`AutoConfirm`], which
//! always proceeds and auto-picks the first firmware choice.

#[cfg(test)]
use mockall::automock;

/// Confirmation and choice callbacks.
#[cfg_attr(test, automock)]
pub trait InteractionHooks: Send + Sync {
    /// Ask the caller to confirm a destructive step.
    fn confirm(&self, message: &str) -> bool;

    /// Ask the caller to pick one of several options. Returning `None`
    /// cancels the operation.
    fn choose_one(&self, message: &str, options: &[String]) -> Option<usize>;
}

/// Hooks that always proceed without asking.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

impl InteractionHooks for AutoConfirm {
    fn confirm(&self, _message: &str) -> bool {
        true
    }

    fn choose_one(&self, _message: &str, options: &[String]) -> Option<usize> {
        if options.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}
