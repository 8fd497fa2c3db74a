//! Outbound notification collaborator.
//!
//! Notification is fire-and-forget from the core's point of view: rules
//! call [`Notifier::send`] and swallow failures after logging them, so a
//! broken transport can never abort the triggering operation.

use crate::core::Result;

pub trait Notifier: Send + Sync {
    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()>;
}

/// Discards every notification. Default collaborator for hosts that wire
/// no transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn send(&self, _recipient: &str, _subject: &str, _body: &str) -> Result<()> {
        Ok(())
    }
}
