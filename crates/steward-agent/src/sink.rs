use steward_process::{ChannelId, Presence};

/// Outbound notification boundary (chat channel, log, ...).
///
/// Both calls are fire-and-forget: implementations must not block and swallow their own
/// delivery failures.
pub trait Sink: Send + Sync {
    fn notify(&self, channel: &ChannelId, text: &str);

    /// `None` clears the status.
    fn set_status(&self, presence: Option<&Presence>);
}

/// Writes console lines and status changes to the tracing stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl Sink for TracingSink {
    fn notify(&self, channel: &ChannelId, text: &str) {
        tracing::info!(target: "steward::console", channel = %channel, "{text}");
    }

    fn set_status(&self, presence: Option<&Presence>) {
        match presence {
            Some(p) => tracing::info!(status = %p.status, kind = ?p.kind, "presence updated"),
            None => tracing::info!("presence cleared"),
        }
    }
}
