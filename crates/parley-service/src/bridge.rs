use std::sync::Weak;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parley_core::events::SessionEvent;

/// Receives every event a session publishes.
pub(crate) trait SessionEventSink: Send + Sync {
    fn on_session_event(&self, event: SessionEvent);
}

/// Forward a session's events to `sink` until the session is dropped or the
/// sink goes away. The task holds no strong reference to either.
pub(crate) fn spawn_session_bridge<S>(sink: Weak<S>, mut rx: broadcast::Receiver<SessionEvent>) -> JoinHandle<()>
where
    S: SessionEventSink + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Some(sink) = sink.upgrade() else {
                        debug!("session bridge sink dropped");
                        break;
                    };
                    sink.on_session_event(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "session bridge lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("session bridge channel closed");
                    break;
                }
            }
        }
    })
}
