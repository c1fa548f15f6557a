//! Diagnostic events for failures the relay absorbs
//!
//! Transport hiccups never propagate out of the hub or the upstream client.
//! Each one is reported here instead, so monitoring can be attached without
//! changing failure semantics.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

/// A failure that was handled locally (logged and dropped or retried)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    /// Inbound text was not JSON or not an object
    MalformedFrame { client_id: String },
    /// Writing to a socket failed or its writer task is gone
    SendFailed { client_id: String },
    /// Hub refused a connection during the handshake
    HandshakeRejected { code: u16, reason: String },
    /// Upstream connect attempt failed before the socket opened
    UpstreamConnectFailed { endpoint: String, error: String },
    /// Upstream socket closed
    UpstreamClosed { endpoint: String, code: Option<u16>, reason: String },
    /// Upstream hub rejected our credentials; reconnects are held back
    UpstreamCredentialsRejected { endpoint: String, retry_ms: u64 },
    /// Envelope keys are configured but a frame did not open
    EnvelopeFallback { reason: String },
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticEvent::MalformedFrame { client_id } => {
                write!(f, "malformed frame from {client_id}")
            }
            DiagnosticEvent::SendFailed { client_id } => write!(f, "send to {client_id} failed"),
            DiagnosticEvent::HandshakeRejected { code, reason } => {
                write!(f, "handshake rejected ({code} {reason})")
            }
            DiagnosticEvent::UpstreamConnectFailed { endpoint, error } => {
                write!(f, "upstream connect to {endpoint} failed: {error}")
            }
            DiagnosticEvent::UpstreamClosed {
                endpoint,
                code,
                reason,
            } => write!(f, "upstream {endpoint} closed ({code:?} {reason})"),
            DiagnosticEvent::UpstreamCredentialsRejected { endpoint, retry_ms } => {
                write!(f, "upstream {endpoint} rejected credentials, retry in {retry_ms}ms")
            }
            DiagnosticEvent::EnvelopeFallback { reason } => {
                write!(f, "envelope fallback: {reason}")
            }
        }
    }
}

type Sink = Arc<dyn Fn(&DiagnosticEvent) + Send + Sync>;

/// Cheap, cloneable handle for reporting [`DiagnosticEvent`]s
#[derive(Clone, Default)]
pub struct Diagnostics {
    sink: Option<Sink>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward every event to `sink` in addition to the debug log
    pub fn with_sink(sink: impl Fn(&DiagnosticEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    pub fn report(&self, event: DiagnosticEvent) {
        debug!(target: "airpad_relay::diagnostics", "{}", event);
        if let Some(sink) = &self.sink {
            sink(&event);
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_sink_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let diagnostics = Diagnostics::with_sink(move |e| captured.lock().push(e.clone()));

        diagnostics.report(DiagnosticEvent::SendFailed {
            client_id: "c1".into(),
        });
        Diagnostics::new().report(DiagnosticEvent::MalformedFrame {
            client_id: "ignored".into(),
        });

        assert_eq!(
            *seen.lock(),
            vec![DiagnosticEvent::SendFailed {
                client_id: "c1".into()
            }]
        );
    }
}
