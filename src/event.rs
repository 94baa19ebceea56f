//! Gate event system.

use tokio::sync::broadcast;

/// Events emitted by a gate verification terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateEvent {
    /// A scan was accepted and verification started.
    ScanAccepted,

    /// A scan arrived while another was still being verified and was dropped.
    ScanDropped,

    /// Verification finished.
    Decision {
        /// Transaction the decision is about, if one was identified.
        transaction_id: Option<String>,
        /// Resulting state name (`SUCCESS`, `FLAGGED`, `EXPIRED`, `NOT_FOUND`).
        state: &'static str,
    },

    /// Staff released the customer.
    Released {
        /// Transaction id.
        transaction_id: String,
        /// Staff member.
        staff_id: String,
    },

    /// Staff sent the customer for a full audit.
    Audited {
        /// Transaction id.
        transaction_id: String,
        /// Staff member.
        staff_id: String,
    },

    /// The terminal returned to idle without an action.
    Reset,
}

/// Channel for receiving gate events.
pub type GateEventsChannel = broadcast::Receiver<GateEvent>;

/// Sender for gate events.
pub type GateEventsSender = broadcast::Sender<GateEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (GateEventsSender, GateEventsChannel) {
    broadcast::channel(256)
}
