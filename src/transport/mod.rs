// src/transport/mod.rs
// Message-broker ingress paths: NATS (ephemeral), Pulsar (durable)

pub mod nats;
pub mod pulsar;

pub use self::nats::NatsIngress;
pub use self::pulsar::PulsarIngress;

/// Connectivity as reported by an ingress, consumed by the health probes
pub trait TransportStatus: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Stand-in for a transport the operator switched off. Reports connected so
/// health probes do not fail forever on a deliberately absent component.
pub struct DisabledTransport;

impl TransportStatus for DisabledTransport {
    fn is_connected(&self) -> bool {
        true
    }
}
