use std::collections::BTreeMap;

use crate::instance::InstanceRegistry;

/// Result of applying one `stat` frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatOutcome {
    pub applied: usize,
    /// Ports with no registered instance. Their deltas were discarded.
    pub dropped: Vec<u16>,
}

/// Add each delta to the matching instance's traffic counter.
///
/// Unknown ports are logged and skipped; the registry never grows here.
pub fn apply_stat(registry: &InstanceRegistry, deltas: &BTreeMap<u16, u64>) -> StatOutcome {
    let mut outcome = StatOutcome::default();
    for (&port, &delta) in deltas {
        match registry.get(port) {
            Ok(Some(instance)) => {
                let total = instance.add_traffic(delta);
                tracing::trace!("Traffic on port {}: +{} (total {})", port, delta, total);
                outcome.applied += 1;
            }
            Ok(None) => {
                tracing::warn!("Stat from unknown port ({}) received", port);
                outcome.dropped.push(port);
            }
            Err(e) => {
                tracing::error!("Cannot apply stat for port {}: {}", port, e);
                outcome.dropped.push(port);
            }
        }
    }
    outcome
}
