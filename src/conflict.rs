//! Cross-referencing a service's port mappings against local listeners.

use crate::model::{PortSpec, Service};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Remote ports of `service` whose local port is held by a foreign listener.
///
/// `mappings` maps remote port text to an explicit local port; anything not
/// in it maps to itself. `own` maps each local port bound by this process's
/// tunnel sessions to the remote port it forwards; a listener only belongs to
/// `service` when it forwards the same remote port. Another session sitting on
/// the local port is as much a conflict as a foreign process.
pub fn compute_conflicts(
    service: &Service,
    mappings: &HashMap<String, u16>,
    local_ports: &BTreeSet<u16>,
    own: &BTreeMap<u16, u16>,
) -> BTreeSet<String> {
    let mut conflicts = BTreeSet::new();

    for entry in &service.exposed_ports {
        let Ok(spec) = PortSpec::parse(entry) else {
            continue;
        };
        for remote in spec.ports() {
            let remote_key = remote.to_string();
            let local = mappings.get(&remote_key).copied().unwrap_or(remote);
            if local_ports.contains(&local) && own.get(&local) != Some(&remote) {
                conflicts.insert(remote_key);
            }
        }
    }

    conflicts
}
