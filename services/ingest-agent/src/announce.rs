//! Periodically publishes a retained registry snapshot to
//! `<agent_topic>/<agent_id>`.

use crate::batch::Publisher;
use chrono::Utc;
use etx_protocol::command::{RegistryDeviceEntry, RegistrySnapshot};
use etx_registry::DeviceRegistry;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(
    registry: Arc<DeviceRegistry>,
    publisher: Arc<dyn Publisher>,
    topic: String,
    agent_id: String,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let snapshot = build_snapshot(&registry, &agent_id);
        let payload = serde_json::to_vec(&snapshot).expect("RegistrySnapshot always serializes");
        publisher.publish(&topic, 1, true, payload).await;
    }
}

fn build_snapshot(registry: &DeviceRegistry, agent_id: &str) -> RegistrySnapshot {
    let devices: Vec<RegistryDeviceEntry> = registry
        .snapshot()
        .into_iter()
        .map(|e| RegistryDeviceEntry {
            dn: e.dn.hex(),
            ip: e.ip,
            last_seen_iso: e.last_seen_iso,
        })
        .collect();
    RegistrySnapshot {
        agent_id: agent_id.to_owned(),
        device_count: devices.len(),
        devices,
        timestamp: Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_device_count() {
        let registry = DeviceRegistry::with_default_ttl();
        registry.update(etx_protocol::Dn::normalize("010203040506").unwrap(), "10.0.0.1");
        let snap = build_snapshot(&registry, "agent-1");
        assert_eq!(snap.device_count, 1);
        assert_eq!(snap.devices[0].ip, "10.0.0.1");
    }
}
