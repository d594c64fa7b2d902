//! UDP presence beacon.
//!
//! While the pipeline is serving, a small JSON datagram is broadcast every
//! two seconds so sinks on the LAN can find the source without typing an
//! address. Purely informational; nothing listens for replies.

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::DiscoveryConfig;

/// Discriminator carried in every beacon datagram.
pub const DISCOVERY_TYPE: &str = "FITNESS_MIRROR_DISCOVERY";

/// Serialize one beacon payload.
pub fn beacon_payload(config: &DiscoveryConfig, http_port: u16) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "type": DISCOVERY_TYPE,
        "ip": config.ip,
        "port": http_port,
        "name": config.device_name,
    }))
    .expect("beacon payload serializes")
}

/// Start broadcasting. The task runs until aborted.
pub fn spawn_beacon(config: DiscoveryConfig, http_port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "discovery socket unavailable, beacon disabled");
                return;
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            warn!(error = %e, "broadcast flag rejected, beacon disabled");
            return;
        }

        let payload = beacon_payload(&config, http_port);
        let target = ("255.255.255.255", config.port);
        let mut interval = tokio::time::interval(config.interval.max(Duration::from_millis(100)));
        loop {
            interval.tick().await;
            if let Err(e) = socket.send_to(&payload, target).await {
                debug!(error = %e, "beacon send failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_the_contract_fields() {
        let config = DiscoveryConfig {
            ip: "192.168.1.50".into(),
            device_name: "handheld".into(),
            ..Default::default()
        };
        let payload = beacon_payload(&config, 8080);
        let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["type"], DISCOVERY_TYPE);
        assert_eq!(parsed["ip"], "192.168.1.50");
        assert_eq!(parsed["port"], 8080);
        assert_eq!(parsed["name"], "handheld");
    }

    #[tokio::test]
    async fn beacon_reaches_a_local_listener() {
        // Listen on loopback-reachable wildcard; broadcast loops back on
        // most CI hosts. Bind first so the port is known.
        let listener = UdpSocket::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = DiscoveryConfig {
            ip: "127.0.0.1".into(),
            device_name: "test".into(),
            port,
            interval: Duration::from_millis(100),
        };
        let beacon = spawn_beacon(config, 9999);

        let mut buf = [0u8; 512];
        let received = tokio::time::timeout(Duration::from_secs(5), listener.recv(&mut buf)).await;
        beacon.abort();

        // Broadcast delivery can be filtered in sandboxed environments;
        // when it arrives it must parse.
        if let Ok(Ok(n)) = received {
            let parsed: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
            assert_eq!(parsed["type"], DISCOVERY_TYPE);
            assert_eq!(parsed["port"], 9999);
        }
    }
}
