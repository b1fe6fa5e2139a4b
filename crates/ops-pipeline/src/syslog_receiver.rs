//! UDP syslog receiver (spec §4.5, §9).
//!
//! Listens on a bound UDP socket, parses and normalizes each datagram into
//! a `UnifiedEvent`, persists it to the day file, and forwards it on a
//! plain channel. The receiver never calls the pipeline directly — per
//! spec §9's design note, keeping it behind an `onMessage`-shaped channel
//! avoids a receiver-knows-about-pipeline dependency cycle; whatever is
//! driving the pipeline reads from the receiving end.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ops_common::model::now;
use ops_common::{fsio, Error, Result};
use ops_preprocessor::normalize_syslog;
use ops_preprocessor::syslog::parse_syslog;
use ops_preprocessor::{Aggregator, DeviceInfoCache};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{prepare_event, PipelineInput};

const EVENTS_DIR: &str = "enhancement/syslog/events";
const CONFIG_FILE: &str = "enhancement/syslog/config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyslogReceiverConfig {
    pub bind_address: String,
}

impl Default for SyslogReceiverConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:514".to_string(),
        }
    }
}

/// Load the persisted receiver config, falling back to the default if the
/// file doesn't exist yet.
pub async fn load_config(data_dir: &Path) -> Result<SyslogReceiverConfig> {
    let path = data_dir.join(CONFIG_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => serde_json::from_str(&contents).map_err(Error::from),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SyslogReceiverConfig::default()),
        Err(e) => Err(Error::from(e)),
    }
}

pub async fn save_config(data_dir: &Path, config: &SyslogReceiverConfig) -> Result<()> {
    let path = data_dir.join(CONFIG_FILE);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let contents = serde_json::to_string_pretty(config)?;
    tokio::fs::write(&path, contents).await.map_err(Error::from)
}

pub struct SyslogReceiver {
    data_dir: PathBuf,
    socket: Arc<UdpSocket>,
}

impl SyslogReceiver {
    pub async fn bind(data_dir: impl Into<PathBuf>, bind_address: &str) -> Result<Self> {
        let socket = UdpSocket::bind(bind_address)
            .await
            .map_err(|e| Error::Io(format!("binding syslog socket on {bind_address}: {e}")))?;
        Ok(Self {
            data_dir: data_dir.into(),
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::from)
    }

    /// Spawn the receive loop, returning its handle and the receiving end
    /// of the channel every normalized event (or aggregated composite) is
    /// forwarded on. The loop degrades gracefully on a malformed datagram
    /// (logs and continues) and on a persistence failure (logs and still
    /// forwards the event), per spec §7's "never crash the process on a
    /// single bad input" rule. Every event is enriched with cached device
    /// identity and run through the burst/flap aggregator before it is
    /// forwarded, so interface flapping surfaces as a composite event
    /// alongside the normal per-event stream.
    pub fn spawn(
        self,
        aggregator: Arc<Aggregator>,
        device_info: Arc<DeviceInfoCache>,
    ) -> (JoinHandle<()>, mpsc::Receiver<PipelineInput>) {
        let (tx, rx) = mpsc::channel(1024);
        let socket = self.socket;
        let data_dir = self.data_dir;
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let (len, addr) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "syslog socket read failed");
                        continue;
                    }
                };
                let line = String::from_utf8_lossy(&buf[..len]).to_string();
                let parsed = match parse_syslog(&line) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(error = %e, source = %addr, "dropping unparsable syslog datagram");
                        continue;
                    }
                };
                let event = normalize_syslog(&parsed);

                if let Err(e) = fsio::append_day_record(&data_dir.join(EVENTS_DIR), now(), &event).await {
                    warn!(error = %e, event_id = %event.id, "failed to persist syslog event");
                }

                let (enriched, composite) = prepare_event(&device_info, &aggregator, event).await;

                if tx.send(PipelineInput::Event(enriched)).await.is_err() {
                    break;
                }
                if let Some(composite) = composite {
                    if tx.send(PipelineInput::Composite(composite)).await.is_err() {
                        break;
                    }
                }
            }
        });
        (handle, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ops_common::ports::NullDeviceClient;
    use ops_preprocessor::PreprocessorConfig;
    use tempfile::tempdir;

    fn doubles() -> (Arc<Aggregator>, Arc<DeviceInfoCache>) {
        (
            Arc::new(Aggregator::new(&PreprocessorConfig::default())),
            Arc::new(DeviceInfoCache::new(Arc::new(NullDeviceClient), 300_000)),
        )
    }

    fn unwrap_event(input: PipelineInput) -> ops_common::model::UnifiedEvent {
        match input {
            PipelineInput::Event(event) => event,
            PipelineInput::Composite(_) => panic!("expected a plain event"),
        }
    }

    #[tokio::test]
    async fn receiver_parses_and_forwards_datagram() {
        let dir = tempdir().unwrap();
        let receiver = SyslogReceiver::bind(dir.path(), "127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        let (aggregator, device_info) = doubles();
        let (handle, mut rx) = receiver.spawn(aggregator, device_info);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"<134>Jan  1 12:00:00 router1 interface ether1 link down", addr)
            .await
            .unwrap();

        let input = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("receive timed out")
            .expect("channel closed");
        let event = unwrap_event(input);
        assert_eq!(event.category, "interface");
        assert_eq!(event.message, "ether1 link down");

        handle.abort();
    }

    #[tokio::test]
    async fn unparsable_datagram_is_dropped_without_crashing() {
        let dir = tempdir().unwrap();
        let receiver = SyslogReceiver::bind(dir.path(), "127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        let (aggregator, device_info) = doubles();
        let (handle, mut rx) = receiver.spawn(aggregator, device_info);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"not a syslog line", addr).await.unwrap();
        client
            .send_to(b"<14>Jan  1 12:00:01 router1 system rebooted", addr)
            .await
            .unwrap();

        let input = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("receive timed out")
            .expect("channel closed");
        let event = unwrap_event(input);
        assert_eq!(event.message, "rebooted");

        handle.abort();
    }

    #[tokio::test]
    async fn interface_flap_burst_also_emits_a_composite() {
        let dir = tempdir().unwrap();
        let receiver = SyslogReceiver::bind(dir.path(), "127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        let aggregator = Arc::new(Aggregator::new(&PreprocessorConfig {
            flap_min_changes: 2,
            ..Default::default()
        }));
        let device_info = Arc::new(DeviceInfoCache::new(Arc::new(NullDeviceClient), 300_000));
        let (handle, mut rx) = receiver.spawn(aggregator, device_info);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"<134>Jan  1 00:00:00 r1 interface ether1 link down", addr)
            .await
            .unwrap();
        client
            .send_to(b"<134>Jan  1 00:00:01 r1 interface ether1 link up", addr)
            .await
            .unwrap();

        let mut saw_composite = false;
        for _ in 0..4 {
            let input = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .expect("receive timed out")
                .expect("channel closed");
            if matches!(input, PipelineInput::Composite(_)) {
                saw_composite = true;
                break;
            }
        }
        assert!(saw_composite, "expected a composite event once the flap threshold was reached");

        handle.abort();
    }

    #[tokio::test]
    async fn config_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let loaded = load_config(dir.path()).await.unwrap();
        assert_eq!(loaded.bind_address, "0.0.0.0:514");

        save_config(dir.path(), &SyslogReceiverConfig { bind_address: "0.0.0.0:1514".into() })
            .await
            .unwrap();
        let reloaded = load_config(dir.path()).await.unwrap();
        assert_eq!(reloaded.bind_address, "0.0.0.0:1514");
    }
}
