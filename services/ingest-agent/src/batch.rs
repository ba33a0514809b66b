//! Per-DN aggregation windows and raw fan-out, flushed on size or age.
//!
//! Published topics: `<raw_prefix>` (one topic) and
//! `<parsed_prefix>/<DN_HEX>` (per device). Payload is a JSON array when the
//! batch has more than one item, a single object otherwise.

use crate::config::AgentConfig;
use async_trait::async_trait;
use etx_protocol::sample::SampleJson;
use etx_protocol::{Dn, Sample};
use etx_registry::DeviceRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Abstracts "publish a message to the broker" so the batching logic can be
/// unit-tested without a live MQTT connection.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, qos: u8, retain: bool, payload: Vec<u8>);
}

struct RawBuffer {
    bytes: Vec<u8>,
    opened_at: Instant,
    item_count: usize,
}

struct ParsedBuffer {
    items: Vec<SampleJson>,
    opened_at: Instant,
}

pub struct BatchPublisher {
    cfg: Arc<AgentConfig>,
    registry: Arc<DeviceRegistry>,
    stats: Arc<crate::stats::Stats>,
    raw: Option<RawBuffer>,
    parsed: HashMap<Dn, ParsedBuffer>,
}

impl BatchPublisher {
    pub fn new(cfg: Arc<AgentConfig>, registry: Arc<DeviceRegistry>, stats: Arc<crate::stats::Stats>) -> Self {
        BatchPublisher {
            cfg,
            registry,
            stats,
            raw: None,
            parsed: HashMap::new(),
        }
    }

    /// Process one dequeued datagram: update the registry, buffer for raw
    /// fan-out, decode and buffer for parsed fan-out, flushing anything that
    /// has reached its size/age limit.
    pub async fn process(&mut self, bytes: &[u8], src_ip: Option<String>, publisher: &dyn Publisher) {
        self.stats.incr_inbound();

        if let (Some(dn), Some(ip)) = (etx_protocol::quick_dn(bytes), src_ip) {
            self.registry.update(dn, ip);
        }

        if self.cfg.publish_raw {
            self.append_raw(bytes);
            self.maybe_flush_raw(publisher).await;
        }

        if self.cfg.publish_parsed {
            match etx_protocol::parse(bytes) {
                Ok(sample) => {
                    self.append_parsed(&sample);
                    self.maybe_flush_one_parsed(sample.dn, publisher).await;
                }
                Err(_) => self.stats.incr_parse_errors(),
            }
        }
    }

    fn append_raw(&mut self, bytes: &[u8]) {
        let buf = self.raw.get_or_insert_with(|| RawBuffer {
            bytes: Vec::new(),
            opened_at: Instant::now(),
            item_count: 0,
        });
        if buf.item_count > 0 && self.cfg.batch_separator == etx_protocol::topics::BatchSeparator::Nl {
            buf.bytes.push(b'\n');
        }
        buf.bytes.extend_from_slice(bytes);
        buf.item_count += 1;
    }

    async fn maybe_flush_raw(&mut self, publisher: &dyn Publisher) {
        let due = self.raw.as_ref().is_some_and(|b| {
            b.item_count >= self.cfg.batch_max_items
                || b.opened_at.elapsed().as_millis() as u64 >= self.cfg.batch_max_ms
        });
        if due {
            self.flush_raw(publisher).await;
        }
    }

    async fn flush_raw(&mut self, publisher: &dyn Publisher) {
        if let Some(buf) = self.raw.take() {
            if buf.item_count == 0 {
                return;
            }
            publisher
                .publish(&self.cfg.topic_raw, self.cfg.mqtt_qos, false, buf.bytes)
                .await;
            self.stats.incr_raw_published();
        }
    }

    fn append_parsed(&mut self, sample: &Sample) {
        let entry = self.parsed.entry(sample.dn).or_insert_with(|| ParsedBuffer {
            items: Vec::new(),
            opened_at: Instant::now(),
        });
        entry.items.push(SampleJson::from(sample));
    }

    async fn maybe_flush_one_parsed(&mut self, dn: Dn, publisher: &dyn Publisher) {
        let due = self.parsed.get(&dn).is_some_and(|b| {
            b.items.len() >= self.cfg.batch_max_items
                || b.opened_at.elapsed().as_millis() as u64 >= self.cfg.batch_max_ms
        });
        if due {
            self.flush_parsed(dn, publisher).await;
        }
    }

    async fn flush_parsed(&mut self, dn: Dn, publisher: &dyn Publisher) {
        if let Some(buf) = self.parsed.remove(&dn) {
            if buf.items.is_empty() {
                return;
            }
            let payload = encode_batch(&buf.items);
            let topic = etx_protocol::topics::parsed_topic(&self.cfg.topic_parsed_prefix, &dn.hex());
            publisher.publish(&topic, self.cfg.mqtt_qos, false, payload).await;
            self.stats.incr_parsed_published();
        }
    }

    /// Sweep every open buffer and flush anything that has aged out. Called
    /// between items or on an idle timer.
    pub async fn sweep(&mut self, publisher: &dyn Publisher) {
        self.maybe_flush_raw(publisher).await;
        let aged: Vec<Dn> = self
            .parsed
            .iter()
            .filter(|(_, b)| b.opened_at.elapsed().as_millis() as u64 >= self.cfg.batch_max_ms)
            .map(|(dn, _)| *dn)
            .collect();
        for dn in aged {
            self.flush_parsed(dn, publisher).await;
        }
    }
}

fn encode_batch(items: &[SampleJson]) -> Vec<u8> {
    if items.len() == 1 {
        serde_json::to_vec(&items[0]).expect("SampleJson always serializes")
    } else {
        serde_json::to_vec(items).expect("Vec<SampleJson> always serializes")
    }
}
