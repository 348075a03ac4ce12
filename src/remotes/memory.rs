use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::remotes::pubsub::PubsubTransport;

/// Process-wide registry of in-memory domain fabrics: domain name → channel
/// name → subscribers.
static FABRICS: Lazy<Mutex<HashMap<String, Fabric>>> = Lazy::new(Default::default);

type Subscriber = mpsc::UnboundedSender<(String, Vec<u8>)>;

#[derive(Default)]
struct Fabric {
    channels: HashMap<String, Vec<Subscriber>>,
}

/// An in-process pub/sub fabric: every transport created for the same
/// domain name shares channels. Used by tests and demos in place of a
/// broker binding.
pub struct MemoryTransport {
    domain: String,
    address: String,
}

impl MemoryTransport {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            address: Uuid::new_v4().to_string(),
        }
    }

    /// Drop a whole domain fabric; lets tests start clean.
    pub fn reset_domain(domain: &str) {
        FABRICS.lock().unwrap().remove(domain);
    }
}

#[async_trait]
impl PubsubTransport for MemoryTransport {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn publish(&self, channel: &str, data: Vec<u8>) -> EngineResult<()> {
        let subscribers: Vec<Subscriber> = {
            let mut fabrics = FABRICS.lock().unwrap();
            let fabric = fabrics.entry(self.domain.clone()).or_default();
            let subs = fabric.channels.entry(channel.to_string()).or_default();
            subs.retain(|s| !s.is_closed());
            subs.clone()
        };
        for sub in subscribers {
            let _ = sub.send((self.address.clone(), data.clone()));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> EngineResult<mpsc::UnboundedReceiver<(String, Vec<u8>)>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut fabrics = FABRICS.lock().unwrap();
        let fabric = fabrics.entry(self.domain.clone()).or_default();
        fabric
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let a = MemoryTransport::new("fabric-test-1.example.org");
        let b = MemoryTransport::new("fabric-test-1.example.org");
        let mut rx_a = a.subscribe("chat").await.unwrap();
        let mut rx_b = b.subscribe("chat").await.unwrap();

        a.publish("chat", b"hello".to_vec()).await.unwrap();
        // Both fabrics see the message, tagged with the publisher
        let (from, data) = rx_a.recv().await.unwrap();
        assert_eq!(from, a.address());
        assert_eq!(data, b"hello");
        let (from, _) = rx_b.recv().await.unwrap();
        assert_eq!(from, a.address());
    }

    #[tokio::test]
    async fn domains_are_isolated() {
        let a = MemoryTransport::new("fabric-test-2.example.org");
        let b = MemoryTransport::new("fabric-test-3.example.org");
        let mut rx_b = b.subscribe("chat").await.unwrap();
        a.publish("chat", b"hello".to_vec()).await.unwrap();
        assert!(rx_b.try_recv().is_err());
    }
}
