use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One chunk of multicast payload as it is handed downstream
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Payload {
    pub data: Bytes,
    /// The chunk arrived truncated. It is delivered anyway, and it is up to the consumer to
    ///  deal with the gap.
    pub corrupted: bool,
}

impl Payload {
    pub fn new(data: &[u8], corrupted: bool) -> Payload {
        Payload {
            data: Bytes::copy_from_slice(data),
            corrupted,
        }
    }
}

#[async_trait]
pub trait PayloadSink: Send + Sync {
    async fn deliver(&self, payload: Payload) -> anyhow::Result<()>;
}

#[async_trait]
impl PayloadSink for mpsc::Sender<Payload> {
    async fn deliver(&self, payload: Payload) -> anyhow::Result<()> {
        self.send(payload).await
            .map_err(|_| anyhow!("payload consumer went away"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink() {
        let (send, mut recv) = mpsc::channel(4);
        send.deliver(Payload::new(b"abc", false)).await.unwrap();
        send.deliver(Payload::new(b"de", true)).await.unwrap();

        assert_eq!(recv.recv().await, Some(Payload::new(b"abc", false)));
        assert_eq!(recv.recv().await, Some(Payload::new(b"de", true)));

        drop(recv);
        assert!(send.deliver(Payload::new(b"f", false)).await.is_err());
    }
}
