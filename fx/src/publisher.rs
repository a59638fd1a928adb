//! Hand-off of raw and calculated rates to the durable log.

use ratefeed_common::{CalculatedRate, RawRate};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::PublishError;

/// A record with a natural identity used as its log key.
pub trait PublishedRecord: Serialize {
    fn key(&self) -> String;
}

impl PublishedRecord for RawRate {
    /// `<provider>:<TYPE>`
    fn key(&self) -> String {
        format!("{}:{}", self.provider, self.pair)
    }
}

impl PublishedRecord for CalculatedRate {
    /// `<TYPE>`
    fn key(&self) -> String {
        self.pair.to_string()
    }
}

/// Sink for the raw-rate and calculated-rate streams.
pub trait RatePublisher: Send + Sync {
    fn publish_raw(&self, rate: &RawRate) -> Result<(), PublishError>;

    fn publish_calculated(&self, rate: &CalculatedRate) -> Result<(), PublishError>;
}

/// Emits every record as a structured log event on `ratefeed::published`.
#[derive(Debug, Default, Clone)]
pub struct TracingPublisher;

impl TracingPublisher {
    fn emit<R: PublishedRecord>(&self, topic: &'static str, record: &R) -> Result<(), PublishError> {
        let key = record.key();
        let payload = serde_json::to_string(record).map_err(|e| PublishError::Encoding {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        info!(target: "ratefeed::published", topic, key = %key, payload = %payload, "Record published");
        Ok(())
    }
}

impl RatePublisher for TracingPublisher {
    fn publish_raw(&self, rate: &RawRate) -> Result<(), PublishError> {
        self.emit("raw-rates", rate)
    }

    fn publish_calculated(&self, rate: &CalculatedRate) -> Result<(), PublishError> {
        self.emit("calc-rates", rate)
    }
}

/// Record as it leaves the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Published {
    Raw(RawRate),
    Calculated(CalculatedRate),
}

/// Forwards records into an unbounded channel, e.g. towards a broker client.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<Published>,
}

impl ChannelPublisher {
    /// Create a publisher and the receiving end of its stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Published>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RatePublisher for ChannelPublisher {
    fn publish_raw(&self, rate: &RawRate) -> Result<(), PublishError> {
        self.tx
            .send(Published::Raw(rate.clone()))
            .map_err(|_| PublishError::ChannelClosed { key: rate.key() })
    }

    fn publish_calculated(&self, rate: &CalculatedRate) -> Result<(), PublishError> {
        self.tx
            .send(Published::Calculated(rate.clone()))
            .map_err(|_| PublishError::ChannelClosed { key: rate.key() })
    }
}
