//! Synchronous keyed publishing into an input stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::broker::Broker;
use crate::codec::Codec;
use crate::error::EmitError;
use crate::live::stopped;
use crate::record::RecordPosition;

/// Publishes typed values to one topic.
///
/// `Clone` is cheap.
pub struct Emitter<T> {
    broker: Broker,
    topic: String,
    codec: Arc<dyn Codec<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            topic: self.topic.clone(),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").field("topic", &self.topic).finish()
    }
}

impl<T: 'static> Emitter<T> {
    /// Create an emitter for `topic`, creating the topic with `partitions`
    /// partitions if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::Log`] if the topic exists with a different
    /// partition count.
    pub fn new(
        broker: Broker,
        topic: impl Into<String>,
        partitions: u32,
        codec: impl Codec<T>,
    ) -> Result<Self, EmitError> {
        let topic = topic.into();
        broker.create_topic(&topic, partitions)?;
        Ok(Self {
            broker,
            topic,
            codec: Arc::new(codec),
        })
    }

    /// Target topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish `value` under `key` and wait until it is durable.
    ///
    /// Records for the same key are appended in call order.
    ///
    /// # Errors
    ///
    /// * [`EmitError::Codec`] -- `value` could not be encoded.
    /// * [`EmitError::Log`] -- the append failed after retries.
    pub async fn emit_sync(&self, key: &str, value: &T) -> Result<RecordPosition, EmitError> {
        let bytes = self.codec.encode(value)?;
        Ok(self.broker.produce(&self.topic, key, &bytes).await?)
    }
}

/// Cycles through `"{prefix}0"` .. `"{prefix}{size-1}"`.
#[derive(Debug, Clone)]
pub struct KeyRotation {
    prefix: String,
    size: u64,
    next: u64,
}

impl KeyRotation {
    /// A rotation over `size` keys. A `size` of zero is treated as one.
    pub fn new(prefix: impl Into<String>, size: u64) -> Self {
        Self {
            prefix: prefix.into(),
            size: size.max(1),
            next: 0,
        }
    }
}

impl Iterator for KeyRotation {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let key = format!("{}{}", self.prefix, self.next % self.size);
        self.next = self.next.wrapping_add(1);
        Some(key)
    }
}

/// Emit one value per `interval` tick, rotating keys, until `shutdown`
/// carries `true`.
///
/// Returns the number of records emitted.
///
/// # Errors
///
/// The first publish failure ends the loop and is returned.
pub async fn run_ticker<T, F>(
    emitter: Emitter<T>,
    interval: Duration,
    mut keys: KeyRotation,
    mut payload: F,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64, EmitError>
where
    T: 'static,
    F: FnMut() -> T,
{
    let mut ticker = tokio::time::interval(interval);
    let mut emitted = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {
                let key = keys.next().unwrap_or_default();
                let value = payload();
                let position = emitter.emit_sync(&key, &value).await?;
                emitted += 1;
                tracing::debug!(
                    topic = %emitter.topic,
                    key = %key,
                    partition = position.partition,
                    offset = position.offset,
                    "emitted"
                );
            }
        }
    }
    tracing::info!(topic = %emitter.topic, emitted, "emitter stopped");
    Ok(emitted)
}

/// Current time as an RFC 3339 string, the default ticker payload.
pub fn now_payload() -> String {
    chrono::Utc::now().to_rfc3339()
}
