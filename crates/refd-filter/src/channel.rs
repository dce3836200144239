//! Single-consumer event channel with a bounded send timeout.
//!
//! At most one [`ConsumerPort`] is connected at a time. A send with no
//! consumer fails immediately; otherwise it blocks until the consumer takes
//! the message or the send timeout expires. Dropping the port disconnects it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{ChannelConfig, RecordFormat};
use crate::error::{FilterError, Result};
use crate::record::{decode_path_only, EventRecord};

/// A message as seen by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    Event(EventRecord),
    Path(String),
}

struct Client {
    generation: u64,
    tx: Sender<Vec<u8>>,
}

struct Shared {
    name: String,
    client: Mutex<Option<Client>>,
    generations: AtomicU64,
}

impl Shared {
    fn clear(&self, generation: u64) {
        let mut client = self.client.lock().unwrap_or_else(|e| e.into_inner());
        if client.as_ref().map(|c| c.generation) == Some(generation) {
            *client = None;
            info!(channel = %self.name, "consumer disconnected");
        }
    }
}

pub struct EventChannel {
    shared: Arc<Shared>,
    send_timeout: Duration,
    queue_depth: usize,
    format: RecordFormat,
}

impl EventChannel {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: config.name.clone(),
                client: Mutex::new(None),
                generations: AtomicU64::new(0),
            }),
            send_timeout: config.send_timeout(),
            queue_depth: config.queue_depth,
            format: config.record_format,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn connect(&self) -> Result<ConsumerPort> {
        let mut client = self.shared.client.lock().unwrap_or_else(|e| e.into_inner());
        if client.is_some() {
            return Err(FilterError::ChannelAlreadyConnected {
                name: self.shared.name.clone(),
            });
        }

        let generation = self.shared.generations.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(self.queue_depth);
        *client = Some(Client { generation, tx });
        info!(channel = %self.shared.name, generation, "consumer connected");

        Ok(ConsumerPort {
            shared: self.shared.clone(),
            generation,
            rx,
            format: self.format,
        })
    }

    /// Host-side disconnect of whatever consumer is connected.
    pub fn disconnect(&self) {
        let mut client = self.shared.client.lock().unwrap_or_else(|e| e.into_inner());
        if client.take().is_some() {
            info!(channel = %self.shared.name, "consumer disconnected by host");
        }
    }

    pub fn send(&self, record: &EventRecord) -> Result<()> {
        let payload = record.encode_as(self.format)?;
        self.send_raw(payload)
    }

    pub fn send_raw(&self, payload: Vec<u8>) -> Result<()> {
        let (generation, tx) = {
            let client = self.shared.client.lock().unwrap_or_else(|e| e.into_inner());
            match client.as_ref() {
                Some(c) => (c.generation, c.tx.clone()),
                None => {
                    return Err(FilterError::ChannelNotConnected {
                        name: self.shared.name.clone(),
                    })
                }
            }
        };

        let len = payload.len();
        match tx.send_timeout(payload, self.send_timeout) {
            Ok(()) => {
                debug!(channel = %self.shared.name, bytes = len, "event delivered");
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => Err(FilterError::ChannelTimeout {
                name: self.shared.name.clone(),
                timeout_ms: self.send_timeout.as_millis() as u64,
            }),
            Err(SendTimeoutError::Disconnected(_)) => {
                self.shared.clear(generation);
                Err(FilterError::ChannelDisconnected {
                    name: self.shared.name.clone(),
                })
            }
        }
    }
}

/// Consumer end of the channel.
pub struct ConsumerPort {
    shared: Arc<Shared>,
    generation: u64,
    rx: Receiver<Vec<u8>>,
    format: RecordFormat,
}

impl ConsumerPort {
    fn decode(&self, bytes: Vec<u8>) -> Result<Message> {
        match self.format {
            RecordFormat::Full => EventRecord::decode(&bytes).map(Message::Event),
            RecordFormat::PathOnly => decode_path_only(&bytes).map(Message::Path),
        }
    }

    fn disconnected(&self) -> FilterError {
        FilterError::ChannelDisconnected {
            name: self.shared.name.clone(),
        }
    }

    pub fn recv(&self) -> Result<Message> {
        let bytes = self.rx.recv().map_err(|_| self.disconnected())?;
        self.decode(bytes)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match self.rx.recv_timeout(timeout) {
            Ok(bytes) => self.decode(bytes).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    pub fn try_recv(&self) -> Result<Option<Message>> {
        match self.rx.try_recv() {
            Ok(bytes) => self.decode(bytes).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.disconnected()),
        }
    }

    pub fn disconnect(self) {}
}

impl Drop for ConsumerPort {
    fn drop(&mut self) {
        self.shared.clear(self.generation);
    }
}
