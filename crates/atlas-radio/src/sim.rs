//! In-memory simulated radio bus with configurable loss, for tests (§4.8).
//!
//! Grounded on the teacher workspace's `crossbeam-channel` dependency and
//! `strata-bonding::net::transport`'s pattern of a single reader/writer
//! task per link (§5 Shared-resource policy: "single reader task, single
//! writer task; duplex via an internal queue").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::Rng;
use tracing::trace;

use crate::adapter::{check_frame_size, RadioAdapter, RadioError};

struct BusInner {
    links: Mutex<HashMap<String, Sender<(String, Bytes)>>>,
    loss_probability: f64,
}

/// Shared bus that [`SimRadioAdapter`]s register against. Clone cheaply via
/// `Arc` — every adapter holds the same bus.
#[derive(Clone)]
pub struct SimBus {
    inner: Arc<BusInner>,
}

impl SimBus {
    /// `loss_probability` is the chance (0.0–1.0) that a `send` is silently
    /// dropped, simulating the lossy mesh medium (§1).
    pub fn new(loss_probability: f64) -> Self {
        SimBus {
            inner: Arc::new(BusInner {
                links: Mutex::new(HashMap::new()),
                loss_probability: loss_probability.clamp(0.0, 1.0),
            }),
        }
    }

    /// Register a new node on the bus and get back its adapter handle.
    pub fn register(&self, node_id: impl Into<String>) -> SimRadioAdapter {
        let node_id = node_id.into();
        let (tx, rx) = unbounded();
        self.inner.links.lock().unwrap().insert(node_id.clone(), tx);
        SimRadioAdapter {
            node_id,
            bus: self.clone(),
            inbox: rx,
        }
    }
}

/// One node's view of a [`SimBus`].
pub struct SimRadioAdapter {
    node_id: String,
    bus: SimBus,
    inbox: Receiver<(String, Bytes)>,
}

impl RadioAdapter for SimRadioAdapter {
    fn send(&self, destination_node_id: &str, frame: Bytes) -> Result<(), RadioError> {
        check_frame_size(&frame)?;

        if self.bus.inner.loss_probability > 0.0 {
            let roll: f64 = rand::rng().random_range(0.0..1.0);
            if roll < self.bus.inner.loss_probability {
                trace!(from = %self.node_id, to = destination_node_id, "simulated loss, frame dropped");
                return Ok(());
            }
        }

        let links = self.bus.inner.links.lock().unwrap();
        match links.get(destination_node_id) {
            Some(tx) => {
                let _ = tx.send((self.node_id.clone(), frame));
                Ok(())
            }
            None => Err(RadioError::SendFailed(format!(
                "no node registered as {destination_node_id}"
            ))),
        }
    }

    fn recv(&self) -> Result<(String, Bytes), RadioError> {
        self.inbox.recv().map_err(|_| RadioError::Closed)
    }
}
