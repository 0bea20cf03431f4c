//! In-flight raster decodes of one render target.
//!
//! Every scheduled decode is stamped with the key's next generation. Only a
//! completion carrying the key's current generation is delivered; anything
//! older is reported as stale and dropped. Superseded, cancelled and
//! torn-down decodes are also aborted through their task's abort handle.

use image::RgbaImage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::DiplomaError;
use crate::loader::{LoadPurpose, RasterLoader, RasterPayload};
use crate::model::{FieldKey, FieldRecord};

/// A decode result as sent back by the decode task.
#[derive(Debug)]
pub struct Completion {
    pub key: FieldKey,
    pub generation: u64,
    pub result: Result<Arc<RgbaImage>, DiplomaError>,
}

/// What [`DecodeQueue::next`] hands back.
#[derive(Debug)]
pub enum Delivery {
    /// The latest decode for `key`, with the record it was scheduled for.
    Current {
        key: FieldKey,
        record: FieldRecord,
        result: Result<Arc<RgbaImage>, DiplomaError>,
    },
    /// A superseded decode finished anyway; its result was discarded.
    Stale { key: FieldKey, generation: u64 },
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    record: FieldRecord,
    abort: AbortHandle,
}

#[derive(Debug)]
pub struct DecodeQueue {
    generations: HashMap<FieldKey, u64>,
    inflight: HashMap<FieldKey, InFlight>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl Default for DecodeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            generations: HashMap::new(),
            inflight: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Current generation of a key (0 if nothing was ever scheduled).
    pub fn generation(&self, key: &FieldKey) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: &FieldKey) -> u64 {
        let generation = self.generations.entry(key.clone()).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Start decoding `payload` for `key`, superseding any earlier decode.
    ///
    /// Must run inside a Tokio runtime.
    pub fn schedule(
        &mut self,
        loader: &RasterLoader,
        key: FieldKey,
        record: FieldRecord,
        payload: RasterPayload,
        purpose: LoadPurpose,
    ) -> Result<u64, DiplomaError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            DiplomaError::Configuration(format!("decodes need a Tokio runtime: {}", e))
        })?;
        self.cancel(&key);
        let generation = self.bump(&key);

        let tx = self.tx.clone();
        let loader = loader.clone();
        let task_key = key.clone();
        let task = runtime.spawn(async move {
            let result = loader.load(payload, purpose).await;
            // The queue may be gone already; nothing to deliver to then
            let _ = tx.send(Completion {
                key: task_key,
                generation,
                result,
            });
        });

        self.inflight.insert(
            key,
            InFlight {
                generation,
                record,
                abort: task.abort_handle(),
            },
        );
        Ok(generation)
    }

    /// The record an outstanding decode for `key` was scheduled with.
    pub fn pending(&self, key: &FieldKey) -> Option<&FieldRecord> {
        self.inflight.get(key).map(|f| &f.record)
    }

    /// Abort the outstanding decode for `key`, if any, and invalidate its generation.
    pub fn cancel(&mut self, key: &FieldKey) -> bool {
        match self.inflight.remove(key) {
            Some(flight) => {
                flight.abort.abort();
                self.bump(key);
                true
            }
            None => false,
        }
    }

    pub fn inflight_keys(&self) -> Vec<FieldKey> {
        self.inflight.keys().cloned().collect()
    }

    pub fn is_idle(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Wait for the next completion. `None` once nothing is in flight and
    /// no late completions are queued.
    pub async fn next(&mut self) -> Option<Delivery> {
        let completion = if self.inflight.is_empty() {
            self.rx.try_recv().ok()?
        } else {
            self.rx.recv().await?
        };
        Some(self.classify(completion))
    }

    fn classify(&mut self, completion: Completion) -> Delivery {
        let Completion {
            key,
            generation,
            result,
        } = completion;
        let current = self.generation(&key) == generation
            && self
                .inflight
                .get(&key)
                .is_some_and(|f| f.generation == generation);
        if !current {
            return Delivery::Stale { key, generation };
        }
        match self.inflight.remove(&key) {
            Some(flight) => Delivery::Current {
                key,
                record: flight.record,
                result,
            },
            None => Delivery::Stale { key, generation },
        }
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, completion: Completion) {
        let _ = self.tx.send(completion);
    }
}

impl Drop for DecodeQueue {
    fn drop(&mut self) {
        for (_, flight) in self.inflight.drain() {
            flight.abort.abort();
        }
    }
}
