//! Pipeline capabilities and per-model capacity constraints.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Inference task family a worker can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "text-to-image")]
    TextToImage,
    #[serde(rename = "image-to-image")]
    ImageToImage,
    #[serde(rename = "upscale")]
    Upscale,
    #[serde(rename = "image-to-video")]
    ImageToVideo,
    #[serde(rename = "audio-to-text")]
    AudioToText,
    #[serde(rename = "segment-anything-2")]
    SegmentAnything2,
    #[serde(rename = "llm")]
    Llm,
}

impl Capability {
    pub fn all() -> &'static [Capability] {
        &[
            Self::TextToImage,
            Self::ImageToImage,
            Self::Upscale,
            Self::ImageToVideo,
            Self::AudioToText,
            Self::SegmentAnything2,
            Self::Llm,
        ]
    }

    /// Pipeline identifier as it appears on the wire.
    pub fn pipeline(&self) -> &'static str {
        match self {
            Self::TextToImage => "text-to-image",
            Self::ImageToImage => "image-to-image",
            Self::Upscale => "upscale",
            Self::ImageToVideo => "image-to-video",
            Self::AudioToText => "audio-to-text",
            Self::SegmentAnything2 => "segment-anything-2",
            Self::Llm => "llm",
        }
    }

    /// Whether the pipeline operates on externally hosted input media.
    pub fn requires_media(&self) -> bool {
        matches!(
            self,
            Self::ImageToImage
                | Self::Upscale
                | Self::ImageToVideo
                | Self::AudioToText
                | Self::SegmentAnything2
        )
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.pipeline())
    }
}

impl std::str::FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        resolve_capability(s)
    }
}

/// Map a pipeline identifier to its capability.
pub fn resolve_capability(pipeline: &str) -> Result<Capability> {
    Capability::all()
        .iter()
        .copied()
        .find(|c| c.pipeline() == pipeline)
        .ok_or_else(|| Error::UnknownPipeline(pipeline.to_string()))
}

/// Limits for one model under a capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConstraint {
    #[serde(default)]
    pub warm: bool,
    /// Ceiling on concurrently in-flight jobs.
    #[serde(default)]
    pub capacity: u32,
}

pub type ModelConstraints = BTreeMap<String, ModelConstraint>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConstraints {
    #[serde(default)]
    pub models: ModelConstraints,
}

pub type PerCapabilityConstraints = BTreeMap<Capability, CapabilityConstraints>;

/// True iff `constraints` lists `model_id` under `capability` with capacity left.
pub fn eligible(
    constraints: &PerCapabilityConstraints,
    capability: Capability,
    model_id: &str,
) -> bool {
    constraints
        .get(&capability)
        .and_then(|c| c.models.get(model_id))
        .map(|m| m.capacity > 0)
        .unwrap_or(false)
}

/// Builder-style helper for a single `(capability, model)` entry.
pub fn single_model(
    capability: Capability,
    model_id: &str,
    constraint: ModelConstraint,
) -> PerCapabilityConstraints {
    let mut models = ModelConstraints::new();
    models.insert(model_id.to_string(), constraint);
    let mut constraints = PerCapabilityConstraints::new();
    constraints.insert(capability, CapabilityConstraints { models });
    constraints
}

type SlotKey = (Capability, String);

#[derive(Debug, Default)]
struct RegistryInner {
    constraints: PerCapabilityConstraints,
    in_use: HashMap<SlotKey, u32>,
}

impl RegistryInner {
    fn in_use(&self, capability: Capability, model_id: &str) -> u32 {
        self.in_use
            .get(&(capability, model_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn remaining(&self, capability: Capability, model_id: &str) -> Option<u32> {
        let ceiling = self
            .constraints
            .get(&capability)?
            .models
            .get(model_id)?
            .capacity;
        Some(ceiling.saturating_sub(self.in_use(capability, model_id)))
    }

    /// Constraint table with each ceiling reduced by what is in flight.
    fn available(&self) -> PerCapabilityConstraints {
        let mut out = self.constraints.clone();
        for (capability, caps) in out.iter_mut() {
            for (model_id, model) in caps.models.iter_mut() {
                model.capacity = model.capacity.saturating_sub(self.in_use(*capability, model_id));
            }
        }
        out
    }

    fn is_eligible(&self, capability: Capability, model_id: &str) -> bool {
        eligible(&self.available(), capability, model_id)
    }

    /// Drop model entries with no ceiling and nothing in flight.
    fn prune(&mut self, capability: Capability, model_id: &str) {
        let busy = self.in_use(capability, model_id) > 0;
        if let Some(caps) = self.constraints.get_mut(&capability) {
            let empty = caps
                .models
                .get(model_id)
                .map(|m| m.capacity == 0)
                .unwrap_or(false);
            if empty && !busy {
                caps.models.remove(model_id);
            }
            if caps.models.is_empty() {
                self.constraints.remove(&capability);
            }
        }
    }
}

/// Shared constraint table with atomic capacity slots.
///
/// Every read and every take/return of a slot happens under one lock, so
/// eligibility is always checked against live counts.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    inner: Mutex<RegistryInner>,
}

impl CapabilityRegistry {
    pub fn new(constraints: PerCapabilityConstraints) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                constraints,
                in_use: HashMap::new(),
            }),
        }
    }

    /// Side-effect free eligibility probe.
    pub fn is_eligible(&self, capability: Capability, model_id: &str) -> bool {
        self.inner.lock().is_eligible(capability, model_id)
    }

    /// Remaining capacity, or `None` if the model is not registered.
    pub fn remaining(&self, capability: Capability, model_id: &str) -> Option<u32> {
        self.inner.lock().remaining(capability, model_id)
    }

    pub fn in_flight(&self, capability: Capability, model_id: &str) -> u32 {
        self.inner.lock().in_use(capability, model_id)
    }

    /// Atomically re-check eligibility and take one slot.
    pub fn try_acquire(self: &Arc<Self>, capability: Capability, model_id: &str) -> Option<CapacitySlot> {
        let mut inner = self.inner.lock();
        if !inner.is_eligible(capability, model_id) {
            return None;
        }
        *inner
            .in_use
            .entry((capability, model_id.to_string()))
            .or_insert(0) += 1;
        drop(inner);

        Some(CapacitySlot {
            registry: Arc::clone(self),
            capability,
            model_id: model_id.to_string(),
        })
    }

    fn release(&self, capability: Capability, model_id: &str) {
        let mut inner = self.inner.lock();
        let key = (capability, model_id.to_string());
        if let Some(count) = inner.in_use.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.in_use.remove(&key);
            }
        }
        inner.prune(capability, model_id);
    }

    /// Merge an announced constraint set into the table.
    pub fn add_capacity(&self, constraints: &PerCapabilityConstraints) {
        let mut inner = self.inner.lock();
        for (capability, caps) in constraints {
            let entry = inner.constraints.entry(*capability).or_default();
            for (model_id, constraint) in &caps.models {
                let model = entry.models.entry(model_id.clone()).or_default();
                model.capacity = model.capacity.saturating_add(constraint.capacity);
                model.warm |= constraint.warm;
            }
        }
        debug!("Capacity added for {} capabilities", constraints.len());
    }

    /// Withdraw a previously announced constraint set.
    pub fn remove_capacity(&self, constraints: &PerCapabilityConstraints) {
        let mut inner = self.inner.lock();
        for (capability, caps) in constraints {
            for (model_id, constraint) in &caps.models {
                if let Some(model) = inner
                    .constraints
                    .get_mut(capability)
                    .and_then(|c| c.models.get_mut(model_id))
                {
                    model.capacity = model.capacity.saturating_sub(constraint.capacity);
                }
                inner.prune(*capability, model_id);
            }
        }
        debug!("Capacity removed for {} capabilities", constraints.len());
    }

    /// Constraint ceilings as configured or announced.
    pub fn snapshot(&self) -> PerCapabilityConstraints {
        self.inner.lock().constraints.clone()
    }

    /// Constraints with `capacity` replaced by remaining capacity.
    pub fn available(&self) -> PerCapabilityConstraints {
        self.inner.lock().available()
    }
}

/// One unit of in-flight capacity; returned to the registry on drop.
pub struct CapacitySlot {
    registry: Arc<CapabilityRegistry>,
    capability: Capability,
    model_id: String,
}

impl CapacitySlot {
    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl std::fmt::Debug for CapacitySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacitySlot")
            .field("capability", &self.capability)
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl Drop for CapacitySlot {
    fn drop(&mut self) {
        self.registry.release(self.capability, &self.model_id);
    }
}
