//! Inference models run by the pipeline's worker stage.
//!
//! A [`Model`] is a stateful unit with the capability set load / run / name.
//! Instances are not thread-safe; the pipeline's model pool guarantees that
//! at most one worker drives a given instance at a time. Construction goes
//! through an explicit [`ModelRegistry`] value handed to the pipeline, so
//! there is no process-global factory with initialization-order surprises.

use std::{collections::HashMap, path::Path, sync::Arc};

use serde::Deserialize;
use thiserror::Error;
use video_ingest::Frame;

mod test_model;
mod yolo;

pub use test_model::TestModel;
pub use yolo::Yolov5;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to load model weights from {path:?}: {source}")]
    Load {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("inference failed: {0}")]
    Inference(#[from] anyhow::Error),
    #[error("unsupported frame format {0}")]
    UnsupportedFormat(&'static str),
}

/// A stateful inference unit that may annotate or transform a frame in place.
pub trait Model: Send {
    /// Load weights from disk. Called once, before the first `run`.
    fn load(&mut self, path: &Path) -> Result<(), ModelError>;

    /// Run inference on the frame's pixel buffer in place.
    fn run(&mut self, frame: &mut Frame) -> Result<(), ModelError>;

    /// Model name for logs.
    fn name(&self) -> &'static str;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
/// Model kinds known to the built-in registry.
pub enum ModelKind {
    TestModel,
    Yolov5,
}

impl ModelKind {
    pub fn name(self) -> &'static str {
        match self {
            ModelKind::TestModel => "TestModel",
            ModelKind::Yolov5 => "Yolov5",
        }
    }
}

type Constructor = Arc<dyn Fn() -> Box<dyn Model> + Send + Sync>;

#[derive(Clone, Default)]
/// Registry of model constructors keyed by kind.
///
/// Cheap to clone; clones share the constructor table.
pub struct ModelRegistry {
    creators: HashMap<ModelKind, Constructor>,
}

impl ModelRegistry {
    /// Empty registry, for callers that wire their own model set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every built-in model kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ModelKind::TestModel, || Box::new(TestModel::new()));
        registry.register(ModelKind::Yolov5, || Box::new(Yolov5::new()));
        registry
    }

    /// Register (or replace) the constructor for a model kind.
    pub fn register(
        &mut self,
        kind: ModelKind,
        ctor: impl Fn() -> Box<dyn Model> + Send + Sync + 'static,
    ) {
        self.creators.insert(kind, Arc::new(ctor));
    }

    /// Construct an unloaded instance of the requested kind.
    pub fn build(&self, kind: ModelKind) -> Option<Box<dyn Model>> {
        self.creators.get(&kind).map(|ctor| ctor())
    }
}
