//! Active Learning Module
//! Mission: Label pool, model lifecycle, candidate selection, and retraining

pub mod events;
pub mod labels;
pub mod promote;
pub mod registry;
pub mod replay;
pub mod retrain;
pub mod sampler;
pub mod training_config;
pub mod worker;

pub use events::{Event, EventLog, EventType};
pub use labels::{LabelPool, LabelRecord};
pub use promote::AutoPromoter;
pub use registry::{ModelRegistry, ModelStatus};
pub use retrain::{RetrainOptions, Retrainer};
pub use worker::{RetrainJob, RetrainWorker};
