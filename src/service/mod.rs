// 业务服务层模块
pub mod classifier;
pub mod generation;
pub mod submission;

pub use classifier::classify;
pub use generation::{
    build_processor, ChunkStream, GenerationProcessor, HttpGenerationProcessor,
    MockGenerationProcessor,
};
pub use submission::{SubmissionOutcome, SubmissionService};
