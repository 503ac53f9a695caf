//! 数据模型模块

pub mod category;
pub mod queue_entry;
pub mod request;

pub use category::Category;
pub use queue_entry::{QueueEntry, QUEUE_ENTRY_VERSION};
pub use request::{Attachment, GenerationInput, RequestRecord, RequestStatus};
