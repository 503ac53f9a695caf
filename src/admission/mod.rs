//! 准入控制：按类别的分布式信号量
//!
//! - `acquire` 在超时内轮询原子条件扣减，成功返回 [`AdmissionPermit`]
//! - `release` 条件增加，永远不会超过上限
//! - 后台任务按固定周期把所有计数重置为上限（固定窗口补充）

mod controller;
mod permit;

pub use controller::{AdmissionController, CapacitySnapshot};
pub use permit::{run_admitted, AdmissionPermit};

use crate::error::ServerError;

/// 准入失败原因
///
/// 超时是预期内的控制流分支（转入排队/退避），不是错误。
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("admission timed out")]
    TimedOut,
    #[error("admission cancelled by shutdown")]
    Cancelled,
    #[error("capacity store unavailable: {0}")]
    Store(ServerError),
}
