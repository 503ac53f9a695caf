//! HTTP 服务器模块 - 使用 Axum 提供生成请求网关 API
//!
//! 功能包括：
//! - 提交生成请求（立即处理或排队）
//! - 查询请求状态
//! - 健康检查与 Prometheus 指标

pub mod routes;
pub mod server;

pub use server::{build_router, HttpServerState, LimiterHttpServer};
