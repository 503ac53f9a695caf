//! HTTP 服务器 - 使用 Axum 提供生成请求网关

use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::admission::AdmissionController;
use crate::error::{Result, ServerError};
use crate::http::routes;
use crate::infra::{OverflowQueue, RedisClient};
use crate::repository::RequestRecordStore;
use crate::service::SubmissionService;

/// HTTP 服务器共享状态
#[derive(Clone)]
pub struct HttpServerState {
    pub submission: Arc<SubmissionService>,
    pub controller: Arc<AdmissionController>,
    pub records: Arc<dyn RequestRecordStore>,
    pub queue: Arc<OverflowQueue>,
    /// 仅用于上报连接池指标
    pub redis: Option<RedisClient>,
}

/// 构建完整路由（测试中直接使用）
pub fn build_router(state: HttpServerState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP 服务器
pub struct LimiterHttpServer {
    state: HttpServerState,
    bind_address: String,
}

impl LimiterHttpServer {
    pub fn new(state: HttpServerState, bind_address: impl Into<String>) -> Self {
        Self {
            state,
            bind_address: bind_address.into(),
        }
    }

    /// 启动 HTTP 服务器，收到关闭信号后停止接收新连接并等待进行中的请求完成
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let app = build_router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| {
                ServerError::Configuration(format!("无法绑定 {}: {}", self.bind_address, e))
            })?;

        info!("🌐 HTTP 服务器启动在 {}", self.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("🛑 HTTP 服务器已停止");
        Ok(())
    }
}
