// 上传服务端客户端实现

use crate::api::{
    ApiError, ApiResponse, CheckChunkRequest, CheckChunkResponse, MergeRequest,
    UploadChunkRequest,
};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 上传服务端接口
///
/// 调度器只依赖这个 trait，测试中可以替换为内存实现
#[async_trait]
pub trait ChunkApi: Send + Sync {
    /// 检查分片是否已存在，返回 true 表示无需上传
    async fn check_chunk(&self, request: &CheckChunkRequest) -> Result<bool, ApiError>;

    /// 上传分片数据
    async fn upload_chunk(&self, request: UploadChunkRequest) -> Result<ApiResponse, ApiError>;

    /// 通知服务端合并所有分片
    async fn merge(&self, request: &MergeRequest) -> Result<ApiResponse, ApiError>;
}

/// 基于 HTTP 的上传服务端客户端
#[derive(Debug, Clone)]
pub struct ChunkApiClient {
    /// HTTP客户端
    client: Client,
    /// 服务端地址，如 `http://localhost:3000`
    base_url: String,
}

impl ChunkApiClient {
    /// 创建新的客户端
    ///
    /// # 参数
    /// * `base_url` - 服务端地址
    /// * `timeout` - 单个请求超时时间
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = base_url.trim_end_matches('/').to_string();
        info!("初始化上传客户端: base_url={}", base_url);

        Ok(Self { client, base_url })
    }

    /// 服务端地址
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 读取响应体并解析为 JSON
    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<T, ApiError> {
        let status = response.status();
        let body = response.text().await?;

        debug!("{}响应: status={}, body={}", what, status, body);

        serde_json::from_str(&body).map_err(|e| ApiError::Decode {
            message: format!("{} (http status {})", e, status),
            body,
        })
    }
}

#[async_trait]
impl ChunkApi for ChunkApiClient {
    async fn check_chunk(&self, request: &CheckChunkRequest) -> Result<bool, ApiError> {
        let response = self
            .client
            .post(self.endpoint("/upload/check"))
            .json(request)
            .send()
            .await?;

        let check: CheckChunkResponse = Self::read_json(response, "分片检查").await?;

        if !check.is_success() {
            warn!(
                "分片检查失败: index={}, code={}",
                request.chunk_index, check.status_code
            );
            return Err(ApiError::status(
                check.status_code,
                format!("check chunk #{}", request.chunk_index),
            ));
        }

        Ok(check.exists)
    }

    async fn upload_chunk(&self, request: UploadChunkRequest) -> Result<ApiResponse, ApiError> {
        let chunk_index = request.chunk_index;
        let size = request.chunk_bytes.len();

        // 构建 multipart form
        let part = multipart::Part::bytes(request.chunk_bytes)
            .file_name(request.file_name.clone())
            .mime_str("application/octet-stream")?;

        let form = multipart::Form::new()
            .part("fileChunk", part)
            .text("fileName", request.file_name)
            .text("chunkHash", request.chunk_digest)
            .text("index", chunk_index.to_string())
            .text("chunksCount", request.total_chunks.to_string())
            .text("fileHash", request.file_digest)
            .text("fileSize", request.file_size.to_string())
            .text("fileType", request.file_type);

        debug!("上传分片: index={}, size={}", chunk_index, size);

        let response = self
            .client
            .post(self.endpoint("/upload"))
            .multipart(form)
            .send()
            .await?;

        let upload: ApiResponse = Self::read_json(response, "分片上传").await?;

        if !upload.is_success() {
            warn!(
                "分片上传失败: index={}, code={}, data={}",
                chunk_index, upload.status_code, upload.data
            );
            return Err(ApiError::status(upload.status_code, upload.data.to_string()));
        }

        Ok(upload)
    }

    async fn merge(&self, request: &MergeRequest) -> Result<ApiResponse, ApiError> {
        info!("请求合并分片: file_digest={}", request.file_digest);

        let response = self
            .client
            .post(self.endpoint("/upload/merge"))
            .json(request)
            .send()
            .await?;

        let merged: ApiResponse = Self::read_json(response, "合并").await?;

        if !merged.is_success() {
            return Err(ApiError::status(merged.status_code, merged.data.to_string()));
        }

        info!("合并完成: file_digest={}, data={}", request.file_digest, merged.data);
        Ok(merged)
    }
}
