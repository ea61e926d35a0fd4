// 上传服务端接口类型定义
//
// 字段名与服务端约定保持一致（index / chunkHash / fileHash ...），
// Rust 侧统一使用 chunk_digest / file_digest 命名

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 服务端成功状态码
pub const SUCCESS_CODE: u16 = 200;

/// 分片存在性检查请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckChunkRequest {
    /// 分片索引
    #[serde(rename = "index")]
    pub chunk_index: usize,
    /// 分片 MD5
    #[serde(rename = "chunkHash")]
    pub chunk_digest: String,
    /// 文件名
    #[serde(rename = "fileName")]
    pub file_name: String,
    /// 整个文件的摘要
    #[serde(rename = "fileHash")]
    pub file_digest: String,
}

/// 分片存在性检查响应
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckChunkResponse {
    /// 状态码（200 表示成功）
    #[serde(rename = "code")]
    pub status_code: u16,
    /// 分片是否已存在于服务端
    #[serde(rename = "data", default)]
    pub exists: bool,
}

impl CheckChunkResponse {
    pub fn is_success(&self) -> bool {
        self.status_code == SUCCESS_CODE
    }
}

/// 分片上传请求（multipart）
#[derive(Debug, Clone)]
pub struct UploadChunkRequest {
    /// 分片数据
    pub chunk_bytes: Vec<u8>,
    /// 文件名
    pub file_name: String,
    /// 分片 MD5
    pub chunk_digest: String,
    /// 分片索引
    pub chunk_index: usize,
    /// 分片总数
    pub total_chunks: usize,
    /// 整个文件的摘要
    pub file_digest: String,
    /// 文件大小
    pub file_size: u64,
    /// 文件 MIME 类型
    pub file_type: String,
}

/// 通用响应：上传分片、合并文件都使用 `{code, data}` 结构
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse {
    /// 状态码（200 表示成功）
    #[serde(rename = "code")]
    pub status_code: u16,
    /// 附带数据（服务端自定义）
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status_code == SUCCESS_CODE
    }
}

/// 合并请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeRequest {
    #[serde(rename = "fileHash")]
    pub file_digest: String,
}

/// 接口调用错误
///
/// 所有变体都视为可重试的瞬时错误，由 RetryPolicy 和单次重新入队处理
#[derive(Debug, Error)]
pub enum ApiError {
    /// 请求发送或读取失败（连接、超时、DNS 等）
    #[error("请求失败: {0}")]
    Request(#[from] reqwest::Error),

    /// 服务端返回非成功状态码
    #[error("服务端返回错误状态: code={code}, body={body}")]
    Status { code: u16, body: String },

    /// 响应体无法解析
    #[error("解析响应失败: {message}, body={body}")]
    Decode { message: String, body: String },

    /// 读取本地分片数据失败
    #[error("读取分片数据失败: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// 构造状态码错误
    pub fn status(code: u16, body: impl Into<String>) -> Self {
        ApiError::Status {
            code,
            body: body.into(),
        }
    }
}
