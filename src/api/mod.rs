// 上传服务端接口模块
//
// 只描述请求/响应约定，服务端实现不在本 crate 范围内

pub mod client;
pub mod types;

pub use client::{ChunkApi, ChunkApiClient};
pub use types::{
    ApiError, ApiResponse, CheckChunkRequest, CheckChunkResponse, MergeRequest,
    UploadChunkRequest, SUCCESS_CODE,
};
