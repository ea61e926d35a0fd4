//! HTTP 客户端与服务端接口约定的集成测试

mod common;

use chunk_uploader::api::{
    ApiError, ChunkApi, ChunkApiClient, CheckChunkRequest, MergeRequest, UploadChunkRequest,
};
use common::{spawn_server, MockServer};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn client(base_url: &str) -> ChunkApiClient {
    ChunkApiClient::new(base_url, Duration::from_secs(5)).unwrap()
}

fn check_request(index: usize) -> CheckChunkRequest {
    CheckChunkRequest {
        chunk_index: index,
        chunk_digest: format!("digest-{}", index),
        file_name: "video.mp4".to_string(),
        file_digest: "file-digest".to_string(),
    }
}

fn upload_request(index: usize, data: &[u8]) -> UploadChunkRequest {
    UploadChunkRequest {
        chunk_bytes: data.to_vec(),
        file_name: "video.mp4".to_string(),
        chunk_digest: format!("{:x}", md5::compute(data)),
        chunk_index: index,
        total_chunks: 3,
        file_digest: "file-digest".to_string(),
        file_size: 12,
        file_type: "video/mp4".to_string(),
    }
}

#[tokio::test]
async fn check_chunk_sends_documented_fields() {
    let server = MockServer::default();
    server.existing.lock().unwrap().insert(1);
    let (state, base_url) = spawn_server(server).await;
    let client = client(&base_url);

    assert!(!client.check_chunk(&check_request(0)).await.unwrap());
    assert!(client.check_chunk(&check_request(1)).await.unwrap());

    let checks = state.checks.lock().unwrap().clone();
    assert_eq!(checks.len(), 2);
    assert_eq!(checks[1]["index"], 1);
    assert_eq!(checks[1]["chunkHash"], "digest-1");
    assert_eq!(checks[1]["fileName"], "video.mp4");
    assert_eq!(checks[1]["fileHash"], "file-digest");
}

#[tokio::test]
async fn check_chunk_maps_error_code() {
    let server = MockServer::default();
    server.check_code.store(500, Ordering::SeqCst);
    let (_state, base_url) = spawn_server(server).await;

    let result = client(&base_url).check_chunk(&check_request(0)).await;
    assert!(matches!(result, Err(ApiError::Status { code: 500, .. })));
}

#[tokio::test]
async fn check_chunk_reports_undecodable_body() {
    let server = MockServer::default();
    server.check_garbage.store(true, Ordering::SeqCst);
    let (_state, base_url) = spawn_server(server).await;

    match client(&base_url).check_chunk(&check_request(0)).await {
        Err(ApiError::Decode { body, .. }) => assert!(body.contains("bad gateway")),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn upload_chunk_sends_multipart_fields() {
    let (state, base_url) = spawn_server(MockServer::default()).await;
    let data = b"hello chunk!";

    let response = client(&base_url)
        .upload_chunk(upload_request(2, data))
        .await
        .unwrap();
    assert!(response.is_success());

    let uploads = state.uploads_by_index();
    assert_eq!(uploads.len(), 1);
    let chunk = &uploads[0];
    assert_eq!(chunk.data, data);
    assert_eq!(chunk.file_name.as_deref(), Some("video.mp4"));
    assert_eq!(chunk.fields["fileName"], "video.mp4");
    assert_eq!(chunk.fields["chunkHash"], format!("{:x}", md5::compute(data)));
    assert_eq!(chunk.fields["index"], "2");
    assert_eq!(chunk.fields["chunksCount"], "3");
    assert_eq!(chunk.fields["fileHash"], "file-digest");
    assert_eq!(chunk.fields["fileSize"], "12");
    assert_eq!(chunk.fields["fileType"], "video/mp4");
}

#[tokio::test]
async fn upload_chunk_maps_error_code() {
    let server = MockServer::default();
    server.upload_code.store(413, Ordering::SeqCst);
    let (_state, base_url) = spawn_server(server).await;

    let result = client(&base_url).upload_chunk(upload_request(0, b"x")).await;
    assert!(matches!(result, Err(ApiError::Status { code: 413, .. })));
}

#[tokio::test]
async fn merge_sends_file_digest() {
    let (state, base_url) = spawn_server(MockServer::default()).await;
    let client = client(&base_url);

    let response = client
        .merge(&MergeRequest {
            file_digest: "abc".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.data, "merged");

    let merges = state.merges.lock().unwrap().clone();
    assert_eq!(merges.len(), 1);
    assert_eq!(merges[0]["fileHash"], "abc");
}

#[tokio::test]
async fn merge_maps_error_code() {
    let server = MockServer::default();
    server.merge_code.store(500, Ordering::SeqCst);
    let (_state, base_url) = spawn_server(server).await;

    let result = client(&base_url)
        .merge(&MergeRequest {
            file_digest: "abc".to_string(),
        })
        .await;
    assert!(matches!(result, Err(ApiError::Status { code: 500, .. })));
}

#[tokio::test]
async fn unreachable_server_is_request_error() {
    // 绑定后立即释放端口，保证没有监听者
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = client(&format!("http://{}", addr))
        .check_chunk(&check_request(0))
        .await;
    assert!(matches!(result, Err(ApiError::Request(_))));
}
