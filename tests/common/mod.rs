//! 集成测试用的内存上传服务端
//!
//! 实现 `/upload/check`、`/upload`、`/upload/merge` 三个接口，并记录收到的请求

#![allow(dead_code)]

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// 服务端收到的一个分片
#[derive(Debug, Clone)]
pub struct ReceivedChunk {
    pub file_name: Option<String>,
    pub data: Vec<u8>,
    pub fields: HashMap<String, String>,
}

impl ReceivedChunk {
    pub fn index(&self) -> usize {
        self.fields
            .get("index")
            .and_then(|v| v.parse().ok())
            .unwrap_or(usize::MAX)
    }
}

/// 服务端状态与行为开关
pub struct MockServer {
    /// 已存在的分片索引
    pub existing: Mutex<HashSet<usize>>,
    /// 检查接口返回的 code
    pub check_code: AtomicU16,
    /// 检查接口返回无法解析的响应体
    pub check_garbage: AtomicBool,
    /// 上传接口返回的 code
    pub upload_code: AtomicU16,
    /// 合并接口返回的 code
    pub merge_code: AtomicU16,
    /// 每个分片剩余的上传失败次数
    pub upload_failures: Mutex<HashMap<usize, u32>>,
    pub checks: Mutex<Vec<Value>>,
    pub uploads: Mutex<Vec<ReceivedChunk>>,
    pub merges: Mutex<Vec<Value>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self {
            existing: Mutex::new(HashSet::new()),
            check_code: AtomicU16::new(200),
            check_garbage: AtomicBool::new(false),
            upload_code: AtomicU16::new(200),
            merge_code: AtomicU16::new(200),
            upload_failures: Mutex::new(HashMap::new()),
            checks: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            merges: Mutex::new(Vec::new()),
        }
    }
}

impl MockServer {
    pub fn uploads_by_index(&self) -> Vec<ReceivedChunk> {
        let mut uploads = self.uploads.lock().unwrap().clone();
        uploads.sort_by_key(ReceivedChunk::index);
        uploads
    }
}

/// 启动服务端，返回状态与 base_url
pub async fn spawn_server(server: MockServer) -> (Arc<MockServer>, String) {
    let state = Arc::new(server);

    let app = Router::new()
        .route("/upload/check", post(check_chunk))
        .route("/upload", post(upload_chunk))
        .route("/upload/merge", post(merge))
        .layer(DefaultBodyLimit::max(32 * 1024 * 1024))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, format!("http://{}", addr))
}

async fn check_chunk(State(state): State<Arc<MockServer>>, Json(body): Json<Value>) -> String {
    let index = body["index"].as_u64().unwrap_or(u64::MAX) as usize;
    state.checks.lock().unwrap().push(body);

    if state.check_garbage.load(Ordering::SeqCst) {
        return "<html>bad gateway</html>".to_string();
    }

    let exists = state.existing.lock().unwrap().contains(&index);
    json!({
        "code": state.check_code.load(Ordering::SeqCst),
        "data": exists,
    })
    .to_string()
}

async fn upload_chunk(State(state): State<Arc<MockServer>>, mut multipart: Multipart) -> Json<Value> {
    let mut chunk = ReceivedChunk {
        file_name: None,
        data: Vec::new(),
        fields: HashMap::new(),
    };

    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or("").to_string();
        if name == "fileChunk" {
            chunk.file_name = field.file_name().map(str::to_string);
            chunk.data = field.bytes().await.unwrap().to_vec();
        } else {
            let value = field.text().await.unwrap();
            chunk.fields.insert(name, value);
        }
    }

    let index = chunk.index();
    {
        let mut failures = state.upload_failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Json(json!({ "code": 500, "data": "temporary failure" }));
            }
        }
    }

    let code = state.upload_code.load(Ordering::SeqCst);
    if code == 200 {
        state.existing.lock().unwrap().insert(index);
        state.uploads.lock().unwrap().push(chunk);
    }
    Json(json!({ "code": code, "data": index }))
}

async fn merge(State(state): State<Arc<MockServer>>, Json(body): Json<Value>) -> Json<Value> {
    state.merges.lock().unwrap().push(body);
    Json(json!({
        "code": state.merge_code.load(Ordering::SeqCst),
        "data": "merged",
    }))
}
