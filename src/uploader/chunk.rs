// 文件分片规划
//
// 分片规则：
// - 按固定大小切分，最后一个分片可以更小
// - 分片索引从 0 开始连续编号
// - 分片创建后不可变，只描述字节范围，不持有数据

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

/// 默认分片大小: 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 分片规划错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("文件为空，无需上传")]
    EmptyFile,
    #[error("分片大小必须大于 0")]
    ZeroChunkSize,
}

/// 计算分片总数：`ceil(file_size / chunk_size)`
pub fn chunk_count(file_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size) as usize
}

/// 单个分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 所属文件标识
    pub file_id: Arc<str>,
}

impl Chunk {
    pub fn new(index: usize, range: Range<u64>, file_id: Arc<str>) -> Self {
        Self {
            index,
            range,
            file_id,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 读取分片数据
    ///
    /// 只在上传阶段按需读取，避免整个文件驻留内存
    pub async fn read_data(&self, file_path: &Path) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(file_path).await?;
        file.seek(std::io::SeekFrom::Start(self.range.start)).await?;

        let mut buffer = vec![0u8; self.size() as usize];
        file.read_exact(&mut buffer).await?;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            self.index,
            self.range.start,
            self.range.end - 1,
            buffer.len()
        );

        Ok(buffer)
    }
}

/// 分片规划结果
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    chunks: Vec<Chunk>,
    file_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    /// 创建分片规划
    ///
    /// # 参数
    /// * `file_id` - 所属文件标识（通常为文件名）
    /// * `file_size` - 文件总大小
    /// * `chunk_size` - 分片大小
    pub fn new(file_id: &str, file_size: u64, chunk_size: u64) -> Result<Self, PlanError> {
        if chunk_size == 0 {
            return Err(PlanError::ZeroChunkSize);
        }
        if file_size == 0 {
            return Err(PlanError::EmptyFile);
        }

        let file_id: Arc<str> = Arc::from(file_id);
        let mut chunks = Vec::with_capacity(chunk_count(file_size, chunk_size));
        let mut offset = 0u64;

        while offset < file_size {
            let end = std::cmp::min(offset + chunk_size, file_size);
            chunks.push(Chunk::new(chunks.len(), offset..end, file_id.clone()));
            offset = end;
        }

        info!(
            "创建分片规划: 文件={}, 大小={} bytes, 分片大小={} bytes, 分片数量={}",
            file_id,
            file_size,
            chunk_size,
            chunks.len()
        );

        Ok(Self {
            chunks,
            file_size,
            chunk_size,
        })
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 每个分片在总进度中所占的百分比
    pub fn percent_share(&self) -> f64 {
        100.0 / self.chunks.len() as f64
    }
}
