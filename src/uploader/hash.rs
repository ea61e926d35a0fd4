// 分片哈希计算
//
// 计算流程：
// 1. 按 worker 数量把分片划分为连续区间
// 2. 每个 worker 在阻塞线程池中顺序读取自己的区间，逐分片计算 MD5
// 3. 按 worker 序号（而不是完成顺序）拼接结果，保证输出确定
// 4. 对分片 MD5 列表再做一次 MD5，得到文件摘要
//
// 任意一个 worker 失败都会让整个计算失败，并通知其余 worker 尽快退出

use md5::Context as Md5Context;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::uploader::chunk::chunk_count;

/// 读取缓冲区大小: 64KB
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 哈希计算错误
#[derive(Debug, Error)]
pub enum HashError {
    #[error("文件为空，无法计算分片哈希")]
    EmptyFile,

    #[error("无效的哈希参数: {0}")]
    InvalidParameters(String),

    #[error("读取文件失败 (worker #{worker}): {source}")]
    Io {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("文件在计算过程中被截断: 分片 #{chunk_index}")]
    Truncated { chunk_index: usize },

    #[error("哈希 worker 异常退出: {0}")]
    WorkerPanicked(String),

    #[error("哈希计算已中止")]
    Aborted,
}

/// 计算字符串的 MD5
pub fn hash_string(s: &str) -> String {
    format!("{:x}", md5::compute(s.as_bytes()))
}

/// 分片到 worker 的划分结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashPartition {
    /// 分片总数
    pub total_chunks: usize,
    /// 实际创建的 worker 数
    pub effective_workers: usize,
    /// 每个 worker 分到的分片数
    pub per_worker_chunks: usize,
    /// 每个 worker 的分片区间（按 worker 序号排列，末尾的区间可能为空）
    pub ranges: Vec<Range<usize>>,
}

impl HashPartition {
    /// 划分分片
    ///
    /// `effective_workers = min(worker_count, total_chunks)`,
    /// `per_worker_chunks = ceil(total_chunks / effective_workers)`
    pub fn new(total_chunks: usize, worker_count: usize) -> Self {
        let effective_workers = worker_count.min(total_chunks);
        if effective_workers == 0 {
            return Self {
                total_chunks,
                effective_workers: 0,
                per_worker_chunks: 0,
                ranges: Vec::new(),
            };
        }

        let per_worker_chunks = total_chunks.div_ceil(effective_workers);
        let ranges = (0..effective_workers)
            .map(|i| {
                let start = (i * per_worker_chunks).min(total_chunks);
                let end = ((i + 1) * per_worker_chunks).min(total_chunks);
                start..end
            })
            .collect();

        Self {
            total_chunks,
            effective_workers,
            per_worker_chunks,
            ranges,
        }
    }
}

/// 文件哈希结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHashes {
    /// 按分片索引排列的分片 MD5
    pub chunk_digests: Vec<String>,
    /// 文件摘要（分片 MD5 列表的 MD5）
    pub file_digest: String,
}

/// 单个 worker 的任务描述（只读）
#[derive(Debug, Clone)]
struct WorkerJob {
    worker: usize,
    path: PathBuf,
    chunks: Range<usize>,
    chunk_size: u64,
    file_size: u64,
}

/// 分片哈希协调器
pub struct HashCoordinator;

impl HashCoordinator {
    /// 并行计算文件的分片 MD5 列表
    ///
    /// # 参数
    /// * `path` - 本地文件路径
    /// * `chunk_size` - 分片大小（字节）
    /// * `worker_count` - 最大 worker 数
    ///
    /// # 返回
    /// 按分片索引排列的 MD5 列表
    pub async fn hash_chunks(
        path: &Path,
        chunk_size: u64,
        worker_count: usize,
    ) -> Result<Vec<String>, HashError> {
        if chunk_size == 0 {
            return Err(HashError::InvalidParameters("分片大小必须大于 0".into()));
        }
        if worker_count == 0 {
            return Err(HashError::InvalidParameters("worker 数量必须大于 0".into()));
        }

        let file_size = tokio::fs::metadata(path)
            .await
            .map_err(|source| HashError::Io { worker: 0, source })?
            .len();
        if file_size == 0 {
            return Err(HashError::EmptyFile);
        }

        let partition = HashPartition::new(chunk_count(file_size, chunk_size), worker_count);
        run_workers(path, chunk_size, file_size, &partition, hash_worker).await
    }

    /// 由分片 MD5 列表计算文件摘要（单 worker）
    pub async fn file_digest(chunk_digests: &[String]) -> Result<String, HashError> {
        let joined = chunk_digests.join(",");
        tokio::task::spawn_blocking(move || hash_string(&joined))
            .await
            .map_err(|e| HashError::WorkerPanicked(e.to_string()))
    }

    /// 计算分片 MD5 列表和文件摘要
    pub async fn hash_file(
        path: &Path,
        chunk_size: u64,
        worker_count: usize,
    ) -> Result<FileHashes, HashError> {
        let started = std::time::Instant::now();

        let chunk_digests = Self::hash_chunks(path, chunk_size, worker_count).await?;
        let file_digest = Self::file_digest(&chunk_digests).await?;

        info!(
            "文件哈希计算完成: path={:?}, {} 个分片, file_digest={}, 耗时 {} ms",
            path,
            chunk_digests.len(),
            file_digest,
            started.elapsed().as_millis()
        );

        Ok(FileHashes {
            chunk_digests,
            file_digest,
        })
    }
}

/// 按划分结果启动 worker 并汇总
///
/// 第一个失败的 worker 决定返回的错误；返回前等待所有 worker 退出
async fn run_workers<F>(
    path: &Path,
    chunk_size: u64,
    file_size: u64,
    partition: &HashPartition,
    worker_fn: F,
) -> Result<Vec<String>, HashError>
where
    F: Fn(&WorkerJob, &CancellationToken) -> Result<Vec<String>, HashError>
        + Send
        + Sync
        + 'static,
{
    let worker_fn = Arc::new(worker_fn);

    debug!(
        "开始计算分片哈希: path={:?}, size={}, chunks={}, workers={}, 每个 worker {} 个分片",
        path,
        file_size,
        partition.total_chunks,
        partition.effective_workers,
        partition.per_worker_chunks
    );

    let cancel = CancellationToken::new();
    let mut workers = JoinSet::new();

    for (worker, chunks) in partition.ranges.iter().cloned().enumerate() {
        if chunks.is_empty() {
            continue;
        }
        let job = WorkerJob {
            worker,
            path: path.to_path_buf(),
            chunks,
            chunk_size,
            file_size,
        };
        let token = cancel.clone();
        let worker_fn = worker_fn.clone();
        workers.spawn_blocking(move || (job.worker, worker_fn(&job, &token)));
    }

    let mut results: Vec<Option<Vec<String>>> = vec![None; partition.ranges.len()];
    let mut failure: Option<HashError> = None;

    // 等待所有 worker 退出后再返回，失败时其余 worker 会在下一次读取前看到取消信号
    while let Some(joined) = workers.join_next().await {
        let error = match joined {
            Ok((worker, Ok(digests))) => {
                results[worker] = Some(digests);
                continue;
            }
            Ok((_, Err(HashError::Aborted))) => continue,
            Ok((worker, Err(e))) => {
                warn!("哈希 worker #{} 失败: {}", worker, e);
                e
            }
            Err(e) => HashError::WorkerPanicked(e.to_string()),
        };

        if failure.is_none() {
            cancel.cancel();
            failure = Some(error);
        }
    }

    if let Some(error) = failure {
        return Err(error);
    }

    let digests: Vec<String> = results.into_iter().flatten().flatten().collect();
    if digests.len() != partition.total_chunks {
        return Err(HashError::Aborted);
    }

    Ok(digests)
}

/// worker 主体：顺序读取分配到的分片并逐个计算 MD5
fn hash_worker(job: &WorkerJob, cancel: &CancellationToken) -> Result<Vec<String>, HashError> {
    let io_err = |source| HashError::Io {
        worker: job.worker,
        source,
    };

    let file = std::fs::File::open(&job.path).map_err(io_err)?;
    let mut reader = BufReader::with_capacity(1024 * 1024, file);

    let range_start = job.chunks.start as u64 * job.chunk_size;
    reader.seek(SeekFrom::Start(range_start)).map_err(io_err)?;

    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut digests = Vec::with_capacity(job.chunks.len());

    for chunk_index in job.chunks.clone() {
        let chunk_start = chunk_index as u64 * job.chunk_size;
        let chunk_len = job.chunk_size.min(job.file_size - chunk_start);

        let mut hasher = Md5Context::new();
        let mut consumed: u64 = 0;

        while consumed < chunk_len {
            if cancel.is_cancelled() {
                return Err(HashError::Aborted);
            }

            let to_read = ((chunk_len - consumed) as usize).min(buffer.len());
            let bytes_read = reader.read(&mut buffer[..to_read]).map_err(io_err)?;
            if bytes_read == 0 {
                return Err(HashError::Truncated { chunk_index });
            }

            hasher.consume(&buffer[..bytes_read]);
            consumed += bytes_read as u64;
        }

        digests.push(format!("{:x}", hasher.compute()));
    }

    debug!(
        "哈希 worker #{} 完成: 分片 {}..{}",
        job.worker, job.chunks.start, job.chunks.end
    );

    Ok(digests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MB: usize = 1024 * 1024;

    fn temp_file_with(content: &[u8]) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_partition_one_chunk_per_worker() {
        // 17MB / 5MB -> 4 个分片，4 个 worker 各 1 个
        let total = chunk_count(17 * MB as u64, 5 * MB as u64);
        let partition = HashPartition::new(total, 4);
        assert_eq!(partition.total_chunks, 4);
        assert_eq!(partition.effective_workers, 4);
        assert_eq!(partition.per_worker_chunks, 1);
        assert_eq!(partition.ranges, vec![0..1, 1..2, 2..3, 3..4]);
    }

    #[test]
    fn test_partition_more_workers_than_chunks() {
        let partition = HashPartition::new(3, 8);
        assert_eq!(partition.effective_workers, 3);
        assert_eq!(partition.ranges, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_partition_uneven() {
        let partition = HashPartition::new(10, 4);
        assert_eq!(partition.per_worker_chunks, 3);
        assert_eq!(partition.ranges, vec![0..3, 3..6, 6..9, 9..10]);

        // 5 个分片 4 个 worker：每个 2 个，最后一个 worker 无分片
        let partition = HashPartition::new(5, 4);
        assert_eq!(partition.ranges, vec![0..2, 2..4, 4..5, 5..5]);
    }

    #[test]
    fn test_hash_string() {
        assert_eq!(hash_string(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(hash_string("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn test_chunk_digests_match_direct_md5() {
        let content = patterned(10 * 1024 + 7);
        let temp_file = temp_file_with(&content);

        let digests = HashCoordinator::hash_chunks(temp_file.path(), 4096, 2)
            .await
            .unwrap();

        let expected: Vec<String> = content
            .chunks(4096)
            .map(|c| format!("{:x}", md5::compute(c)))
            .collect();
        assert_eq!(digests, expected);
    }

    #[tokio::test]
    async fn test_hash_is_deterministic() {
        let content = patterned(300 * 1024);
        let temp_file = temp_file_with(&content);

        let first = HashCoordinator::hash_file(temp_file.path(), 16 * 1024, 4)
            .await
            .unwrap();
        let second = HashCoordinator::hash_file(temp_file.path(), 16 * 1024, 4)
            .await
            .unwrap();
        assert_eq!(first, second);

        // worker 数量不影响结果
        let single = HashCoordinator::hash_file(temp_file.path(), 16 * 1024, 1)
            .await
            .unwrap();
        assert_eq!(first, single);
    }

    #[tokio::test]
    async fn test_file_digest_over_joined_chunk_digests() {
        let temp_file = temp_file_with(&patterned(9000));
        let hashes = HashCoordinator::hash_file(temp_file.path(), 4000, 3)
            .await
            .unwrap();
        assert_eq!(hashes.chunk_digests.len(), 3);
        assert_eq!(
            hashes.file_digest,
            hash_string(&hashes.chunk_digests.join(","))
        );
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let temp_file = temp_file_with(b"");
        let result = HashCoordinator::hash_chunks(temp_file.path(), 1024, 2).await;
        assert!(matches!(result, Err(HashError::EmptyFile)));

        let temp_file = temp_file_with(b"data");
        let result = HashCoordinator::hash_chunks(temp_file.path(), 0, 2).await;
        assert!(matches!(result, Err(HashError::InvalidParameters(_))));
        let result = HashCoordinator::hash_chunks(temp_file.path(), 1024, 0).await;
        assert!(matches!(result, Err(HashError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_nonexistent_file() {
        let result =
            HashCoordinator::hash_chunks(Path::new("/nonexistent/file.bin"), 1024, 2).await;
        assert!(matches!(result, Err(HashError::Io { .. })));
    }

    #[tokio::test]
    async fn test_first_worker_error_wins_and_all_workers_exit() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::{Duration, Instant};

        let partition = HashPartition::new(8, 4);
        let exited = Arc::new(AtomicUsize::new(0));
        let worker_exited = exited.clone();

        // worker #2 立即失败；其余 worker 等到取消信号后退出，#3 退出时再报一个错误
        let result = run_workers(
            Path::new("unused.bin"),
            100,
            800,
            &partition,
            move |job: &WorkerJob, cancel: &CancellationToken| {
                if job.worker == 2 {
                    return Err(HashError::Truncated {
                        chunk_index: job.chunks.start,
                    });
                }
                let deadline = Instant::now() + Duration::from_secs(10);
                while !cancel.is_cancelled() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(1));
                }
                worker_exited.fetch_add(1, Ordering::SeqCst);
                if job.worker == 3 {
                    return Err(HashError::Truncated {
                        chunk_index: job.chunks.start,
                    });
                }
                Err(HashError::Aborted)
            },
        )
        .await;

        assert!(matches!(result, Err(HashError::Truncated { chunk_index: 4 })));
        assert_eq!(exited.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_file_shrunk_after_size_check_fails_with_truncation() {
        // 记录的文件大小是实际大小的两倍，后半部分的 worker 读到 EOF
        let content = patterned(1000);
        let temp_file = temp_file_with(&content);
        let partition = HashPartition::new(8, 4);

        let result = run_workers(temp_file.path(), 250, 2000, &partition, hash_worker).await;

        match result {
            Err(HashError::Truncated { chunk_index }) => assert!(chunk_index == 4 || chunk_index == 6),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_worker_reports_truncation() {
        // 描述的文件大小大于实际文件，worker 读到 EOF 时应报告截断
        let temp_file = temp_file_with(&patterned(1000));
        let job = WorkerJob {
            worker: 0,
            path: temp_file.path().to_path_buf(),
            chunks: 0..2,
            chunk_size: 600,
            file_size: 1200,
        };
        let result = hash_worker(&job, &CancellationToken::new());
        assert!(matches!(result, Err(HashError::Truncated { chunk_index: 1 })));
    }

    #[test]
    fn test_worker_stops_when_cancelled() {
        let temp_file = temp_file_with(&patterned(1000));
        let job = WorkerJob {
            worker: 1,
            path: temp_file.path().to_path_buf(),
            chunks: 0..1,
            chunk_size: 1000,
            file_size: 1000,
        };
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(hash_worker(&job, &token), Err(HashError::Aborted)));
    }
}
