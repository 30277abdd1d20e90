/// 请求/响应记录
///
/// 每个请求在转发前记录一次，响应（或隧道关闭）在结束时记录一次。
/// 记录失败只影响记录本身，不影响代理流程。
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// 当前 Unix 时间（毫秒）
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 一条请求记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// 由存储分配，保存前为 0
    #[serde(default)]
    pub id: u64,
    pub timestamp: u64,
    pub client_ip: IpAddr,
    pub method: String,
    pub target_host: String,
    pub target_port: u16,
    /// 原始请求（按 UTF-8 宽松解码）
    pub payload: String,
}

impl RequestRecord {
    pub fn new(
        client_ip: IpAddr,
        method: impl Into<String>,
        target_host: impl Into<String>,
        target_port: u16,
        payload: &[u8],
    ) -> Self {
        Self {
            id: 0,
            timestamp: unix_millis(),
            client_ip,
            method: method.into(),
            target_host: target_host.into(),
            target_port,
            payload: String::from_utf8_lossy(payload).into_owned(),
        }
    }
}

/// 响应记录的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// 普通请求的响应
    Response,
    /// 隧道结束
    TunnelClose,
}

/// 一条响应记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    /// 对应的请求记录（请求记录保存失败时为 None）
    pub request_id: Option<u64>,
    pub timestamp: u64,
    pub client_ip: IpAddr,
    pub kind: ResponseKind,
    /// 转发给客户端的响应（隧道为空）
    pub payload: String,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl ResponseRecord {
    /// 普通请求的响应
    pub fn response(request_id: Option<u64>, client_ip: IpAddr, payload: &[u8]) -> Self {
        Self {
            request_id,
            timestamp: unix_millis(),
            client_ip,
            kind: ResponseKind::Response,
            payload: String::from_utf8_lossy(payload).into_owned(),
            bytes_up: 0,
            bytes_down: payload.len() as u64,
        }
    }

    /// 隧道关闭
    pub fn tunnel_close(
        request_id: Option<u64>,
        client_ip: IpAddr,
        bytes_up: u64,
        bytes_down: u64,
    ) -> Self {
        Self {
            request_id,
            timestamp: unix_millis(),
            client_ip,
            kind: ResponseKind::TunnelClose,
            payload: String::new(),
            bytes_up,
            bytes_down,
        }
    }
}

/// 存储中的一行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Request(RequestRecord),
    Response(ResponseRecord),
}

/// 记录存储接口
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// 保存请求并返回分配的 id
    async fn save_request(&self, record: &RequestRecord) -> Result<u64>;

    async fn save_response(&self, record: &ResponseRecord) -> Result<()>;
}

/// 丢弃所有记录
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecordSink;

#[async_trait]
impl RecordSink for NullRecordSink {
    async fn save_request(&self, _record: &RequestRecord) -> Result<u64> {
        Ok(0)
    }

    async fn save_response(&self, _record: &ResponseRecord) -> Result<()> {
        Ok(())
    }
}

struct JsonlState {
    file: File,
    next_id: u64,
}

/// 追加写入 JSON Lines 文件
///
/// 请求 id 从文件已有行数 + 1 开始，重启后继续递增。
pub struct JsonlRecordSink {
    path: PathBuf,
    state: tokio::sync::Mutex<JsonlState>,
}

impl JsonlRecordSink {
    /// 打开（或创建）记录文件
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let existing_lines = match tokio::fs::read(&path).await {
            Ok(content) => content.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count() as u64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(ProxyError::persistence(format!(
                    "failed to read {:?}: {}",
                    path, e
                )))
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| ProxyError::persistence(format!("failed to open {:?}: {}", path, e)))?;

        debug!(
            "Opened record file {:?} ({} existing lines)",
            path, existing_lines
        );

        Ok(Self {
            path,
            state: tokio::sync::Mutex::new(JsonlState {
                file,
                next_id: existing_lines + 1,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(state: &mut JsonlState, record: &Record) -> Result<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| ProxyError::persistence(format!("failed to encode record: {}", e)))?;
        line.push(b'\n');
        state
            .file
            .write_all(&line)
            .await
            .map_err(|e| ProxyError::persistence(format!("failed to write record: {}", e)))?;
        state
            .file
            .flush()
            .await
            .map_err(|e| ProxyError::persistence(format!("failed to flush record: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for JsonlRecordSink {
    async fn save_request(&self, record: &RequestRecord) -> Result<u64> {
        let mut state = self.state.lock().await;
        let id = state.next_id;

        let mut record = record.clone();
        record.id = id;
        Self::append(&mut state, &Record::Request(record)).await?;

        state.next_id += 1;
        Ok(id)
    }

    async fn save_response(&self, record: &ResponseRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::append(&mut state, &Record::Response(record.clone())).await?;
        state.next_id += 1;
        Ok(())
    }
}

/// 保存在内存中的记录（用于测试和嵌入）
#[derive(Debug, Default)]
pub struct MemoryRecordSink {
    records: Mutex<Vec<Record>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                Record::Request(req) => Some(req.clone()),
                Record::Response(_) => None,
            })
            .collect()
    }

    pub fn responses(&self) -> Vec<ResponseRecord> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                Record::Response(resp) => Some(resp.clone()),
                Record::Request(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn save_request(&self, record: &RequestRecord) -> Result<u64> {
        let mut records = self.records.lock();
        let id = records.len() as u64 + 1;
        let mut record = record.clone();
        record.id = id;
        records.push(Record::Request(record));
        Ok(id)
    }

    async fn save_response(&self, record: &ResponseRecord) -> Result<()> {
        self.records.lock().push(Record::Response(record.clone()));
        Ok(())
    }
}
