/// 普通 HTTP 请求转发
///
/// 原样发送客户端请求，读取上游响应直到请求头结束标记。
/// 默认只转发响应头；`ResponseMode::Full` 时继续转发响应体。
use crate::config::ResponseMode;
use crate::request::{find_header_end, HEADER_TERMINATOR};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// 读取响应头时每次读取的字节数
const HEAD_READ_CHUNK: usize = 1024;

/// 转发响应体时的缓冲区大小
const BODY_COPY_BUFFER_SIZE: usize = 16384;

/// 上游返回的响应头
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    /// 状态行和响应头，包含结束标记（如果读到了）
    pub head: Vec<u8>,
    /// 读取响应头时多读到的响应体字节
    pub leftover: Vec<u8>,
    /// 是否读到了结束标记
    pub complete: bool,
}

impl ResponseHead {
    /// 状态码（无法解析时为 None）
    pub fn status_code(&self) -> Option<u16> {
        let line_end = self
            .head
            .windows(2)
            .position(|w| w == b"\r\n")
            .unwrap_or(self.head.len());
        let line = std::str::from_utf8(&self.head[..line_end]).ok()?;
        line.split_whitespace().nth(1)?.parse().ok()
    }

    /// Content-Length 头的值
    pub fn content_length(&self) -> Option<u64> {
        let text = String::from_utf8_lossy(&self.head);
        text.split("\r\n").skip(1).find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
    }

    /// 响应是否可能带有响应体
    pub fn has_body(&self, request_method: &str) -> bool {
        if request_method.eq_ignore_ascii_case("HEAD") {
            return false;
        }
        match self.status_code() {
            Some(code) => !((100..200).contains(&code) || code == 204 || code == 304),
            None => true,
        }
    }
}

/// 发送请求并读取响应头
///
/// 上游在结束标记之前关闭、读取出错或超时时，返回已经读到的内容（可能为空）。
/// 写请求失败时返回错误。
pub async fn forward<U>(
    upstream: &mut U,
    request: &[u8],
    max_head_size: usize,
    read_timeout: Duration,
) -> io::Result<ResponseHead>
where
    U: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    upstream.write_all(request).await?;
    upstream.flush().await?;

    let mut response = ResponseHead::default();
    let mut buf = [0u8; HEAD_READ_CHUNK];

    loop {
        let n = match timeout(read_timeout, upstream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("Upstream read error while reading response head: {}", e);
                break;
            }
            Err(_) => {
                debug!("Upstream response head timed out after {:?}", read_timeout);
                break;
            }
        };
        if n == 0 {
            break;
        }

        // 只需要在新数据附近查找结束标记
        let search_from = response.head.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
        response.head.extend_from_slice(&buf[..n]);

        if let Some(end) = find_header_end(&response.head[search_from..]) {
            let end = search_from + end;
            response.leftover = response.head.split_off(end);
            response.complete = true;
            break;
        }

        if response.head.len() >= max_head_size {
            debug!("Response head exceeds {} bytes, stop reading", max_head_size);
            break;
        }
    }

    Ok(response)
}

/// 转发响应体
///
/// 有 Content-Length 时只转发该长度，否则转发直到上游关闭。返回写给客户端的字节数。
pub async fn forward_body<U, C>(
    upstream: &mut U,
    client: &mut C,
    head: &ResponseHead,
    request_method: &str,
    idle_timeout: Duration,
) -> io::Result<u64>
where
    U: AsyncRead + Unpin + ?Sized,
    C: AsyncWrite + Unpin + ?Sized,
{
    if !head.complete || !head.has_body(request_method) {
        return Ok(0);
    }

    let limit = head.content_length();
    let leftover = match limit {
        Some(len) => &head.leftover[..head.leftover.len().min(len as usize)],
        None => &head.leftover[..],
    };
    client.write_all(leftover).await?;

    let mut written = leftover.len() as u64;
    let mut remaining = limit.map(|len| len.saturating_sub(written));
    let mut buf = vec![0u8; BODY_COPY_BUFFER_SIZE];

    while remaining != Some(0) {
        let want = match remaining {
            Some(r) => buf.len().min(r as usize),
            None => buf.len(),
        };
        let n = match timeout(idle_timeout, upstream.read(&mut buf[..want])).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Upstream response body idle timeout",
                ))
            }
        };
        if n == 0 {
            break;
        }

        client.write_all(&buf[..n]).await?;
        written += n as u64;
        if let Some(r) = remaining.as_mut() {
            *r -= n as u64;
        }
    }

    client.flush().await?;
    Ok(written)
}

/// 根据模式决定是否转发响应体
pub fn should_forward_body(mode: ResponseMode) -> bool {
    mode == ResponseMode::Full
}
