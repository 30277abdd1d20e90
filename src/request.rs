/// 请求解析模块
///
/// 从客户端发送的原始字节中提取目标地址。只检查请求行和 Host 头，
/// 不解析请求体的分帧（Content-Length / chunked）。
use crate::error::{ProxyError, Result};
use std::fmt;

/// HTTP 请求头结束标记
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// 隧道模式固定使用的端口
pub const TUNNEL_PORT: u16 = 443;

/// 普通 HTTP 的默认端口
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// 客户端想要访问的目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub host: String,
    pub port: u16,
    /// 端口为 443 时为 true（按端口而非方法判断）
    pub is_tunnel: bool,
}

impl TargetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            is_tunnel: port == TUNNEL_PORT,
        }
    }

    /// `host:port` 形式，IPv6 地址带方括号
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// 解析目标地址
///
/// Host 头中带端口时直接使用；否则 CONNECT 请求默认 443，其余默认 80。
pub fn parse_target(request: &[u8]) -> Result<TargetAddress> {
    let mut lines = request.split_crlf();
    let first_line = lines.next().unwrap_or_default();
    let is_connect = request_method(first_line) == Some("CONNECT");

    for line in lines {
        if line.is_empty() {
            // 请求头结束
            break;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        if !line[..colon].trim_ascii().eq_ignore_ascii_case(b"host") {
            continue;
        }

        let value = String::from_utf8_lossy(line[colon + 1..].trim_ascii());
        let default_port = if is_connect {
            TUNNEL_PORT
        } else {
            DEFAULT_HTTP_PORT
        };
        let (host, port) = split_host_port(&value, default_port)?;
        return Ok(TargetAddress::new(host, port));
    }

    Err(ProxyError::MissingHostHeader)
}

/// 请求行中的方法（第一个空白分隔的字段）
pub fn method(request: &[u8]) -> Option<&str> {
    request.split_crlf().next().and_then(request_method)
}

/// 查找请求头结束标记，返回标记之后的偏移
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

fn request_method(line: &[u8]) -> Option<&str> {
    let token = line.split(|b| b.is_ascii_whitespace()).next()?;
    if token.is_empty() {
        return None;
    }
    std::str::from_utf8(token).ok()
}

fn split_host_port(value: &str, default_port: u16) -> Result<(String, u16)> {
    // [v6]:port 或 [v6]
    if let Some(rest) = value.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            return match rest[end + 1..].strip_prefix(':') {
                Some(port) => Ok((host.to_string(), parse_port(port)?)),
                None => Ok((host.to_string(), default_port)),
            };
        }
    }

    match value.split_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((value.to_string(), default_port)),
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.trim()
        .parse::<u16>()
        .map_err(|_| ProxyError::InvalidPort(port.to_string()))
}

/// 按 CRLF 拆分字节流
trait SplitCrlf {
    fn split_crlf(&self) -> CrlfLines<'_>;
}

impl SplitCrlf for [u8] {
    fn split_crlf(&self) -> CrlfLines<'_> {
        CrlfLines { rest: Some(self) }
    }
}

struct CrlfLines<'a> {
    rest: Option<&'a [u8]>,
}

impl<'a> Iterator for CrlfLines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest?;
        match rest.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                self.rest = Some(&rest[pos + 2..]);
                Some(&rest[..pos])
            }
            None => {
                self.rest = None;
                Some(rest)
            }
        }
    }
}
