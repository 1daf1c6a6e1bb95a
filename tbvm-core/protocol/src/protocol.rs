//! QGA 协议定义
//!
//! 线上格式参考 qemu-ga 参考文档：
//! <https://qemu-project.gitlab.io/qemu/interop/qemu-ga-ref.html>

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::GuestCommand;
use crate::{AgentError, Result};

/// QGA 命令的通用结构
#[derive(Debug, Serialize)]
pub struct QgaCommand<'a> {
    pub execute: &'a str,
    pub arguments: &'a Map<String, Value>,
}

/// QGA 响应的通用结构
#[derive(Debug, Deserialize)]
pub struct QgaResponse {
    #[serde(rename = "return")]
    pub ret: Option<Value>,
    pub error: Option<QgaErrorBody>,
}

/// QGA 错误信息
#[derive(Debug, Deserialize)]
pub struct QgaErrorBody {
    #[serde(rename = "class")]
    pub error_class: String,
    pub desc: String,
}

fn shape_error(command: &str, e: serde_json::Error) -> AgentError {
    AgentError::Protocol(format!("{}: {}", command, e))
}

fn decode_text(command: &str, data: &str) -> Result<String> {
    let bytes = general_purpose::STANDARD
        .decode(data)
        .map_err(|e| AgentError::Protocol(format!("{}: 无效的 base64: {}", command, e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn no_result(_: Value) -> Result<()> {
    Ok(())
}

// ============================================================================
// guest-ping
// ============================================================================

pub fn ping() -> GuestCommand<()> {
    GuestCommand::new("guest-ping", no_result)
}

// ============================================================================
// guest-exec: 在 Guest 中执行命令
// ============================================================================

/// guest-exec 命令参数
#[derive(Debug, Clone, Default)]
pub struct GuestExecCommand {
    /// 要执行的程序（必需）
    pub path: Option<String>,

    /// 命令参数
    pub arg: Vec<String>,

    /// 环境变量（KEY=VALUE）
    pub env: Vec<String>,

    /// 标准输入数据（明文，发送时 Base64 编码）
    pub input_data: Option<String>,

    /// 是否捕获标准输出/错误
    pub capture_output: bool,
}

#[derive(Debug, Deserialize)]
struct GuestExecResult {
    pid: i64,
}

fn extract_pid(ret: Value) -> Result<i64> {
    serde_json::from_value::<GuestExecResult>(ret)
        .map(|r| r.pid)
        .map_err(|e| shape_error("guest-exec", e))
}

impl GuestExecCommand {
    pub fn new(path: impl Into<String>, arg: Vec<String>) -> Self {
        Self {
            path: Some(path.into()),
            arg,
            ..Default::default()
        }
    }

    /// 创建简单的命令执行（捕获输出）
    pub fn simple(path: impl Into<String>, arg: Vec<String>) -> Self {
        Self::new(path, arg).capture_output(true)
    }

    /// 把一行命令按空白拆分为程序和参数；不支持引号或转义
    pub fn from_command_line(command: &str) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        Self {
            path: parts.next(),
            arg: parts.collect(),
            ..Default::default()
        }
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input_data = Some(input.into());
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// 构建 guest-exec 命令，返回值为 PID
    pub fn to_command(&self) -> Result<GuestCommand<i64>> {
        let input = self
            .input_data
            .as_ref()
            .map(|input| general_purpose::STANDARD.encode(input.as_bytes()));

        Ok(GuestCommand::new("guest-exec", extract_pid)
            .property("path", self.path.clone())?
            .arguments_now_optional()
            .array("arg", Some(self.arg.as_slice()))?
            .array("env", Some(self.env.as_slice()))?
            .property("input-data", input)?
            .property_if_not_default("capture-output", self.capture_output, false))
    }
}

// ============================================================================
// guest-exec-status: 查询命令执行状态
// ============================================================================

#[derive(Debug, Deserialize)]
struct GuestExecStatusRaw {
    exited: bool,
    #[serde(rename = "exitcode")]
    exit_code: Option<i32>,
    signal: Option<i32>,
    #[serde(rename = "out-data")]
    out_data: Option<String>,
    #[serde(rename = "err-data")]
    err_data: Option<String>,
}

/// 异步进程的执行状态
///
/// 只有 `exited` 为真时才会填充退出码和输出。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecStatus {
    pub exited: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl ExecStatus {
    pub fn success(&self) -> bool {
        self.exited && self.exit_code == Some(0)
    }
}

fn extract_exec_status(ret: Value) -> Result<ExecStatus> {
    let raw: GuestExecStatusRaw =
        serde_json::from_value(ret).map_err(|e| shape_error("guest-exec-status", e))?;

    if !raw.exited {
        return Ok(ExecStatus::default());
    }

    Ok(ExecStatus {
        exited: true,
        exit_code: raw.exit_code,
        signal: raw.signal,
        stdout: raw
            .out_data
            .as_deref()
            .map(|d| decode_text("guest-exec-status", d))
            .transpose()?,
        stderr: raw
            .err_data
            .as_deref()
            .map(|d| decode_text("guest-exec-status", d))
            .transpose()?,
    })
}

pub fn exec_status(pid: i64) -> Result<GuestCommand<ExecStatus>> {
    GuestCommand::new("guest-exec-status", extract_exec_status).property("pid", Some(pid))
}

// ============================================================================
// guest-file-*: 文件操作
// ============================================================================

/// 文件打开模式（与 C fopen 相同）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpenMode {
    Read,
    Write,
}

impl FileOpenMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "rb",
            Self::Write => "wb",
        }
    }
}

impl From<FileOpenMode> for Value {
    fn from(mode: FileOpenMode) -> Self {
        Value::String(mode.as_str().to_string())
    }
}

fn extract_handle(ret: Value) -> Result<i64> {
    ret.as_i64()
        .ok_or_else(|| AgentError::Protocol("guest-file-open: 返回值不是文件句柄".to_string()))
}

pub fn file_open(path: &str, mode: Option<FileOpenMode>) -> Result<GuestCommand<i64>> {
    GuestCommand::new("guest-file-open", extract_handle)
        .property("path", Some(path))?
        .arguments_now_optional()
        .property("mode", mode)
}

pub fn file_close(handle: i64) -> Result<GuestCommand<()>> {
    GuestCommand::new("guest-file-close", no_result).property("handle", Some(handle))
}

#[derive(Debug, Deserialize)]
struct GuestFileReadRaw {
    count: u64,
    #[serde(rename = "buf-b64")]
    buf_b64: String,
    eof: bool,
}

/// 一次 guest-file-read 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReadChunk {
    pub count: u64,
    pub bytes: Vec<u8>,
    pub eof: bool,
}

fn extract_file_read(ret: Value) -> Result<FileReadChunk> {
    let raw: GuestFileReadRaw =
        serde_json::from_value(ret).map_err(|e| shape_error("guest-file-read", e))?;
    let bytes = general_purpose::STANDARD
        .decode(&raw.buf_b64)
        .map_err(|e| AgentError::Protocol(format!("guest-file-read: 无效的 base64: {}", e)))?;

    Ok(FileReadChunk {
        count: raw.count,
        bytes,
        eof: raw.eof,
    })
}

pub fn file_read(handle: i64, count: Option<usize>) -> Result<GuestCommand<FileReadChunk>> {
    GuestCommand::new("guest-file-read", extract_file_read)
        .property("handle", Some(handle))?
        .arguments_now_optional()
        .property("count", count.map(|c| c as u64))
}

/// 写入一段已编码的数据；分块由调用方负责
pub fn file_write(handle: i64, encoded: String) -> Result<GuestCommand<()>> {
    GuestCommand::new("guest-file-write", no_result)
        .property("handle", Some(handle))?
        .property("buf-b64", Some(encoded))
}
