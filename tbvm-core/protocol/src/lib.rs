//! TBVM 协议层
//!
//! 通过 Hypervisor 的 Guest Agent 通道与虚拟机内部通信，不依赖网络：
//! - [`GuestCommand`]：带类型的 QGA 命令构建器（名称 + 参数 + 响应提取函数）
//! - [`GuestAgent`]：ping、异步进程执行与轮询等待
//! - [`RemoteFile`]：受大小限制的分块文件读写，以及目录递归上传

pub mod client;
pub mod command;
pub mod config;
pub mod file;
pub mod protocol;

pub use client::GuestAgent;
pub use command::{Extractor, GuestCommand};
pub use config::{AgentConfig, PollPolicy, MAX_MESSAGE_LEN, READ_CHUNK_BYTES, WRITE_CHUNK_CHARS};
pub use file::{remote_join, remote_parent, RemoteFile};
pub use protocol::{ExecStatus, FileOpenMode, FileReadChunk, GuestExecCommand};

use tbvm_transport::HypervisorError;
use thiserror::Error;

/// 协议层错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 必需参数缺失，在发送前即失败
    #[error("命令 {command} 缺少必需参数: {property}")]
    MissingProperty {
        command: &'static str,
        property: String,
    },

    #[error("传输层错误: {0}")]
    Transport(#[from] HypervisorError),

    #[error("Guest Agent 命令执行失败: {class}: {desc}")]
    CommandFailed { class: String, desc: String },

    /// 响应缺少预期字段或字段类型不符
    #[error("Guest Agent 响应格式错误: {0}")]
    Protocol(String),

    #[error("等待{operation}超时 (已尝试 {attempts} 次)")]
    Timeout { operation: String, attempts: u32 },

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
