//! TBVM SSH 执行器
//!
//! 与 Guest Agent 能力相同的备用通道，经由虚拟机网络访问：
//! - 密码认证（sshpass）
//! - 命令执行和输出捕获
//! - 后台命令（不等待结束）
//! - 内存资源上传与目录递归上传（scp）
//!
//! # 示例
//!
//! ```ignore
//! use tbvm_ssh_executor::{SshClient, SshConfig};
//!
//! let config = SshConfig::with_password("192.168.122.10", "root", "sshPassword");
//! let client = SshClient::connect(config).await?;
//! let output = client.execute("echo test command return").await?;
//! println!("{}", output.stdout);
//! ```

mod client;
mod config;
mod error;

pub use client::{shell_quote, CommandOutput, SshClient};
pub use config::SshConfig;
pub use error::{Result, SshError};
