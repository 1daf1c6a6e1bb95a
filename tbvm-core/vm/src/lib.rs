//! TBVM 虚拟机管理
//!
//! - [`VmManager`]：绑定一个域，负责快照切换、Guest Agent 等待、IP 查询与销毁
//! - [`TemplateFactory`]：从脱敏模板（配置 + 磁盘 + 系统镜像 + 快照链）创建新虚拟机
//! - [`VmExporter`]：把运行中的域导出为可移植的模板包
//! - [`ServerProvisioner`]：在 `Base` 快照之上部署服务端并保存为 `Server` 快照
//!
//! 所有操作都是阻塞调用；只有 [`VmManager::connect`] 建立 SSH 通道时是异步的。

pub mod bundle;
pub mod config;
pub mod export;
pub mod factory;
pub mod manager;
pub mod server;
pub mod snapshot;
pub mod template;
pub mod xml;

pub use bundle::{Bundle, BUNDLE_ENTRIES, CONFIG_ENTRY, IMAGE_ENTRY, OS_ENTRY, SNAPSHOTS_ENTRY};
pub use config::{SshSettings, VmConfig};
pub use export::{ExportedDomain, VmExporter};
pub use factory::TemplateFactory;
pub use manager::VmManager;
pub use server::{prepare_base, ServerManager, ServerProvisioner};
pub use snapshot::Snapshot;
pub use template::{Placeholder, TemplateKind, TemplateValues, XmlTemplate};
pub use xml::{Element, Node};

use std::path::PathBuf;

use tbvm_protocol::AgentError;
use tbvm_ssh_executor::SshError;
use tbvm_transport::HypervisorError;
use thiserror::Error;

/// 虚拟机管理错误
#[derive(Error, Debug)]
pub enum VmError {
    #[error("Guest Agent 错误: {0}")]
    Agent(#[from] AgentError),

    #[error("Hypervisor 错误: {0}")]
    Hypervisor(#[from] HypervisorError),

    /// 操作对当前虚拟机状态无效
    #[error("状态错误: {0}")]
    State(String),

    #[error("镜像已存在: {0}")]
    ImageExists(PathBuf),

    #[error("找不到镜像: {0}")]
    ImageNotFound(PathBuf),

    #[error("找不到资源: {0}")]
    MissingResource(PathBuf),

    /// 文档解析失败或缺少预期的结构
    #[error("XML 错误: {0}")]
    Xml(String),

    #[error("模板错误: {0}")]
    Template(String),

    #[error("模板包错误: {0}")]
    Bundle(String),

    #[error("SSH 错误: {0}")]
    Ssh(#[from] SshError),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VmError>;
