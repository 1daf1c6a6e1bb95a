//! TBVM 传输层
//!
//! 定义与 Hypervisor 交互所需的全部原语：虚拟机生命周期、快照、XML 描述、
//! 网卡地址查询，以及 Guest Agent 的原始命令通道。
//!
//! 上层（协议层、虚拟机管理器）只依赖这里的 trait，Libvirt 只是其中一种实现。

pub mod traits;

#[cfg(feature = "libvirt")]
pub mod libvirt;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use traits::{GuestChannel, Hypervisor, ManagedDomain, ManagedSnapshot};

#[cfg(feature = "libvirt")]
pub use libvirt::{LibvirtDomain, LibvirtHypervisor, LibvirtSnapshot};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 传输层错误
///
/// `AgentUnresponsive` 和 `OperationInvalid` 单独列出，因为上层需要把它们识别为
/// “Guest Agent 暂不可用”，而不是真正的故障。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Guest Agent 无响应: {0}")]
    AgentUnresponsive(String),

    #[error("操作对当前虚拟机状态无效: {0}")]
    OperationInvalid(String),

    #[error("对象不存在: {0}")]
    NotFound(String),

    #[error("连接 Hypervisor 失败: {0}")]
    ConnectionFailed(String),

    #[error("Libvirt 错误: {0}")]
    Libvirt(String),
}

impl HypervisorError {
    /// 是否表示 Guest Agent 尚未就绪（未连接或虚拟机不在可通信状态）
    pub fn is_agent_unavailable(&self) -> bool {
        matches!(self, Self::AgentUnresponsive(_) | Self::OperationInvalid(_))
    }
}

pub type Result<T> = std::result::Result<T, HypervisorError>;

// ============================================================================
// 公共数据类型
// ============================================================================

/// 快照创建模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotCreateMode {
    /// 由 Hypervisor 捕获当前状态
    Capture,

    /// 只登记历史快照元数据，不要求当前磁盘与快照状态一致
    Redefine,
}

/// 快照枚举顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOrder {
    /// Hypervisor 默认顺序
    Any,

    /// 拓扑顺序：每个快照都排在它依赖的快照之后
    Topological,
}

/// Guest 内的网络接口（来自 Guest Agent）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// 接口名称，例如 eth0
    pub name: String,

    /// MAC 地址
    pub hwaddr: Option<String>,

    /// 地址列表（文本形式，IPv4 或 IPv6）
    pub addrs: Vec<String>,
}
