//! Hypervisor 抽象接口

use crate::{NetworkInterface, Result, SnapshotCreateMode, SnapshotOrder};

/// Guest Agent 原始命令通道
///
/// 接收一条 JSON 文本命令，阻塞直到返回 JSON 文本响应。
pub trait GuestChannel {
    fn agent_command(&self, command: &str) -> Result<String>;
}

/// 虚拟机快照句柄
pub trait ManagedSnapshot {
    /// 快照名称
    fn name(&self) -> Result<String>;

    /// 快照的 XML 描述
    fn xml_desc(&self) -> Result<String>;

    /// 将所属虚拟机回滚到此快照
    fn revert(&self) -> Result<()>;

    /// 删除此快照（只删除自身，不级联子快照）
    fn delete(&self) -> Result<()>;
}

/// 由 Hypervisor 管理的虚拟机句柄
pub trait ManagedDomain: GuestChannel {
    type Snapshot: ManagedSnapshot;

    fn name(&self) -> Result<String>;

    fn is_active(&self) -> Result<bool>;

    /// 启动已定义的虚拟机
    fn start(&self) -> Result<()>;

    /// 强制停止
    fn destroy(&self) -> Result<()>;

    fn resume(&self) -> Result<()>;

    fn suspend(&self) -> Result<()>;

    /// 取消定义（不删除磁盘镜像）
    fn undefine(&self) -> Result<()>;

    /// 当前完整配置的 XML 描述
    fn xml_desc(&self) -> Result<String>;

    fn create_snapshot_xml(&self, xml: &str, mode: SnapshotCreateMode) -> Result<Self::Snapshot>;

    fn lookup_snapshot(&self, name: &str) -> Result<Self::Snapshot>;

    fn list_snapshots(&self, order: SnapshotOrder) -> Result<Vec<Self::Snapshot>>;

    /// 通过 Guest Agent 查询网卡及地址
    fn interface_addresses(&self) -> Result<Vec<NetworkInterface>>;
}

/// Hypervisor 连接
pub trait Hypervisor {
    type Domain: ManagedDomain;

    /// 根据 XML 定义新的虚拟机
    fn define_domain(&self, xml: &str) -> Result<Self::Domain>;

    fn lookup_domain(&self, name: &str) -> Result<Self::Domain>;
}
