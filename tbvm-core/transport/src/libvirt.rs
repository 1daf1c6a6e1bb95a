//! Libvirt 后端
//!
//! 用 `virt` crate 实现传输层 trait。所有调用均为阻塞调用。

use tracing::{debug, error, info};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::domain_snapshot::DomainSnapshot;
use virt::error::ErrorNumber;

use crate::{
    GuestChannel, Hypervisor, HypervisorError, ManagedDomain, ManagedSnapshot, NetworkInterface,
    Result, SnapshotCreateMode, SnapshotOrder,
};

/// 使用 libvirt 默认值的 Guest Agent 命令超时
pub const AGENT_TIMEOUT_DEFAULT: i32 = -1;

fn map_error(e: virt::error::Error) -> HypervisorError {
    let message = e.to_string();
    match e.code() {
        ErrorNumber::AgentUnresponsive => HypervisorError::AgentUnresponsive(message),
        ErrorNumber::OperationInvalid => HypervisorError::OperationInvalid(message),
        ErrorNumber::NoDomain | ErrorNumber::NoDomainSnapshot => HypervisorError::NotFound(message),
        _ => HypervisorError::Libvirt(message),
    }
}

/// Libvirt 连接
pub struct LibvirtHypervisor {
    conn: Connect,
    agent_timeout: i32,
}

impl LibvirtHypervisor {
    /// 连接到 Libvirt (默认 qemu:///system)
    pub fn connect() -> Result<Self> {
        Self::connect_uri("qemu:///system")
    }

    /// 使用指定 URI 连接到 Libvirt
    pub fn connect_uri(uri: &str) -> Result<Self> {
        info!("连接到 Libvirt: {}", uri);

        let conn = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(e.to_string()))?;

        info!("成功连接到 Libvirt");
        Ok(Self {
            conn,
            agent_timeout: AGENT_TIMEOUT_DEFAULT,
        })
    }

    /// 设置 Guest Agent 命令超时（秒，-1 表示使用 libvirt 默认值）
    pub fn with_agent_timeout(mut self, timeout: i32) -> Self {
        self.agent_timeout = timeout;
        self
    }

    fn wrap(&self, domain: Domain) -> LibvirtDomain {
        LibvirtDomain {
            domain,
            agent_timeout: self.agent_timeout,
        }
    }
}

impl Hypervisor for LibvirtHypervisor {
    type Domain = LibvirtDomain;

    fn define_domain(&self, xml: &str) -> Result<LibvirtDomain> {
        debug!("定义虚拟机");
        let domain = Domain::define_xml(&self.conn, xml).map_err(map_error)?;
        Ok(self.wrap(domain))
    }

    fn lookup_domain(&self, name: &str) -> Result<LibvirtDomain> {
        debug!("查找虚拟机: {}", name);
        let domain = Domain::lookup_by_name(&self.conn, name).map_err(map_error)?;
        Ok(self.wrap(domain))
    }
}

impl Drop for LibvirtHypervisor {
    fn drop(&mut self) {
        if let Err(e) = self.conn.close() {
            error!("关闭 Libvirt 连接失败: {}", e);
        }
    }
}

/// Libvirt 虚拟机句柄
pub struct LibvirtDomain {
    domain: Domain,
    agent_timeout: i32,
}

impl LibvirtDomain {
    /// 底层 `virt` 句柄
    pub fn raw(&self) -> &Domain {
        &self.domain
    }
}

impl GuestChannel for LibvirtDomain {
    fn agent_command(&self, command: &str) -> Result<String> {
        self.domain
            .qemu_agent_command(command, self.agent_timeout, 0)
            .map_err(map_error)
    }
}

impl ManagedDomain for LibvirtDomain {
    type Snapshot = LibvirtSnapshot;

    fn name(&self) -> Result<String> {
        self.domain.get_name().map_err(map_error)
    }

    fn is_active(&self) -> Result<bool> {
        self.domain.is_active().map_err(map_error)
    }

    fn start(&self) -> Result<()> {
        self.domain.create().map(|_| ()).map_err(map_error)
    }

    fn destroy(&self) -> Result<()> {
        self.domain.destroy().map(|_| ()).map_err(map_error)
    }

    fn resume(&self) -> Result<()> {
        self.domain.resume().map(|_| ()).map_err(map_error)
    }

    fn suspend(&self) -> Result<()> {
        self.domain.suspend().map(|_| ()).map_err(map_error)
    }

    fn undefine(&self) -> Result<()> {
        self.domain.undefine().map(|_| ()).map_err(map_error)
    }

    fn xml_desc(&self) -> Result<String> {
        self.domain.get_xml_desc(0).map_err(map_error)
    }

    fn create_snapshot_xml(&self, xml: &str, mode: SnapshotCreateMode) -> Result<LibvirtSnapshot> {
        let flags = match mode {
            SnapshotCreateMode::Capture => 0,
            SnapshotCreateMode::Redefine => virt::sys::VIR_DOMAIN_SNAPSHOT_CREATE_REDEFINE,
        };
        let snapshot = DomainSnapshot::create_xml(&self.domain, xml, flags).map_err(map_error)?;
        Ok(LibvirtSnapshot { snapshot })
    }

    fn lookup_snapshot(&self, name: &str) -> Result<LibvirtSnapshot> {
        let snapshot = DomainSnapshot::lookup_by_name(&self.domain, name, 0).map_err(map_error)?;
        Ok(LibvirtSnapshot { snapshot })
    }

    fn list_snapshots(&self, order: SnapshotOrder) -> Result<Vec<LibvirtSnapshot>> {
        let flags = match order {
            SnapshotOrder::Any => 0,
            SnapshotOrder::Topological => virt::sys::VIR_DOMAIN_SNAPSHOT_LIST_TOPOLOGICAL,
        };
        let snapshots = self.domain.list_all_snapshots(flags).map_err(map_error)?;
        Ok(snapshots
            .into_iter()
            .map(|snapshot| LibvirtSnapshot { snapshot })
            .collect())
    }

    fn interface_addresses(&self) -> Result<Vec<NetworkInterface>> {
        let interfaces = self
            .domain
            .interface_addresses(virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT, 0)
            .map_err(map_error)?;

        Ok(interfaces
            .into_iter()
            .map(|iface| NetworkInterface {
                name: iface.name,
                hwaddr: Some(iface.hwaddr),
                addrs: iface.addrs.into_iter().map(|a| a.addr).collect(),
            })
            .collect())
    }
}

/// Libvirt 快照句柄
pub struct LibvirtSnapshot {
    snapshot: DomainSnapshot,
}

impl ManagedSnapshot for LibvirtSnapshot {
    fn name(&self) -> Result<String> {
        self.snapshot.get_name().map_err(map_error)
    }

    fn xml_desc(&self) -> Result<String> {
        self.snapshot.get_xml_desc(0).map_err(map_error)
    }

    fn revert(&self) -> Result<()> {
        self.snapshot.revert(0).map(|_| ()).map_err(map_error)
    }

    fn delete(&self) -> Result<()> {
        self.snapshot.delete(0).map(|_| ()).map_err(map_error)
    }
}
