//! 虚拟机生命周期管理
//!
//! 一个 [`VmManager`] 绑定一个域及其磁盘镜像（可选）。快照状态之间的切换顺序由
//! 调用方决定，这里只提供机制。

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tbvm_protocol::{AgentConfig, ExecStatus, GuestAgent};
use tbvm_ssh_executor::{SshClient, SshConfig};
use tbvm_transport::{ManagedDomain, ManagedSnapshot, SnapshotCreateMode, SnapshotOrder};
use tracing::{debug, info, warn};

use crate::config::{SshSettings, VmConfig};
use crate::snapshot::Snapshot;
use crate::xml::Element;
use crate::{Result, VmError};

/// 通过 Guest Agent 查询地址时使用的网卡
const PRIMARY_INTERFACE: &str = "eth0";

/// 虚拟机管理器
pub struct VmManager<D: ManagedDomain> {
    domain: D,
    name: String,
    image: Option<PathBuf>,
    agent_config: AgentConfig,
    ssh: SshSettings,
}

impl<D: ManagedDomain> VmManager<D> {
    /// 绑定一个域；`image` 为该域独占的磁盘镜像，销毁时一并删除
    pub fn new(domain: D, image: Option<PathBuf>) -> Result<Self> {
        let name = domain.name()?;
        Ok(Self {
            domain,
            name,
            image,
            agent_config: AgentConfig::default(),
            ssh: SshSettings::default(),
        })
    }

    /// 使用配置中的 Guest Agent 与 SSH 参数
    pub fn with_config(mut self, config: &VmConfig) -> Result<Self> {
        config.agent.validate()?;
        self.agent_config = config.agent.clone();
        self.ssh = config.ssh.clone();
        Ok(self)
    }

    pub fn domain(&self) -> &D {
        &self.domain
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> Option<&Path> {
        self.image.as_deref()
    }

    /// 绑定到此域的 Guest Agent 客户端
    pub fn agent(&self) -> tbvm_protocol::Result<GuestAgent<'_, D>> {
        GuestAgent::with_config(&self.domain, self.agent_config.clone())
    }

    // ========================================================================
    // 域控制
    // ========================================================================

    pub fn start(&self) -> Result<()> {
        info!(domain = %self.name, "启动虚拟机");
        self.domain.start()?;
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        info!(domain = %self.name, "恢复虚拟机");
        self.domain.resume()?;
        Ok(())
    }

    pub fn suspend(&self) -> Result<()> {
        info!(domain = %self.name, "暂停虚拟机");
        self.domain.suspend()?;
        Ok(())
    }

    /// 停止并删除虚拟机：全部快照、域定义和磁盘镜像
    ///
    /// 没有回滚：镜像删除失败时域已被取消定义。
    pub fn destroy(self) -> Result<()> {
        info!(domain = %self.name, "销毁虚拟机");

        if self.domain.is_active()? {
            self.domain.destroy()?;
        }

        for snapshot in self.domain.list_snapshots(SnapshotOrder::Any)? {
            let name = snapshot.name()?;
            debug!(domain = %self.name, snapshot = %name, "删除快照");
            snapshot.delete()?;
        }

        self.domain.undefine()?;

        if let Some(image) = &self.image {
            debug!(domain = %self.name, image = %image.display(), "删除磁盘镜像");
            fs::remove_file(image)?;
        }

        info!(domain = %self.name, "虚拟机已销毁");
        Ok(())
    }

    // ========================================================================
    // 快照
    // ========================================================================

    /// 以当前状态创建快照，只提交名称和描述
    pub fn create_snapshot(&self, name: &str, description: &str) -> Result<D::Snapshot> {
        info!(domain = %self.name, snapshot = name, "创建快照");

        let mut root = Element::new("domainsnapshot");
        let mut name_element = Element::new("name");
        name_element.set_text(name);
        root.push(name_element);
        let mut description_element = Element::new("description");
        description_element.set_text(description);
        root.push(description_element);

        let snapshot = self
            .domain
            .create_snapshot_xml(&root.to_xml()?, SnapshotCreateMode::Capture)?;
        Ok(snapshot)
    }

    pub fn create_state_snapshot(&self, state: Snapshot) -> Result<D::Snapshot> {
        self.create_snapshot(state.name(), state.description())
    }

    /// 回滚到约定状态对应的快照
    pub fn restore_snapshot(&self, state: Snapshot) -> Result<()> {
        let snapshot = self.domain.lookup_snapshot(state.name())?;
        self.restore_snapshot_handle(&snapshot)
    }

    pub fn restore_snapshot_handle(&self, snapshot: &D::Snapshot) -> Result<()> {
        let description = Element::parse(&snapshot.xml_desc()?)?;
        let name = description
            .child("name")
            .map(Element::text)
            .ok_or_else(|| VmError::Xml("快照描述缺少 <name>".to_string()))?;

        info!(domain = %self.name, snapshot = %name, "回滚到快照");
        snapshot.revert()?;
        info!(domain = %self.name, snapshot = %name, "回滚完成");
        Ok(())
    }

    // ========================================================================
    // Guest Agent
    // ========================================================================

    fn agent_available(&self) -> tbvm_protocol::Result<bool> {
        if !self.domain.is_active()? {
            return Ok(false);
        }
        self.agent()?.ping()
    }

    /// 域未运行时直接返回 `false`，否则发送不记录日志的 ping
    pub fn is_guest_agent_available(&self) -> Result<bool> {
        Ok(self.agent_available()?)
    }

    /// 轮询直到 Guest Agent 可用，次数与间隔由配置的轮询策略决定
    pub fn wait_for_guest_agent(&self) -> Result<()> {
        info!(domain = %self.name, "等待 Guest Agent 上线");
        self.agent_config
            .poll
            .poll("Guest Agent 上线", || Ok(self.agent_available()?.then_some(())))?;
        info!(domain = %self.name, "Guest Agent 已连接");
        Ok(())
    }

    pub fn execute_command(&self, command_line: &str) -> Result<ExecStatus> {
        Ok(self.agent()?.execute_command(command_line)?)
    }

    pub fn execute_command_async(&self, command_line: &str, capture_output: bool) -> Result<i64> {
        Ok(self.agent()?.execute_command_async(command_line, capture_output)?)
    }

    pub fn wait_for_process_finish(&self, pid: i64) -> Result<ExecStatus> {
        Ok(self.agent()?.wait_for_process_finish(pid)?)
    }

    pub fn write_file(&self, local: &Path, remote: &str) -> Result<()> {
        info!(domain = %self.name, local = %local.display(), remote, "向虚拟机发送文件");
        Ok(self.agent()?.write_file(local, remote)?)
    }

    pub fn write_resources<I, K, V>(&self, resources: I, remote_dir: &str) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        info!(domain = %self.name, remote_dir, "向虚拟机发送资源");
        Ok(self.agent()?.write_resources(resources, remote_dir)?)
    }

    pub fn read_resources<S: AsRef<str>>(
        &self,
        names: &[S],
        remote_dir: &str,
    ) -> Result<HashMap<String, Vec<u8>>> {
        info!(domain = %self.name, remote_dir, "从虚拟机读取资源");
        Ok(self.agent()?.read_resources(names, remote_dir)?)
    }

    // ========================================================================
    // 网络
    // ========================================================================

    /// eth0 上第一个 IPv4 地址；域未运行或没有合适地址时返回状态错误
    pub fn get_ip(&self) -> Result<Ipv4Addr> {
        if !self.domain.is_active()? {
            return Err(VmError::State(format!(
                "无法获取 {} 的 IP：虚拟机未运行",
                self.name
            )));
        }

        let interfaces = self.domain.interface_addresses()?;
        let address = interfaces
            .iter()
            .filter(|iface| iface.name == PRIMARY_INTERFACE)
            .flat_map(|iface| iface.addrs.iter())
            .find_map(|addr| addr.parse::<Ipv4Addr>().ok());

        match address {
            Some(address) => Ok(address),
            None => {
                let names: Vec<&str> = interfaces.iter().map(|i| i.name.as_str()).collect();
                warn!(domain = %self.name, interfaces = ?names, "没有可用的 IPv4 地址");
                Err(VmError::State(format!(
                    "无法获取 {} 的 IP：没有合适的网络接口 {:?}",
                    self.name, names
                )))
            }
        }
    }

    /// 当前 IP 对应的 SSH 配置
    pub fn ssh_config(&self) -> Result<SshConfig> {
        let ip = self.get_ip()?;
        Ok(SshConfig::with_password(ip.to_string(), &self.ssh.username, &self.ssh.password)
            .port(self.ssh.port))
    }

    /// 通过 SSH 备用通道连接虚拟机
    pub async fn connect(&self) -> Result<SshClient> {
        let config = self.ssh_config()?;
        info!(domain = %self.name, address = %config.address(), "通过 SSH 连接虚拟机");
        Ok(SshClient::connect(config).await?)
    }
}
