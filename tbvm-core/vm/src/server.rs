//! 服务端部署工作流
//!
//! 在 `Base` 快照之上放置服务端模板和指定版本的 jar，保存为 `Server` 快照。
//! 之后每次运行都从 `Server` 快照开始。

use std::path::{Path, PathBuf};

use tbvm_protocol::AgentError;
use tbvm_transport::{Hypervisor, ManagedDomain};
use tracing::{info, warn};

use crate::factory::TemplateFactory;
use crate::manager::VmManager;
use crate::snapshot::Snapshot;
use crate::{Result, VmError};

/// 服务端模板目录（相对存储目录）
pub const SERVER_TEMPLATE_DIR: &str = "serverTemplate";
/// 服务端版本目录（相对存储目录），内含 `<version>.jar`
pub const SERVER_VERSIONS_DIR: &str = "serverVersions";

/// Guest 中的路径
pub const REMOTE_VM_FILES: &str = "/root/vmFiles";
pub const REMOTE_SERVER_DIR: &str = "/root/server";
const REMOTE_SERVER_JAR: &str = "/root/server/server.jar";
const REMOTE_RUN_SCRIPT: &str = "/root/server/run.sh";
const RESET_NETWORKING: &str = "/root/vmFiles/resetNetworking.sh";
const INSTALL_PACKAGES: &str = "/root/vmFiles/installPackages.sh";

/// 项目目录中需要上传到 Guest 的脚本目录
const LOCAL_VM_FILES: &str = "vmFiles";

fn require_exists(path: PathBuf) -> Result<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(VmError::MissingResource(path))
    }
}

fn chmod_executable<D: ManagedDomain>(vm: &VmManager<D>, path: &str) -> Result<()> {
    let status = vm.execute_command(&format!("chmod +x {}", path))?;
    if !status.success() {
        warn!(vm = %vm.name(), path, exit_code = ?status.exit_code, "chmod 失败");
    }
    Ok(())
}

/// 准备 `Base` 快照
///
/// 从 `Setup` 快照开始，上传项目的 `vmFiles` 目录，安装依赖后暂停并保存。
pub fn prepare_base<D: ManagedDomain>(vm: &VmManager<D>, project_dir: &Path) -> Result<()> {
    let vm_files = require_exists(project_dir.join(LOCAL_VM_FILES))?;
    info!(vm = %vm.name(), "准备 Base 快照");

    vm.restore_snapshot(Snapshot::Setup)?;
    vm.resume()?;
    vm.wait_for_guest_agent()?;

    vm.write_file(&vm_files, REMOTE_VM_FILES)?;
    chmod_executable(vm, INSTALL_PACKAGES)?;
    chmod_executable(vm, RESET_NETWORKING)?;

    let status = vm.execute_command(INSTALL_PACKAGES)?;
    if let Some(stdout) = status.stdout.as_deref() {
        info!(vm = %vm.name(), output = %stdout.trim_end(), "installPackages.sh 输出");
    }
    if !status.success() {
        return Err(AgentError::CommandFailed {
            class: "installPackages.sh".to_string(),
            desc: status
                .stderr
                .unwrap_or_else(|| format!("退出码 {:?}", status.exit_code)),
        }
        .into());
    }

    vm.suspend()?;
    vm.create_state_snapshot(Snapshot::Base)?;
    info!(vm = %vm.name(), "Base 快照已保存");
    Ok(())
}

/// 基于模板工厂创建服务端虚拟机
pub struct ServerProvisioner<'f, 'h, H: Hypervisor> {
    factory: &'f TemplateFactory<'h, H>,
}

impl<'f, 'h, H: Hypervisor> ServerProvisioner<'f, 'h, H> {
    pub fn new(factory: &'f TemplateFactory<'h, H>) -> Self {
        Self { factory }
    }

    pub fn server_template(&self) -> PathBuf {
        self.factory.storage_dir().join(SERVER_TEMPLATE_DIR)
    }

    pub fn server_jar(&self, version: &str) -> PathBuf {
        self.factory
            .storage_dir()
            .join(SERVER_VERSIONS_DIR)
            .join(format!("{}.jar", version))
    }

    /// 创建以版本号命名的虚拟机，部署服务端并保存 `Server` 快照
    ///
    /// 返回时虚拟机处于暂停状态。
    pub fn create_server(&self, version: &str) -> Result<ServerManager<H::Domain>> {
        let template = require_exists(self.server_template())?;
        let jar = require_exists(self.server_jar(version))?;
        info!(version, "创建服务端虚拟机");

        let vm = self.factory.create_vm(version)?;

        vm.restore_snapshot(Snapshot::Base)?;
        vm.resume()?;
        vm.wait_for_guest_agent()?;

        // 网络重置和文件上传并行进行
        let networking = vm.execute_command_async(RESET_NETWORKING, false)?;

        vm.write_file(&template, REMOTE_SERVER_DIR)?;
        vm.write_file(&jar, REMOTE_SERVER_JAR)?;
        chmod_executable(&vm, REMOTE_RUN_SCRIPT)?;

        let status = vm.wait_for_process_finish(networking)?;
        if !status.success() {
            warn!(version, exit_code = ?status.exit_code, "resetNetworking.sh 未成功退出");
        }

        vm.suspend()?;
        vm.create_state_snapshot(Snapshot::Server)?;
        info!(version, "服务端虚拟机就绪");

        Ok(ServerManager::new(vm))
    }
}

/// 服务端虚拟机
pub struct ServerManager<D: ManagedDomain> {
    vm: VmManager<D>,
}

impl<D: ManagedDomain> ServerManager<D> {
    pub fn new(vm: VmManager<D>) -> Self {
        Self { vm }
    }

    pub fn vm(&self) -> &VmManager<D> {
        &self.vm
    }

    pub fn into_inner(self) -> VmManager<D> {
        self.vm
    }

    /// 回到 `Server` 快照并等待 Guest Agent，准备下一次运行
    pub fn rerun_server(&self) -> Result<()> {
        info!(vm = %self.vm.name(), "重新运行服务端");
        self.vm.restore_snapshot(Snapshot::Server)?;
        self.vm.resume()?;
        self.vm.wait_for_guest_agent()
    }
}
