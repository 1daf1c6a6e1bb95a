//! 部署示例：从模板创建服务端虚拟机，回到 Server 快照并通过 SSH 执行命令
//!
//! ```text
//! cargo run -p tbvm-vm --example provision -- 1.20.4 [tbvm.toml]
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use tbvm_transport::LibvirtHypervisor;
use tbvm_vm::{ServerProvisioner, TemplateFactory, VmConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let version = args.next().context("用法: provision <version> [config.toml]")?;
    let config_path = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("tbvm.toml"));

    let config = VmConfig::load(&config_path)?;
    info!(uri = %config.libvirt_uri, storage = %config.storage_dir.display(), "连接 Hypervisor");

    let hypervisor = LibvirtHypervisor::connect_uri(&config.libvirt_uri)?
        .with_agent_timeout(config.agent_timeout_secs);
    let factory = TemplateFactory::load(&hypervisor, config.storage_dir.clone())?
        .with_config(config.clone())?;

    let server = ServerProvisioner::new(&factory).create_server(&version)?;
    server.rerun_server()?;

    let ip = server.vm().get_ip()?;
    info!(version = %version, ip = %ip, "服务端虚拟机已就绪");

    let ssh = server.vm().connect().await?;
    let output = ssh.execute("cat /root/server/run.sh").await?;
    info!(exit_code = ?output.exit_code, "run.sh:\n{}", output.stdout);
    ssh.disconnect().await?;

    Ok(())
}
