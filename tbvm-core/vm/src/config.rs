//! 虚拟机管理配置
//!
//! **数据存储方式**: TOML 文件，不存在时使用默认值

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use tbvm_protocol::AgentConfig;
use tbvm_ssh_executor::SshConfig;

use crate::{Result, VmError};

/// 虚拟机管理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Libvirt URI
    #[serde(default = "default_libvirt_uri")]
    pub libvirt_uri: String,

    /// 存储目录（模板、实例镜像、服务端版本）
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Libvirt Guest Agent 命令超时（秒，-1 表示使用 libvirt 默认值）
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: i32,

    /// Guest Agent 配置
    #[serde(default)]
    pub agent: AgentConfig,

    /// SSH 备用通道
    #[serde(default)]
    pub ssh: SshSettings,
}

/// SSH 登录信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_ssh_username")]
    pub username: String,

    #[serde(default = "default_ssh_password")]
    pub password: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            libvirt_uri: default_libvirt_uri(),
            storage_dir: default_storage_dir(),
            agent_timeout_secs: default_agent_timeout_secs(),
            agent: AgentConfig::default(),
            ssh: SshSettings::default(),
        }
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            username: default_ssh_username(),
            password: default_ssh_password(),
            port: default_ssh_port(),
        }
    }
}

impl VmConfig {
    /// 加载配置；文件不存在时返回默认值
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| VmError::Config(format!("解析配置文件失败 {:?}: {}", path, e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| VmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| VmError::Config(format!("序列化配置失败: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.agent.validate()?;
        if self.libvirt_uri.is_empty() {
            return Err(VmError::Config("libvirt_uri 不能为空".to_string()));
        }
        Ok(())
    }

    /// 针对某个 Guest 地址的 SSH 配置
    pub fn ssh_config(&self, host: impl Into<String>) -> SshConfig {
        SshConfig::with_password(host, &self.ssh.username, &self.ssh.password).port(self.ssh.port)
    }
}

// 默认值函数
fn default_libvirt_uri() -> String {
    "qemu:///system".to_string()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("storage")
}

fn default_agent_timeout_secs() -> i32 {
    -1
}

fn default_ssh_username() -> String {
    "root".to_string()
}

fn default_ssh_password() -> String {
    "sshPassword".to_string()
}

fn default_ssh_port() -> u16 {
    22
}
