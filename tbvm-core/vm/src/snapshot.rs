//! 众所周知的快照状态
//!
//! 约定的线性顺序为 `Login → Setup → Base → Server`，每个状态对应一个同名快照。
//! 管理器本身不强制这个顺序，由上层工作流负责。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::VmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Snapshot {
    /// 已登录系统
    Login,
    /// 系统配置完成
    Setup,
    /// 加入所有虚拟机共用的文件和依赖
    Base,
    /// 服务端文件就绪
    Server,
}

impl Snapshot {
    pub const ALL: [Snapshot; 4] = [Snapshot::Login, Snapshot::Setup, Snapshot::Base, Snapshot::Server];

    /// 快照名称
    pub fn name(&self) -> &'static str {
        match self {
            Self::Login => "Login",
            Self::Setup => "Setup",
            Self::Base => "Base",
            Self::Server => "Server",
        }
    }

    /// 快照描述
    pub fn description(&self) -> &'static str {
        match self {
            Self::Login => "Logged into machine",
            Self::Setup => "Finished OS configuration",
            Self::Base => "Added files and dependencies needed for all machines",
            Self::Server => "Created files for Minecraft server",
        }
    }

    /// 约定顺序中的下一个状态
    pub fn next(&self) -> Option<Snapshot> {
        match self {
            Self::Login => Some(Self::Setup),
            Self::Setup => Some(Self::Base),
            Self::Base => Some(Self::Server),
            Self::Server => None,
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Snapshot {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|snapshot| snapshot.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| VmError::Config(format!("未知的快照状态: {}", s)))
    }
}
