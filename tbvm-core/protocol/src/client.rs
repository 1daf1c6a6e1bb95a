//! Guest Agent 客户端
//!
//! 在原始命令通道之上提供 ping、进程启动与等待。文件传输见 [`crate::file`]。

use tbvm_transport::GuestChannel;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::protocol::{self, ExecStatus, GuestExecCommand};
use crate::{AgentError, Result};

/// QEMU Guest Agent 客户端
pub struct GuestAgent<'a, C: GuestChannel + ?Sized> {
    pub(crate) channel: &'a C,
    pub(crate) config: AgentConfig,
}

impl<'a, C: GuestChannel + ?Sized> GuestAgent<'a, C> {
    /// 使用默认配置创建客户端
    pub fn new(channel: &'a C) -> Self {
        Self {
            channel,
            config: AgentConfig::default(),
        }
    }

    /// 使用指定配置创建客户端
    pub fn with_config(channel: &'a C, config: AgentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { channel, config })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// 测试 Guest Agent 是否可用
    ///
    /// Agent 未连接或虚拟机状态不允许通信时返回 `false`；其它错误照常返回。
    pub fn ping(&self) -> Result<bool> {
        match protocol::ping().run(self.channel, false) {
            Ok(()) => Ok(true),
            Err(AgentError::Transport(e)) if e.is_agent_unavailable() => {
                debug!(error = %e, "Guest Agent 暂不可用");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// 启动进程，立即返回 PID
    pub fn exec(&self, command: &GuestExecCommand) -> Result<i64> {
        let pid = command.to_command()?.run(self.channel, true)?;
        info!(
            path = command.path.as_deref().unwrap_or_default(),
            pid, "Guest 进程已启动"
        );
        Ok(pid)
    }

    /// 以程序路径和参数启动进程
    pub fn execute_async<S: AsRef<str>>(&self, path: &str, args: &[S], capture_output: bool) -> Result<i64> {
        let args = args.iter().map(|a| a.as_ref().to_string()).collect();
        self.exec(&GuestExecCommand::new(path, args).capture_output(capture_output))
    }

    /// 以一行命令启动进程
    ///
    /// 命令按空白拆分，不支持引号和转义；参数含空格时请使用 [`Self::execute_async`]。
    pub fn execute_command_async(&self, command_line: &str, capture_output: bool) -> Result<i64> {
        self.exec(&GuestExecCommand::from_command_line(command_line).capture_output(capture_output))
    }

    /// 查询进程状态（不记录请求内容）
    pub fn exec_status(&self, pid: i64) -> Result<ExecStatus> {
        protocol::exec_status(pid)?.run(self.channel, false)
    }

    /// 轮询直到进程退出，次数与间隔由 [`crate::PollPolicy`] 决定
    pub fn wait_for_process_finish(&self, pid: i64) -> Result<ExecStatus> {
        debug!(pid, "等待 Guest 进程退出");

        let status = self.config.poll.poll("Guest 进程退出", || {
            let status = self.exec_status(pid)?;
            Ok(status.exited.then_some(status))
        })?;

        info!(pid, exit_code = ?status.exit_code, "Guest 进程已退出");
        Ok(status)
    }

    /// 执行一行命令并等待完成（捕获输出）
    pub fn execute_command(&self, command_line: &str) -> Result<ExecStatus> {
        let pid = self.execute_command_async(command_line, true)?;
        self.wait_for_process_finish(pid)
    }

    /// 执行程序并等待完成（捕获输出）
    pub fn execute<S: AsRef<str>>(&self, path: &str, args: &[S]) -> Result<ExecStatus> {
        let pid = self.execute_async(path, args, true)?;
        self.wait_for_process_finish(pid)
    }
}
