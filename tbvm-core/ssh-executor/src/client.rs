//! 服务端虚拟机的 SSH 通道
//!
//! 调用系统 ssh/scp，密码经 sshpass 的 SSHPASS 环境变量传递，不出现在命令行上

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::SshConfig;
use crate::error::{Result, SshError};

/// 远端命令的结果，输出已去掉首尾空白
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// 被信号终止时为 `None`
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    /// 用于报错的诊断文本：优先 stderr，为空时退回 stdout
    pub fn diagnostic(&self) -> &str {
        if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// 用单引号包裹，供远端 shell 按字面解析
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// 服务端虚拟机的 SSH 通道，每条命令启动一个系统 ssh 进程
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    /// 在虚拟机上执行一次 `hostname`，确认地址可达且凭据有效
    pub async fn connect(config: SshConfig) -> Result<Self> {
        info!(destination = %config.destination(), "连接服务端虚拟机");

        let client = Self { config };
        let output = client.execute("hostname").await?;
        if !output.succeeded() {
            return Err(SshError::ConnectionError(format!(
                "{} 不可用 (退出码 {:?}): {}",
                client.config.address(),
                output.exit_code,
                output.diagnostic()
            )));
        }

        debug!(address = %client.config.address(), hostname = %output.stdout, "SSH 通道就绪");
        Ok(client)
    }

    /// 通用 SSH 参数
    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs()),
            "-o".to_string(),
            "NumberOfPasswordPrompts=1".to_string(),
        ]
    }

    /// `sshpass -e <program>`，密码放在 SSHPASS 环境变量中
    fn sshpass(&self, program: &str) -> Command {
        let mut cmd = Command::new("sshpass");
        cmd.env("SSHPASS", &self.config.password)
            .arg("-e")
            .arg(program)
            .args(self.common_options());
        cmd
    }

    fn ssh_command(&self, command: &str) -> Command {
        let mut cmd = self.sshpass("ssh");
        cmd.arg("-p")
            .arg(self.config.port.to_string())
            .arg(self.config.destination())
            .arg(command);
        cmd
    }

    /// 执行命令
    pub async fn execute(&self, command: &str) -> Result<CommandOutput> {
        debug!("执行命令: {}", command);
        self.run_with_timeout(command, self.ssh_command(command), None).await
    }

    /// 执行命令并检查是否成功
    pub async fn execute_checked(&self, command: &str) -> Result<CommandOutput> {
        let output = self.execute(command).await?;
        check(command, output)
    }

    /// 在后台启动命令，不等待其结束
    pub async fn execute_no_wait(&self, command: &str) -> Result<()> {
        let detached = format!("nohup sh -c {} > /dev/null 2>&1 &", shell_quote(command));
        debug!("后台执行命令: {}", command);
        self.execute_checked(&detached).await?;
        Ok(())
    }

    /// 上传一组内存中的资源到同一远程目录
    pub async fn upload_resources<I, K, V>(&self, resources: I, remote_dir: &str) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        info!("上传资源到 {}:{}", self.config.host, remote_dir);

        for (name, bytes) in resources {
            let remote = format!("{}/{}", remote_dir.trim_end_matches('/'), name.as_ref());
            let command = format!("cat > {}", shell_quote(&remote));
            debug!("上传 {} ({} 字节)", remote, bytes.as_ref().len());

            let output = self
                .run_with_timeout(&command, self.ssh_command(&command), Some(bytes.as_ref()))
                .await?;
            check(&command, output).map_err(|e| SshError::TransferError(e.to_string()))?;
        }

        Ok(())
    }

    /// 递归上传本地文件或目录（scp -r）
    ///
    /// 远程父目录会先被创建。远程路径不能包含空格。
    pub async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        info!("上传 {} -> {}:{}", local.display(), self.config.host, remote);

        if let Some((parent, _)) = remote.trim_end_matches('/').rsplit_once('/') {
            if !parent.is_empty() {
                self.execute_checked(&format!("mkdir -p {}", shell_quote(parent)))
                    .await?;
            }
        }

        let mut cmd = self.sshpass("scp");
        cmd.arg("-r")
            .arg("-P")
            .arg(self.config.port.to_string())
            .arg(local)
            .arg(format!("{}:{}", self.config.destination(), remote));

        let description = format!("scp {}", local.display());
        let output = self.run_with_timeout(&description, cmd, None).await?;
        check(&description, output).map_err(|e| SshError::TransferError(e.to_string()))?;
        Ok(())
    }

    async fn run_with_timeout(
        &self,
        description: &str,
        cmd: Command,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput> {
        timeout(self.config.command_timeout, run(cmd, stdin))
            .await
            .map_err(|_| SshError::TimeoutError(format!("命令执行超时: {}", description)))?
    }

    /// 关闭连接（对于系统 ssh 命令，无需显式关闭）
    pub async fn disconnect(self) -> Result<()> {
        debug!("断开 SSH: {}", self.config.address());
        Ok(())
    }

    /// 获取配置
    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

/// 启动进程并收集输出
async fn run(mut cmd: Command, stdin: Option<&[u8]>) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| SshError::ExecutionError(format!("启动 SSH 进程失败: {}", e)))?;

    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(data).await?;
        pipe.shutdown().await?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| SshError::ExecutionError(format!("等待 SSH 进程失败: {}", e)))?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        exit_code: output.status.code().map(|c| c as u32),
    };

    // sshpass 以 5 表示密码错误，ssh 以 255 表示连接或认证失败
    if result.exit_code == Some(5) || result.exit_code == Some(255) {
        if result.stderr.contains("Permission denied")
            || result.stderr.contains("Authentication failed")
            || result.stderr.contains("password")
        {
            return Err(SshError::AuthenticationError(result.stderr));
        }
    }

    debug!(
        "命令执行完成, 退出码: {:?}, stdout 长度: {}, stderr 长度: {}",
        result.exit_code,
        result.stdout.len(),
        result.stderr.len()
    );

    Ok(result)
}

fn check(command: &str, output: CommandOutput) -> Result<CommandOutput> {
    if !output.succeeded() {
        return Err(SshError::ExecutionError(format!(
            "{} (退出码 {:?}): {}",
            command,
            output.exit_code,
            output.diagnostic()
        )));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output() {
        let output = CommandOutput {
            stdout: "tbvm-server".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        };
        assert!(output.succeeded());
        assert_eq!(output.diagnostic(), "tbvm-server");

        let killed = CommandOutput {
            exit_code: None,
            ..output
        };
        assert!(!killed.succeeded());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/root/my dir"), "'/root/my dir'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_check_reports_stderr() {
        let output = CommandOutput {
            stdout: "partial".to_string(),
            stderr: "No such file".to_string(),
            exit_code: Some(1),
        };
        let err = check("cat /nope", output).unwrap_err();
        assert!(err.to_string().contains("No such file"));

        let quiet = CommandOutput {
            stdout: "run.sh: permission denied".to_string(),
            stderr: String::new(),
            exit_code: Some(126),
        };
        let err = check("/root/server/run.sh", quiet).unwrap_err();
        assert!(err.to_string().contains("run.sh: permission denied"));
    }

    #[test]
    fn test_common_options() {
        let client = SshClient {
            config: SshConfig::with_password("10.0.0.2", "root", "pw")
                .connect_timeout(std::time::Duration::from_secs(5)),
        };
        let options = client.common_options();
        assert!(options.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(options.contains(&"ConnectTimeout=5".to_string()));
        assert!(!options.iter().any(|o| o.contains("pw")));
    }
}
