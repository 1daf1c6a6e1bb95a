//! 文件传输
//!
//! 单条 Guest Agent 消息有长度上限，整文件读写需要分块进行：
//! 写入时把 Base64 文本切成固定长度的块依次发送，读取时循环读取直到 `eof`。

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use tbvm_transport::GuestChannel;
use tracing::{debug, info, warn};

use crate::client::GuestAgent;
use crate::protocol::{self, FileOpenMode};
use crate::{AgentError, Result};

/// 拼接 Guest 内的路径（始终使用 `/`，与宿主机平台无关）
pub fn remote_join(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if base.is_empty() {
        return relative.to_string();
    }
    if relative.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), relative)
}

/// Guest 路径的父目录；没有父目录时返回 `None`
pub fn remote_parent(path: &str) -> Option<&str> {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent),
        _ => None,
    }
}

/// 已打开的 Guest 文件
///
/// 句柄只会被关闭一次：显式调用 [`RemoteFile::close`]，或在出错提前返回时由 `Drop` 关闭。
pub struct RemoteFile<'a, C: GuestChannel + ?Sized> {
    channel: &'a C,
    handle: i64,
    path: String,
    write_chunk_chars: usize,
    read_chunk_bytes: usize,
    closed: bool,
}

impl<'a, C: GuestChannel + ?Sized> RemoteFile<'a, C> {
    pub fn handle(&self) -> i64 {
        self.handle
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// 写入全部数据
    ///
    /// 编码后长度超过分块阈值时按顺序分块发送，每块都是独立合法的 Base64。
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let encoded = general_purpose::STANDARD.encode(bytes);

        if encoded.len() <= self.write_chunk_chars {
            return protocol::file_write(self.handle, encoded)?.run(self.channel, false);
        }

        let total = (encoded.len() + self.write_chunk_chars - 1) / self.write_chunk_chars;
        debug!(handle = self.handle, path = %self.path, chunks = total, "分块写入");

        // Base64 只含 ASCII，按字节切分不会落在字符中间
        for (index, chunk) in encoded.as_bytes().chunks(self.write_chunk_chars).enumerate() {
            let chunk = String::from_utf8_lossy(chunk).into_owned();
            protocol::file_write(self.handle, chunk)?.run(self.channel, false)?;
            debug!(handle = self.handle, chunk = index + 1, total, "已写入分块");
        }

        Ok(())
    }

    /// 读取直到文件末尾
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut content = Vec::new();

        loop {
            let chunk = protocol::file_read(self.handle, Some(self.read_chunk_bytes))?
                .run(self.channel, false)?;
            content.extend_from_slice(&chunk.bytes);

            if chunk.eof {
                break;
            }
        }

        debug!(handle = self.handle, path = %self.path, bytes = content.len(), "读取完成");
        Ok(content)
    }

    /// 关闭句柄
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.close_handle()
    }

    fn close_handle(&self) -> Result<()> {
        protocol::file_close(self.handle)?.run(self.channel, false)
    }
}

impl<C: GuestChannel + ?Sized> Drop for RemoteFile<'_, C> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.close_handle() {
            warn!(handle = self.handle, path = %self.path, error = %e, "关闭 Guest 文件句柄失败");
        }
    }
}

impl<'a, C: GuestChannel + ?Sized> GuestAgent<'a, C> {
    /// 打开 Guest 文件
    pub fn open(&self, path: &str, mode: FileOpenMode) -> Result<RemoteFile<'a, C>> {
        let handle = protocol::file_open(path, Some(mode))?.run(self.channel, true)?;
        debug!(handle, path, mode = mode.as_str(), "Guest 文件已打开");

        Ok(RemoteFile {
            channel: self.channel,
            handle,
            path: path.to_string(),
            write_chunk_chars: self.config.write_chunk_chars,
            read_chunk_bytes: self.config.read_chunk_bytes,
            closed: false,
        })
    }

    /// 写入整个文件（覆盖）
    pub fn write_bytes(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let mut file = self.open(path, FileOpenMode::Write)?;
        file.write_all(bytes)?;
        file.close()
    }

    /// 读取整个文件
    pub fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open(path, FileOpenMode::Read)?;
        let content = file.read_to_end()?;
        file.close()?;
        Ok(content)
    }

    /// 在 Guest 中执行 `mkdir -p`
    pub fn create_directories(&self, path: &str) -> Result<()> {
        let status = self.execute("mkdir", &["-p", path])?;
        if !status.success() {
            return Err(AgentError::CommandFailed {
                class: "mkdir".to_string(),
                desc: status
                    .stderr
                    .unwrap_or_else(|| format!("退出码 {:?}", status.exit_code)),
            });
        }
        Ok(())
    }

    /// 上传本地文件或目录
    ///
    /// 目录按文件名排序深度优先递归。每个文件写入前先确保父目录存在。
    /// 中途失败时已上传的文件保留在 Guest 中。
    pub fn write_file(&self, local: &Path, remote: &str) -> Result<()> {
        if local.is_dir() {
            let mut entries = fs::read_dir(local)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<Vec<_>>>()?;
            entries.sort();

            for entry in entries {
                let name = entry
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.write_file(&entry, &remote_join(remote, &name))?;
            }
            return Ok(());
        }

        if let Some(parent) = remote_parent(remote) {
            self.create_directories(parent)?;
        }

        let bytes = fs::read(local)?;
        info!(local = %local.display(), remote, bytes = bytes.len(), "上传文件");
        self.write_bytes(remote, &bytes)
    }

    /// 上传一组内存中的资源到同一目录，每个资源独立打开、写入、关闭
    pub fn write_resources<I, K, V>(&self, resources: I, remote_dir: &str) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        for (name, bytes) in resources {
            let path = remote_join(remote_dir, name.as_ref());
            debug!(path = %path, bytes = bytes.as_ref().len(), "上传资源");
            self.write_bytes(&path, bytes.as_ref())?;
        }
        Ok(())
    }

    /// 从同一目录下载一组资源
    pub fn read_resources<S: AsRef<str>>(
        &self,
        names: &[S],
        remote_dir: &str,
    ) -> Result<HashMap<String, Vec<u8>>> {
        let mut resources = HashMap::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let content = self.read_bytes(&remote_join(remote_dir, name))?;
            resources.insert(name.to_string(), content);
        }
        Ok(resources)
    }
}
