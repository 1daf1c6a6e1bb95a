//! 可移植模板包
//!
//! tar 归档，恰好包含四个条目：配置、快照集合、磁盘镜像、系统镜像。
//! 镜像按文件流式写入和解包，不整体读入内存。

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use tar::{Archive, Builder, Header};
use tracing::{debug, info};

use crate::{Result, VmError};

pub const CONFIG_ENTRY: &str = "config.xml";
pub const SNAPSHOTS_ENTRY: &str = "snapshots.xml";
pub const IMAGE_ENTRY: &str = "image.qcow2";
pub const OS_ENTRY: &str = "os.iso";

/// 模板包中的全部条目
pub const BUNDLE_ENTRIES: [&str; 4] = [CONFIG_ENTRY, SNAPSHOTS_ENTRY, IMAGE_ENTRY, OS_ENTRY];

/// 待打包的模板
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// 脱敏后的域配置
    pub config: String,
    /// 脱敏后的快照集合
    pub snapshots: String,
    /// 磁盘镜像路径
    pub image: PathBuf,
    /// 系统镜像路径
    pub os: PathBuf,
}

impl Bundle {
    /// 写入 tar 流
    pub fn write_to<W: Write>(&self, writer: W) -> Result<W> {
        let mut builder = Builder::new(writer);

        for (name, text) in [(CONFIG_ENTRY, &self.config), (SNAPSHOTS_ENTRY, &self.snapshots)] {
            debug!(entry = name, bytes = text.len(), "打包");
            let mut header = Header::new_gnu();
            header.set_size(text.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, name, text.as_bytes())?;
        }

        for (name, path) in [(IMAGE_ENTRY, &self.image), (OS_ENTRY, &self.os)] {
            debug!(entry = name, source = %path.display(), "打包");
            let mut file = File::open(path)?;
            builder.append_file(name, &mut file)?;
        }

        Ok(builder.into_inner()?)
    }

    /// 保存为文件
    pub fn save(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "写入模板包");
        let file = File::create(path)?;
        self.write_to(file)?.sync_all()?;
        Ok(())
    }
}

/// 条目名必须是单个普通路径分量
fn entry_name(path: &Path) -> Result<String> {
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => name
            .to_str()
            .map(str::to_string)
            .ok_or_else(|| VmError::Bundle(format!("条目名不是有效的 UTF-8: {:?}", path))),
        _ => Err(VmError::Bundle(format!("非法的条目路径: {:?}", path))),
    }
}

/// 把模板包解包到目录
///
/// 缺少、重复或多余的条目都视为错误。失败时已经写出的文件保留在目录中。
pub fn unpack<R: Read>(reader: R, target_dir: &Path) -> Result<()> {
    fs::create_dir_all(target_dir)?;

    let mut archive = Archive::new(reader);
    let mut seen = HashSet::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry_name(&entry.path()?)?;

        if !BUNDLE_ENTRIES.contains(&name.as_str()) {
            return Err(VmError::Bundle(format!("多余的条目: {}", name)));
        }
        if !entry.header().entry_type().is_file() {
            return Err(VmError::Bundle(format!("条目不是普通文件: {}", name)));
        }
        if !seen.insert(name.clone()) {
            return Err(VmError::Bundle(format!("重复的条目: {}", name)));
        }

        info!(entry = %name, "解包");
        entry.unpack(target_dir.join(&name))?;
    }

    if let Some(missing) = BUNDLE_ENTRIES.iter().find(|e| !seen.contains(**e)) {
        return Err(VmError::Bundle(format!("缺少条目: {}", missing)));
    }

    Ok(())
}

/// 从文件解包
pub fn unpack_file(bundle: &Path, target_dir: &Path) -> Result<()> {
    info!(bundle = %bundle.display(), target = %target_dir.display(), "解包模板包");
    unpack(File::open(bundle)?, target_dir)
}
