//! 把已配置好的虚拟机导出为可移植模板
//!
//! 导出时去掉实例身份（id、uuid、MAC 地址），名称和镜像路径替换为占位符。
//! 快照描述中嵌套的域保留 uuid/MAC 元素，但内容替换为占位符，重新定义快照时
//! 由新虚拟机的身份填入。

use std::path::{Path, PathBuf};

use tbvm_transport::{ManagedDomain, ManagedSnapshot, SnapshotOrder};
use tracing::{debug, info};

use crate::bundle::Bundle;
use crate::template::Placeholder;
use crate::xml::{Element, Node};
use crate::{Result, VmError};

/// 快照集合文档的根元素
pub const SNAPSHOTS_ROOT: &str = "snapshots";

/// 快照描述中的活动域与非活动域
const SNAPSHOT_DOMAIN: &str = "domain";
const SNAPSHOT_INACTIVE_DOMAIN: &str = "inactiveDomain";

fn missing(path: &str) -> VmError {
    VmError::Xml(format!("域描述缺少 <{}>", path))
}

/// 从域描述中提取出的镜像路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSources {
    pub image: String,
    pub os: Option<String>,
}

/// 脱敏一个 `<domain>` 元素，返回被替换掉的镜像路径
///
/// `nested` 为 true 时表示快照描述中的域：uuid 与 MAC 替换为占位符而不是删除，
/// 且允许缺少第二块磁盘。
pub fn sanitize_domain(domain: &mut Element, nested: bool) -> Result<DiskSources> {
    domain.remove_attribute("id");

    if nested {
        domain
            .child_mut("uuid")
            .ok_or_else(|| missing("uuid"))?
            .set_text(Placeholder::Uuid.token());
    } else {
        domain.remove_child("uuid").ok_or_else(|| missing("uuid"))?;
    }

    domain
        .child_mut("name")
        .ok_or_else(|| missing("name"))?
        .set_text(Placeholder::Name.token());

    let interface = domain
        .find_mut("devices/interface")
        .ok_or_else(|| missing("devices/interface"))?;
    if nested {
        interface
            .child_mut("mac")
            .ok_or_else(|| missing("devices/interface/mac"))?
            .set_attribute("address", Placeholder::MacAddress.token());
    } else {
        interface
            .remove_child("mac")
            .ok_or_else(|| missing("devices/interface/mac"))?;
    }

    let image_source = domain
        .find_mut("devices/disk/source")
        .ok_or_else(|| missing("devices/disk/source"))?;
    let image = image_source
        .attribute("file")
        .ok_or_else(|| missing("devices/disk/source@file"))?
        .to_string();
    image_source.set_attribute("file", Placeholder::Image.token());

    let os = match domain.find_mut("devices/disk[1]/source") {
        Some(os_source) => {
            let os = os_source
                .attribute("file")
                .ok_or_else(|| missing("devices/disk[1]/source@file"))?
                .to_string();
            os_source.set_attribute("file", Placeholder::Os.token());
            Some(os)
        }
        None => None,
    };

    if os.is_none() && !nested {
        return Err(missing("devices/disk[1]/source"));
    }

    Ok(DiskSources { image, os })
}

/// 脱敏一个 `<domainsnapshot>` 描述
pub fn sanitize_snapshot(snapshot: &mut Element) -> Result<()> {
    let domain = snapshot
        .child_mut(SNAPSHOT_DOMAIN)
        .ok_or_else(|| VmError::Xml("快照描述缺少 <domain>".to_string()))?;
    sanitize_domain(domain, true)?;

    if let Some(inactive) = snapshot.child_mut(SNAPSHOT_INACTIVE_DOMAIN) {
        sanitize_domain(inactive, true)?;
    }
    Ok(())
}

/// 导出结果
#[derive(Debug, Clone)]
pub struct ExportedDomain {
    /// 脱敏后的域配置
    pub config: Element,
    /// `<snapshots>` 根，按拓扑顺序包含全部快照
    pub snapshots: Element,
    /// 原始磁盘镜像
    pub image: PathBuf,
    /// 原始系统镜像
    pub os: PathBuf,
}

impl ExportedDomain {
    pub fn snapshot_names(&self) -> Vec<String> {
        self.snapshots
            .children_named("domainsnapshot")
            .filter_map(|s| s.child("name").map(Element::text))
            .collect()
    }

    pub fn to_bundle(&self) -> Result<Bundle> {
        Ok(Bundle {
            config: self.config.to_xml()?,
            snapshots: self.snapshots.to_xml()?,
            image: self.image.clone(),
            os: self.os.clone(),
        })
    }
}

/// 虚拟机导出器
pub struct VmExporter<'a, D: ManagedDomain> {
    domain: &'a D,
}

impl<'a, D: ManagedDomain> VmExporter<'a, D> {
    pub fn new(domain: &'a D) -> Self {
        Self { domain }
    }

    /// 读取并脱敏域配置和全部快照
    pub fn capture(&self) -> Result<ExportedDomain> {
        let name = self.domain.name()?;
        info!(domain = %name, "导出虚拟机");

        let mut config = Element::parse(&self.domain.xml_desc()?)?;
        let sources = sanitize_domain(&mut config, false)?;
        let os = sources
            .os
            .ok_or_else(|| missing("devices/disk[1]/source"))?;

        let mut snapshots = Element::new(SNAPSHOTS_ROOT);
        for snapshot in self.domain.list_snapshots(SnapshotOrder::Topological)? {
            let mut description = Element::parse(&snapshot.xml_desc()?)?;
            sanitize_snapshot(&mut description)?;
            let snapshot_name = snapshot.name()?;
            debug!(domain = %name, snapshot = %snapshot_name, "导出快照");
            snapshots.children.push(Node::Text("\n  ".to_string()));
            snapshots.push(description);
        }
        if !snapshots.children.is_empty() {
            snapshots.children.push(Node::Text("\n".to_string()));
        }

        Ok(ExportedDomain {
            config,
            snapshots,
            image: PathBuf::from(sources.image),
            os: PathBuf::from(os),
        })
    }

    /// 导出为模板包文件
    pub fn export(&self, path: &Path) -> Result<ExportedDomain> {
        let exported = self.capture()?;
        exported.to_bundle()?.save(path)?;
        info!(
            path = %path.display(),
            snapshots = exported.snapshot_names().len(),
            "导出完成"
        );
        Ok(exported)
    }
}
