//! 模板工厂
//!
//! 存储目录布局：
//!
//! ```text
//! <storage>/vmData/config.xml      脱敏后的域配置
//! <storage>/vmData/snapshots.xml   快照集合
//! <storage>/vmData/image.qcow2     基础磁盘镜像
//! <storage>/vmData/os.iso          系统镜像
//! <storage>/vms/<name>.qcow2       每台虚拟机独占的磁盘副本
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tbvm_transport::{Hypervisor, ManagedDomain, SnapshotCreateMode};
use tracing::{debug, info, warn};

use crate::bundle::{self, CONFIG_ENTRY, IMAGE_ENTRY, OS_ENTRY, SNAPSHOTS_ENTRY};
use crate::config::VmConfig;
use crate::manager::VmManager;
use crate::template::{TemplateKind, TemplateValues, XmlTemplate};
use crate::xml::Element;
use crate::{Result, VmError};

/// 模板目录
pub const TEMPLATE_DIR: &str = "vmData";
/// 虚拟机镜像目录
pub const VM_DIR: &str = "vms";
/// 虚拟机镜像扩展名
pub const IMAGE_EXTENSION: &str = "qcow2";

/// 从模板创建虚拟机
pub struct TemplateFactory<'h, H: Hypervisor> {
    hypervisor: &'h H,
    storage_dir: PathBuf,
    config_template: XmlTemplate,
    snapshot_templates: Vec<XmlTemplate>,
    settings: VmConfig,
}

impl<'h, H: Hypervisor> TemplateFactory<'h, H> {
    /// 读取 `<storage>/vmData` 下的模板
    pub fn load(hypervisor: &'h H, storage_dir: impl Into<PathBuf>) -> Result<Self> {
        let storage_dir = storage_dir.into();
        let template_dir = storage_dir.join(TEMPLATE_DIR);
        info!(template_dir = %template_dir.display(), "加载虚拟机模板");

        let config_path = template_dir.join(CONFIG_ENTRY);
        let config_xml = fs::read_to_string(&config_path)
            .map_err(|e| missing_template(&config_path, e))?;
        let config_template = XmlTemplate::parse(TemplateKind::Config, &config_xml)?;

        let snapshots_path = template_dir.join(SNAPSHOTS_ENTRY);
        let snapshots_xml = fs::read_to_string(&snapshots_path)
            .map_err(|e| missing_template(&snapshots_path, e))?;
        let snapshot_templates = Element::parse(&snapshots_xml)?
            .children_named("domainsnapshot")
            .map(|snapshot| XmlTemplate::new(TemplateKind::Snapshot, snapshot.clone()))
            .collect::<Result<Vec<_>>>()?;

        debug!(snapshots = snapshot_templates.len(), "模板加载完成");

        Ok(Self {
            hypervisor,
            storage_dir,
            config_template,
            snapshot_templates,
            settings: VmConfig::default(),
        })
    }

    /// 解包模板包到存储目录，然后加载
    pub fn setup_from_bundle(
        hypervisor: &'h H,
        storage_dir: impl Into<PathBuf>,
        bundle_path: &Path,
    ) -> Result<Self> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(storage_dir.join(TEMPLATE_DIR))?;
        fs::create_dir_all(storage_dir.join(VM_DIR))?;

        bundle::unpack_file(bundle_path, &storage_dir.join(TEMPLATE_DIR))?;
        Self::load(hypervisor, storage_dir)
    }

    /// 新建虚拟机使用的 Guest Agent 与 SSH 参数
    pub fn with_config(mut self, settings: VmConfig) -> Result<Self> {
        settings.validate()?;
        self.settings = settings;
        Ok(self)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn template_dir(&self) -> PathBuf {
        self.storage_dir.join(TEMPLATE_DIR)
    }

    pub fn base_image(&self) -> PathBuf {
        self.template_dir().join(IMAGE_ENTRY)
    }

    pub fn os_image(&self) -> PathBuf {
        self.template_dir().join(OS_ENTRY)
    }

    /// 某台虚拟机的磁盘镜像路径
    pub fn image_path(&self, name: &str) -> PathBuf {
        self.storage_dir
            .join(VM_DIR)
            .join(format!("{}.{}", name, IMAGE_EXTENSION))
    }

    pub fn snapshot_templates(&self) -> &[XmlTemplate] {
        &self.snapshot_templates
    }

    /// 复制基础镜像、定义域并按顺序重新定义全部快照
    ///
    /// 镜像已存在时直接失败，不覆盖。中途失败不回滚已完成的步骤。
    pub fn create_vm(&self, name: &str) -> Result<VmManager<H::Domain>> {
        info!(vm = name, "创建虚拟机");

        let image = self.image_path(name);
        self.copy_base_image(&image)?;

        let mut values = TemplateValues::new(
            name,
            image.to_string_lossy(),
            self.os_image().to_string_lossy(),
        );
        let domain = self
            .hypervisor
            .define_domain(&self.config_template.render_xml(&values)?)?;

        let definition = Element::parse(&domain.xml_desc()?)?;
        let uuid = definition
            .child("uuid")
            .map(Element::text)
            .filter(|uuid| !uuid.is_empty())
            .ok_or_else(|| VmError::Xml("新定义的域缺少 <uuid>".to_string()))?;
        let mac_address = definition
            .find("devices/interface/mac")
            .and_then(|mac| mac.attribute("address"))
            .ok_or_else(|| VmError::Xml("新定义的域缺少 MAC 地址".to_string()))?
            .to_string();
        debug!(vm = name, uuid = %uuid, mac = %mac_address, "域已定义");

        values = values.with_identity(uuid, mac_address);
        for template in &self.snapshot_templates {
            let xml = template.render_xml(&values)?;
            domain.create_snapshot_xml(&xml, SnapshotCreateMode::Redefine)?;
        }

        info!(vm = name, snapshots = self.snapshot_templates.len(), "虚拟机创建完成");
        VmManager::new(domain, Some(image))?.with_config(&self.settings)
    }

    /// 查找已创建的虚拟机；磁盘镜像必须存在
    pub fn look_up_vm(&self, name: &str) -> Result<VmManager<H::Domain>> {
        let image = self.image_path(name);
        if !image.is_file() {
            return Err(VmError::ImageNotFound(image));
        }

        let domain = self.hypervisor.lookup_domain(name)?;
        VmManager::new(domain, Some(image))?.with_config(&self.settings)
    }

    fn copy_base_image(&self, target: &Path) -> Result<()> {
        // 先确认模板镜像可读，避免留下空的目标镜像
        let source_path = self.base_image();
        let mut source =
            File::open(&source_path).map_err(|e| missing_template(&source_path, e))?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut destination = match OpenOptions::new().write(true).create_new(true).open(target) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(VmError::ImageExists(target.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };

        match io::copy(&mut source, &mut destination) {
            Ok(bytes) => {
                debug!(target = %target.display(), bytes, "已复制基础镜像");
                Ok(())
            }
            Err(e) => {
                drop(destination);
                if let Err(remove) = fs::remove_file(target) {
                    warn!(target = %target.display(), error = %remove, "清理未完成的镜像失败");
                }
                Err(e.into())
            }
        }
    }
}

fn missing_template(path: &Path, error: io::Error) -> VmError {
    if error.kind() == ErrorKind::NotFound {
        VmError::MissingResource(path.to_path_buf())
    } else {
        VmError::Io(error)
    }
}
