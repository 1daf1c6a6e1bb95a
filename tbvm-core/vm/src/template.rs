//! 结构化 XML 模板
//!
//! 替换点只能是“整个文本节点”或“整个属性值”，且必须与占位符完全相等。
//! 加载时扫描并校验全部替换点，渲染时只在记录下的位置写入值，
//! 因此替换进去的内容不会再被当作占位符解析。

use std::collections::BTreeSet;
use std::fmt;

use crate::xml::{Element, Node};
use crate::{Result, VmError};

/// 模板占位符
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Placeholder {
    /// 虚拟机名称
    Name,
    /// 磁盘镜像路径
    Image,
    /// 系统安装镜像路径
    Os,
    /// 定义后由 Hypervisor 生成的 UUID
    Uuid,
    /// 定义后由 Hypervisor 生成的第一块网卡 MAC 地址
    MacAddress,
}

impl Placeholder {
    pub const ALL: [Placeholder; 5] = [
        Placeholder::Name,
        Placeholder::Image,
        Placeholder::Os,
        Placeholder::Uuid,
        Placeholder::MacAddress,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            Self::Name => "{VM_NAME}",
            Self::Image => "{VM_IMAGE}",
            Self::Os => "{VM_OS}",
            Self::Uuid => "{VM_UUID}",
            Self::MacAddress => "{VM_MAC_ADDRESS}",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.token() == token)
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// 模板文档类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    /// 域配置：名称、镜像、系统镜像，三者都必须出现
    Config,
    /// 快照描述：五个占位符都允许，均可缺省
    Snapshot,
}

impl TemplateKind {
    pub fn allowed(&self) -> &'static [Placeholder] {
        match self {
            Self::Config => &[Placeholder::Name, Placeholder::Image, Placeholder::Os],
            Self::Snapshot => &Placeholder::ALL,
        }
    }

    pub fn required(&self) -> &'static [Placeholder] {
        match self {
            Self::Config => &[Placeholder::Name, Placeholder::Image, Placeholder::Os],
            Self::Snapshot => &[],
        }
    }
}

/// 渲染时使用的值
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateValues {
    pub name: String,
    pub image: String,
    pub os: String,
    pub uuid: Option<String>,
    pub mac_address: Option<String>,
}

impl TemplateValues {
    pub fn new(name: impl Into<String>, image: impl Into<String>, os: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            os: os.into(),
            uuid: None,
            mac_address: None,
        }
    }

    /// 补充定义之后才能得到的身份信息
    pub fn with_identity(mut self, uuid: impl Into<String>, mac_address: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self.mac_address = Some(mac_address.into());
        self
    }

    pub fn get(&self, placeholder: Placeholder) -> Option<&str> {
        match placeholder {
            Placeholder::Name => Some(&self.name),
            Placeholder::Image => Some(&self.image),
            Placeholder::Os => Some(&self.os),
            Placeholder::Uuid => self.uuid.as_deref(),
            Placeholder::MacAddress => self.mac_address.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    /// 元素的第 n 个子节点（文本）
    Text(usize),
    /// 元素的属性
    Attribute(String),
}

/// 替换点：从根元素出发的子节点下标路径
#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    path: Vec<usize>,
    target: Target,
    placeholder: Placeholder,
}

/// 已校验的 XML 模板
#[derive(Debug, Clone)]
pub struct XmlTemplate {
    kind: TemplateKind,
    root: Element,
    slots: Vec<Slot>,
}

impl XmlTemplate {
    pub fn parse(kind: TemplateKind, xml: &str) -> Result<Self> {
        Self::new(kind, Element::parse(xml)?)
    }

    /// 扫描并校验替换点
    pub fn new(kind: TemplateKind, root: Element) -> Result<Self> {
        let mut slots = Vec::new();
        let mut path = Vec::new();
        scan(kind, &root, &mut path, &mut slots)?;

        let template = Self { kind, root, slots };
        let present = template.placeholders();
        for required in kind.required() {
            if !present.contains(required) {
                return Err(VmError::Template(format!("缺少必需的占位符 {}", required)));
            }
        }

        Ok(template)
    }

    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    /// 模板中出现的占位符
    pub fn placeholders(&self) -> BTreeSet<Placeholder> {
        self.slots.iter().map(|slot| slot.placeholder).collect()
    }

    /// 在副本上写入全部替换点
    pub fn render(&self, values: &TemplateValues) -> Result<Element> {
        let mut root = self.root.clone();

        for slot in &self.slots {
            let value = values.get(slot.placeholder).ok_or_else(|| {
                VmError::Template(format!("未提供占位符 {} 的值", slot.placeholder))
            })?;

            let element = element_at(&mut root, &slot.path)
                .ok_or_else(|| VmError::Template("替换点路径失效".to_string()))?;
            match &slot.target {
                Target::Text(index) => element.children[*index] = Node::Text(value.to_string()),
                Target::Attribute(name) => element.set_attribute(name, value),
            }
        }

        Ok(root)
    }

    pub fn render_xml(&self, values: &TemplateValues) -> Result<String> {
        self.render(values)?.to_xml()
    }
}

fn element_at<'a>(root: &'a mut Element, path: &[usize]) -> Option<&'a mut Element> {
    let mut current = root;
    for &index in path {
        current = match current.children.get_mut(index)? {
            Node::Element(element) => element,
            _ => return None,
        };
    }
    Some(current)
}

/// 判断一个值是否为替换点；占位符嵌在更长的值里视为错误
fn classify(kind: TemplateKind, value: &str) -> Result<Option<Placeholder>> {
    if let Some(placeholder) = Placeholder::from_token(value) {
        if !kind.allowed().contains(&placeholder) {
            return Err(VmError::Template(format!(
                "{:?} 文档不允许使用占位符 {}",
                kind, placeholder
            )));
        }
        return Ok(Some(placeholder));
    }

    if let Some(embedded) = Placeholder::ALL.iter().find(|p| value.contains(p.token())) {
        return Err(VmError::Template(format!(
            "占位符 {} 必须单独占据整个值: {:?}",
            embedded, value
        )));
    }

    Ok(None)
}

fn scan(kind: TemplateKind, element: &Element, path: &mut Vec<usize>, slots: &mut Vec<Slot>) -> Result<()> {
    for (key, value) in &element.attributes {
        if let Some(placeholder) = classify(kind, value)? {
            slots.push(Slot {
                path: path.clone(),
                target: Target::Attribute(key.clone()),
                placeholder,
            });
        }
    }

    for (index, child) in element.children.iter().enumerate() {
        match child {
            Node::Element(child) => {
                path.push(index);
                scan(kind, child, path, slots)?;
                path.pop();
            }
            Node::Text(text) | Node::CData(text) => {
                if let Some(placeholder) = classify(kind, text)? {
                    slots.push(Slot {
                        path: path.clone(),
                        target: Target::Text(index),
                        placeholder,
                    });
                }
            }
            Node::Comment(_) => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"<domain type="kvm">
  <name>{VM_NAME}</name>
  <devices>
    <disk type="file" device="disk"><source file="{VM_IMAGE}"/></disk>
    <disk type="file" device="cdrom"><source file="{VM_OS}"/></disk>
  </devices>
</domain>"#;

    #[test]
    fn test_config_template_render() {
        let template = XmlTemplate::parse(TemplateKind::Config, CONFIG).unwrap();
        assert_eq!(template.placeholders().len(), 3);

        let values = TemplateValues::new("paper-1.21.4", "/srv/vms/paper-1.21.4.qcow2", "/srv/vmData/os.iso");
        let domain = template.render(&values).unwrap();

        assert_eq!(domain.child("name").unwrap().text(), "paper-1.21.4");
        assert_eq!(
            domain.find("devices/disk[0]/source").unwrap().attribute("file"),
            Some("/srv/vms/paper-1.21.4.qcow2")
        );
        assert_eq!(
            domain.find("devices/disk[1]/source").unwrap().attribute("file"),
            Some("/srv/vmData/os.iso")
        );
    }

    #[test]
    fn test_substituted_values_are_not_rescanned() {
        let template = XmlTemplate::parse(TemplateKind::Config, CONFIG).unwrap();
        // 名称本身恰好是另一个占位符
        let values = TemplateValues::new("{VM_IMAGE}", "/a.qcow2", "/b.iso");
        let domain = template.render(&values).unwrap();

        assert_eq!(domain.child("name").unwrap().text(), "{VM_IMAGE}");
        assert_eq!(
            domain.find("devices/disk[0]/source").unwrap().attribute("file"),
            Some("/a.qcow2")
        );
    }

    #[test]
    fn test_embedded_token_rejected() {
        let xml = r#"<domain><name>vm-{VM_NAME}</name></domain>"#;
        let err = XmlTemplate::parse(TemplateKind::Snapshot, xml).unwrap_err();
        assert!(matches!(err, VmError::Template(_)));
    }

    #[test]
    fn test_disallowed_token_rejected() {
        let xml = CONFIG.replace("<devices>", "<uuid>{VM_UUID}</uuid><devices>");
        assert!(XmlTemplate::parse(TemplateKind::Config, &xml).is_err());
    }

    #[test]
    fn test_missing_required_token_rejected() {
        let xml = CONFIG.replace("{VM_OS}", "/fixed/os.iso");
        assert!(XmlTemplate::parse(TemplateKind::Config, &xml).is_err());
    }

    #[test]
    fn test_snapshot_requires_identity_values() {
        let xml = r#"<domainsnapshot><domain><uuid>{VM_UUID}</uuid></domain></domainsnapshot>"#;
        let template = XmlTemplate::parse(TemplateKind::Snapshot, xml).unwrap();
        let values = TemplateValues::new("a", "b", "c");
        assert!(template.render(&values).is_err());

        let rendered = template
            .render(&values.with_identity("11111111-2222-3333-4444-555555555555", "52:54:00:00:00:01"))
            .unwrap();
        assert_eq!(
            rendered.find("domain/uuid").unwrap().text(),
            "11111111-2222-3333-4444-555555555555"
        );
    }
}
