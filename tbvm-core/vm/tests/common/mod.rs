//! 测试用的内存 Hypervisor
//!
//! 定义域时分配 uuid/MAC；重新定义快照时校验父快照已存在且 uuid 与域一致；
//! 每个域内嵌一个 FakeGuest 作为 Guest Agent 通道，只有运行且未暂停时可达。

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tbvm_transport::fake::{FakeGuest, FakeProgram};
use tbvm_transport::{
    GuestChannel, Hypervisor, HypervisorError, ManagedDomain, ManagedSnapshot, NetworkInterface,
    Result, SnapshotCreateMode, SnapshotOrder,
};
use tbvm_vm::{Element, Snapshot, VmExporter};

type Registry = Rc<RefCell<HashMap<String, Rc<DomainState>>>>;

#[derive(Debug, Clone)]
struct SnapshotRecord {
    name: String,
    parent: Option<String>,
    xml: String,
}

pub struct DomainState {
    name: String,
    xml: String,
    active: Cell<bool>,
    paused: Cell<bool>,
    snapshots: RefCell<Vec<SnapshotRecord>>,
    current: RefCell<Option<String>>,
    reverts: RefCell<Vec<String>>,
    interfaces: RefCell<Vec<NetworkInterface>>,
    guest: FakeGuest,
    registry: Registry,
}

#[derive(Clone)]
pub struct FakeDomain(Rc<DomainState>);

pub struct FakeSnapshot {
    domain: Rc<DomainState>,
    name: String,
}

#[derive(Default)]
pub struct FakeHypervisor {
    domains: Registry,
    defined: Cell<u32>,
    programs: RefCell<Vec<(String, FakeProgram)>>,
}

fn invalid(message: impl Into<String>) -> HypervisorError {
    HypervisorError::OperationInvalid(message.into())
}

fn xml_error(e: impl std::fmt::Display) -> HypervisorError {
    HypervisorError::Libvirt(format!("XML error: {}", e))
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后定义的每个域的 Guest 中都预置此程序
    pub fn add_program(&self, path: &str, program: FakeProgram) {
        self.programs.borrow_mut().push((path.to_string(), program));
    }

    pub fn domain_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.domains.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn domain(&self, name: &str) -> FakeDomain {
        FakeDomain(self.domains.borrow()[name].clone())
    }
}

impl Hypervisor for FakeHypervisor {
    type Domain = FakeDomain;

    fn define_domain(&self, xml: &str) -> Result<FakeDomain> {
        if xml.contains("{VM_") {
            return Err(xml_error("unrendered placeholder"));
        }
        let mut root = Element::parse(xml).map_err(xml_error)?;
        let name = root
            .child("name")
            .map(Element::text)
            .ok_or_else(|| xml_error("missing name"))?;
        if self.domains.borrow().contains_key(&name) {
            return Err(invalid(format!("domain '{}' already exists", name)));
        }

        let serial = self.defined.get() + 1;
        self.defined.set(serial);

        if root.child("uuid").is_none() {
            let mut uuid = Element::new("uuid");
            uuid.set_text(format!("00000000-0000-4000-8000-{:012}", serial));
            root.push(uuid);
        }
        let interface = root
            .find_mut("devices/interface")
            .ok_or_else(|| xml_error("missing interface"))?;
        if interface.child("mac").is_none() {
            let mut mac = Element::new("mac");
            mac.set_attribute("address", format!("52:54:00:00:00:{:02x}", serial));
            interface.push(mac);
        }

        let guest = FakeGuest::new();
        for (path, program) in self.programs.borrow().iter() {
            guest.add_program(path, program.clone());
        }

        let state = Rc::new(DomainState {
            name: name.clone(),
            xml: root.to_xml().map_err(xml_error)?,
            active: Cell::new(false),
            paused: Cell::new(false),
            snapshots: RefCell::new(Vec::new()),
            current: RefCell::new(None),
            reverts: RefCell::new(Vec::new()),
            interfaces: RefCell::new(Vec::new()),
            guest,
            registry: self.domains.clone(),
        });
        self.domains.borrow_mut().insert(name, state.clone());
        Ok(FakeDomain(state))
    }

    fn lookup_domain(&self, name: &str) -> Result<FakeDomain> {
        self.domains
            .borrow()
            .get(name)
            .cloned()
            .map(FakeDomain)
            .ok_or_else(|| HypervisorError::NotFound(format!("no domain with matching name '{}'", name)))
    }
}

impl FakeDomain {
    pub fn guest(&self) -> &FakeGuest {
        &self.0.guest
    }

    pub fn uuid(&self) -> String {
        Element::parse(&self.0.xml).unwrap().child("uuid").unwrap().text()
    }

    pub fn mac_address(&self) -> String {
        Element::parse(&self.0.xml)
            .unwrap()
            .find("devices/interface/mac")
            .unwrap()
            .attribute("address")
            .unwrap()
            .to_string()
    }

    pub fn is_paused(&self) -> bool {
        self.0.paused.get()
    }

    pub fn set_interfaces(&self, interfaces: Vec<NetworkInterface>) {
        *self.0.interfaces.borrow_mut() = interfaces;
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.0.snapshots.borrow().iter().map(|s| s.name.clone()).collect()
    }

    pub fn snapshot_parent(&self, name: &str) -> Option<String> {
        self.0
            .snapshots
            .borrow()
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.parent.clone())
    }

    pub fn snapshot_xml(&self, name: &str) -> String {
        self.0
            .snapshots
            .borrow()
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.xml.clone())
            .unwrap()
    }

    pub fn reverts(&self) -> Vec<String> {
        self.0.reverts.borrow().clone()
    }

    fn snapshot(&self, name: String) -> FakeSnapshot {
        FakeSnapshot {
            domain: self.0.clone(),
            name,
        }
    }

    fn require_active(&self) -> Result<()> {
        if self.0.active.get() {
            Ok(())
        } else {
            Err(invalid("domain is not running"))
        }
    }
}

impl GuestChannel for FakeDomain {
    fn agent_command(&self, command: &str) -> Result<String> {
        if !self.0.active.get() || self.0.paused.get() {
            return Err(HypervisorError::AgentUnresponsive(
                "Guest agent is not responding".to_string(),
            ));
        }
        self.0.guest.agent_command(command)
    }
}

impl ManagedDomain for FakeDomain {
    type Snapshot = FakeSnapshot;

    fn name(&self) -> Result<String> {
        Ok(self.0.name.clone())
    }

    fn is_active(&self) -> Result<bool> {
        Ok(self.0.active.get())
    }

    fn start(&self) -> Result<()> {
        if self.0.active.get() {
            return Err(invalid("domain is already running"));
        }
        self.0.active.set(true);
        self.0.paused.set(false);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.require_active()?;
        self.0.active.set(false);
        self.0.paused.set(false);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.require_active()?;
        self.0.paused.set(false);
        Ok(())
    }

    fn suspend(&self) -> Result<()> {
        self.require_active()?;
        self.0.paused.set(true);
        Ok(())
    }

    fn undefine(&self) -> Result<()> {
        if !self.0.snapshots.borrow().is_empty() {
            return Err(invalid("cannot delete domain with snapshots"));
        }
        self.0.registry.borrow_mut().remove(&self.0.name);
        Ok(())
    }

    fn xml_desc(&self) -> Result<String> {
        Ok(self.0.xml.clone())
    }

    fn create_snapshot_xml(&self, xml: &str, mode: SnapshotCreateMode) -> Result<FakeSnapshot> {
        if xml.contains("{VM_") {
            return Err(xml_error("unrendered placeholder"));
        }
        let mut root = Element::parse(xml).map_err(xml_error)?;
        let name = root
            .child("name")
            .map(Element::text)
            .ok_or_else(|| xml_error("missing snapshot name"))?;
        if self.0.snapshots.borrow().iter().any(|s| s.name == name) {
            return Err(invalid(format!("snapshot '{}' already exists", name)));
        }

        let parent = match mode {
            SnapshotCreateMode::Capture => {
                let parent = self.0.current.borrow().clone();
                if let Some(parent_name) = &parent {
                    let mut parent_element = Element::new("parent");
                    let mut name_element = Element::new("name");
                    name_element.set_text(parent_name.as_str());
                    parent_element.push(name_element);
                    root.push(parent_element);
                }
                root.push(Element::parse(&self.0.xml).map_err(xml_error)?);
                parent
            }
            SnapshotCreateMode::Redefine => {
                if root.child("domain").is_none() {
                    return Err(xml_error("redefined snapshot needs a domain"));
                }
                for nested in ["domain", "inactiveDomain"] {
                    let Some(definition) = root.child(nested) else {
                        continue;
                    };
                    let uuid = definition.child("uuid").map(Element::text);
                    if uuid.as_deref() != Some(self.uuid().as_str()) {
                        return Err(invalid(format!(
                            "definition for snapshot {} must use uuid {}",
                            name,
                            self.uuid()
                        )));
                    }
                    let mac = definition
                        .find("devices/interface/mac")
                        .and_then(|m| m.attribute("address"));
                    if mac != Some(self.mac_address().as_str()) {
                        return Err(invalid(format!(
                            "definition for snapshot {} must use mac {}",
                            name,
                            self.mac_address()
                        )));
                    }
                }
                let parent = root.find("parent/name").map(Element::text);
                if let Some(parent_name) = &parent {
                    if !self.0.snapshots.borrow().iter().any(|s| &s.name == parent_name) {
                        return Err(invalid(format!("parent snapshot '{}' not found", parent_name)));
                    }
                }
                parent
            }
        };

        self.0.snapshots.borrow_mut().push(SnapshotRecord {
            name: name.clone(),
            parent,
            xml: root.to_xml().map_err(xml_error)?,
        });
        *self.0.current.borrow_mut() = Some(name.clone());
        Ok(self.snapshot(name))
    }

    fn lookup_snapshot(&self, name: &str) -> Result<FakeSnapshot> {
        if self.0.snapshots.borrow().iter().any(|s| s.name == name) {
            Ok(self.snapshot(name.to_string()))
        } else {
            Err(HypervisorError::NotFound(format!(
                "no domain snapshot with matching name '{}'",
                name
            )))
        }
    }

    fn list_snapshots(&self, order: SnapshotOrder) -> Result<Vec<FakeSnapshot>> {
        let records = self.0.snapshots.borrow().clone();
        let names: Vec<String> = match order {
            // 默认顺序故意与创建顺序相反
            SnapshotOrder::Any => records.iter().rev().map(|s| s.name.clone()).collect(),
            SnapshotOrder::Topological => {
                let mut emitted: Vec<String> = Vec::new();
                let mut pending = records;
                while !pending.is_empty() {
                    let (ready, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|s| {
                        s.parent.as_ref().map_or(true, |p| emitted.contains(p))
                    });
                    if ready.is_empty() {
                        return Err(invalid("snapshot graph has a cycle"));
                    }
                    emitted.extend(ready.into_iter().map(|s| s.name));
                    pending = rest;
                }
                emitted
            }
        };
        Ok(names.into_iter().map(|name| self.snapshot(name)).collect())
    }

    fn interface_addresses(&self) -> Result<Vec<NetworkInterface>> {
        if !self.0.active.get() || self.0.paused.get() {
            return Err(HypervisorError::AgentUnresponsive(
                "Guest agent is not responding".to_string(),
            ));
        }
        Ok(self.0.interfaces.borrow().clone())
    }
}

impl ManagedSnapshot for FakeSnapshot {
    fn name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    fn xml_desc(&self) -> Result<String> {
        self.domain
            .snapshots
            .borrow()
            .iter()
            .find(|s| s.name == self.name)
            .map(|s| s.xml.clone())
            .ok_or_else(|| HypervisorError::NotFound(self.name.clone()))
    }

    fn revert(&self) -> Result<()> {
        self.xml_desc()?;
        self.domain.active.set(true);
        self.domain.paused.set(true);
        *self.domain.current.borrow_mut() = Some(self.name.clone());
        self.domain.reverts.borrow_mut().push(self.name.clone());
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        let mut snapshots = self.domain.snapshots.borrow_mut();
        let index = snapshots
            .iter()
            .position(|s| s.name == self.name)
            .ok_or_else(|| HypervisorError::NotFound(self.name.clone()))?;
        let removed = snapshots.remove(index);
        for child in snapshots.iter_mut() {
            if child.parent.as_deref() == Some(removed.name.as_str()) {
                child.parent = removed.parent.clone();
            }
        }
        let mut current = self.domain.current.borrow_mut();
        if current.as_deref() == Some(removed.name.as_str()) {
            *current = removed.parent;
        }
        Ok(())
    }
}

// ============================================================================
// 模板准备
// ============================================================================

pub const TEMPLATE_NAME: &str = "template";

pub fn template_domain_xml(image: &Path, os: &Path) -> String {
    format!(
        r#"<domain type="kvm" id="3">
  <name>{name}</name>
  <uuid>6a1f3c4e-1111-4000-8000-00000000abcd</uuid>
  <memory unit="KiB">2097152</memory>
  <devices>
    <disk type="file" device="disk"><driver name="qemu" type="qcow2"/><source file="{image}"/><target dev="vda"/></disk>
    <disk type="file" device="cdrom"><source file="{os}"/><target dev="sda"/></disk>
    <interface type="network"><mac address="52:54:00:12:34:56"/><source network="default"/></interface>
  </devices>
</domain>"#,
        name = TEMPLATE_NAME,
        image = image.display(),
        os = os.display()
    )
}

/// 在 `source_dir` 中准备镜像，定义模板域并依次捕获快照，导出为模板包
pub fn export_template(source_dir: &Path, states: &[Snapshot]) -> PathBuf {
    let image = source_dir.join("template.qcow2");
    let os = source_dir.join("debian.iso");
    fs::write(&image, b"template disk").unwrap();
    fs::write(&os, b"installer").unwrap();

    let hypervisor = FakeHypervisor::new();
    let domain = hypervisor
        .define_domain(&template_domain_xml(&image, &os))
        .unwrap();
    domain.start().unwrap();
    for state in states {
        let mut xml = Element::new("domainsnapshot");
        let mut name = Element::new("name");
        name.set_text(state.name());
        xml.push(name);
        domain
            .create_snapshot_xml(&xml.to_xml().unwrap(), SnapshotCreateMode::Capture)
            .unwrap();
    }

    let bundle = source_dir.join("template.tar");
    VmExporter::new(&domain).export(&bundle).unwrap();
    bundle
}

/// 成功退出并输出 `stdout` 的程序
pub fn ok_program(stdout: &str) -> FakeProgram {
    FakeProgram {
        stdout: stdout.to_string(),
        ..Default::default()
    }
}
