//! 最小 XML 元素树
//!
//! 基于 quick-xml 的事件流构建，只保留元素、属性、文本和注释，足以完成
//! libvirt 域/快照描述的读取、脱敏和模板替换。

use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::{Result, VmError};

/// 子节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
}

/// XML 元素
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

fn xml_error(e: impl std::fmt::Display) -> VmError {
    VmError::Xml(e.to_string())
}

fn open_element(start: &BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut element = Element::new(name);

    for attribute in start.attributes() {
        let attribute = attribute.map_err(xml_error)?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute.unescape_value().map_err(xml_error)?.into_owned();
        element.attributes.push((key, value));
    }

    Ok(element)
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// 解析文档，返回根元素
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                VmError::Xml(format!("位置 {}: {}", reader.buffer_position(), e))
            })?;

            match event {
                Event::Start(start) => stack.push(open_element(&start)?),
                Event::Empty(start) => {
                    let element = open_element(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => set_root(&mut root, element)?,
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| VmError::Xml("多余的结束标签".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => set_root(&mut root, element)?,
                    }
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(xml_error)?.into_owned();
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Text(text)),
                        None if text.trim().is_empty() => {}
                        None => return Err(VmError::Xml("根元素之外存在文本".to_string())),
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        let data = String::from_utf8_lossy(&data.into_inner()).into_owned();
                        parent.children.push(Node::CData(data));
                    }
                }
                Event::Comment(comment) => {
                    if let Some(parent) = stack.last_mut() {
                        let comment = String::from_utf8_lossy(&comment).into_owned();
                        parent.children.push(Node::Comment(comment));
                    }
                }
                Event::Eof => break,
                // 声明、处理指令、DOCTYPE
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(VmError::Xml("文档未正确结束".to_string()));
        }
        root.ok_or_else(|| VmError::Xml("文档没有根元素".to_string()))
    }

    /// 序列化为字符串（不含 XML 声明）
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new(Vec::new());
        self.write(&mut writer)?;
        String::from_utf8(writer.into_inner()).map_err(xml_error)
    }

    fn write(&self, writer: &mut Writer<Vec<u8>>) -> Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.children.is_empty() {
            return writer.write_event(Event::Empty(start)).map_err(xml_error);
        }

        writer.write_event(Event::Start(start)).map_err(xml_error)?;
        for child in &self.children {
            match child {
                Node::Element(element) => element.write(writer)?,
                Node::Text(text) => writer
                    .write_event(Event::Text(BytesText::new(text)))
                    .map_err(xml_error)?,
                Node::CData(data) => writer
                    .write_event(Event::CData(BytesCData::new(data.as_str())))
                    .map_err(xml_error)?,
                Node::Comment(comment) => writer
                    .write_event(Event::Comment(BytesText::from_escaped(comment.as_str())))
                    .map_err(xml_error)?,
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(xml_error)
    }

    // ========================================================================
    // 属性
    // ========================================================================

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        let index = self.attributes.iter().position(|(key, _)| key == name)?;
        Some(self.attributes.remove(index).1)
    }

    // ========================================================================
    // 子元素
    // ========================================================================

    /// 直接子元素
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn children_named<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a Element> + 'n
    where
        'a: 'n,
    {
        self.elements().filter(move |e| e.name == name)
    }

    /// 返回的引用只借用 `self`，与 `name` 的生命周期无关
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.elements_mut().find(|e| e.name == name)
    }

    pub fn push(&mut self, element: Element) {
        self.children.push(Node::Element(element));
    }

    /// 移除第一个同名子元素
    pub fn remove_child(&mut self, name: &str) -> Option<Element> {
        let index = self
            .children
            .iter()
            .position(|node| matches!(node, Node::Element(e) if e.name == name))?;
        match self.children.remove(index) {
            Node::Element(element) => Some(element),
            _ => None,
        }
    }

    /// 按路径查找后代元素，例如 `devices/disk[1]/source`；不带下标时取第一个
    pub fn find(&self, path: &str) -> Option<&Element> {
        let mut current = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let (name, index) = parse_segment(segment)?;
            current = current.elements().filter(|e| e.name == name).nth(index)?;
        }
        Some(current)
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Element> {
        let mut current = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let (name, index) = parse_segment(segment)?;
            current = current.elements_mut().filter(|e| e.name == name).nth(index)?;
        }
        Some(current)
    }

    // ========================================================================
    // 文本
    // ========================================================================

    /// 直接文本子节点拼接后的内容
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) | Node::CData(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// 用单个文本节点替换全部子节点
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children = vec![Node::Text(text.into())];
    }
}

fn set_root(root: &mut Option<Element>, element: Element) -> Result<()> {
    if root.is_some() {
        return Err(VmError::Xml("文档存在多个根元素".to_string()));
    }
    *root = Some(element);
    Ok(())
}

fn parse_segment(segment: &str) -> Option<(&str, usize)> {
    match segment.split_once('[') {
        Some((name, rest)) => {
            let index = rest.strip_suffix(']')?.parse().ok()?;
            Some((name, index))
        }
        None => Some((segment, 0)),
    }
}
