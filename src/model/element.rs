use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::model::error::CoreError;

/// Returns the local part of a tag or attribute name, tolerating both
/// Clark-style `{ns}tag` spellings and prefixed `ns:tag` spellings.
pub fn local_name_of(name: &str) -> &str {
    if let Some(idx) = name.rfind('}') {
        return &name[idx + 1..];
    }
    match name.rfind(':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

fn name_matches(candidate: &str, wanted: &str) -> bool {
    candidate == wanted
        || candidate.ends_with(&format!("}}{}", wanted))
        || local_name_of(candidate) == wanted
}

/// A typed XML tree node. Children are kept in document order; repeated
/// sibling tags represent what a dict-based mapping would collapse into a
/// list, so singleton-vs-list ambiguity never arises at this layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: Option<String>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Element {
            name: name.into(),
            ..Element::default()
        }
    }

    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Element {
            name: name.into(),
            text: Some(text.into()),
            ..Element::default()
        }
    }

    pub fn local_name(&self) -> &str {
        local_name_of(&self.name)
    }

    /// Attribute lookup: exact name first, then local-name match. This is
    /// what lets `xsi:type` resolve regardless of the declared prefix.
    pub fn attr(&self, name: &str) -> Option<&str> {
        if let Some((_, v)) = self.attributes.iter().find(|(k, _)| k == name) {
            return Some(v.as_str());
        }
        self.attributes
            .iter()
            .find(|(k, _)| local_name_of(k) == local_name_of(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self.attributes.iter_mut().find(|(k, _)| *k == name) {
            entry.1 = value;
        } else {
            self.attributes.push((name, value));
        }
    }

    /// Local part of the `xsi:type` discriminator, if present.
    pub fn xsi_type(&self) -> Option<&str> {
        self.attr("xsi:type").map(local_name_of)
    }

    /// First child whose tag resolves to `tag`: exact key, then namespaced
    /// `...}tag` suffix, then last `:`-segment. Non-recursive.
    pub fn child(&self, tag: &str) -> Option<&Element> {
        self.children.iter().find(|c| name_matches(&c.name, tag))
    }

    pub fn child_mut(&mut self, tag: &str) -> Option<&mut Element> {
        self.children
            .iter_mut()
            .find(|c| name_matches(&c.name, tag))
    }

    /// All children resolving to `tag`, in document order. The empty vec is
    /// the `None` case, a single entry the singleton case.
    pub fn children_named(&self, tag: &str) -> Vec<&Element> {
        self.children
            .iter()
            .filter(|c| name_matches(&c.name, tag))
            .collect()
    }

    pub fn children_named_mut(&mut self, tag: &str) -> Vec<&mut Element> {
        self.children
            .iter_mut()
            .filter(|c| name_matches(&c.name, tag))
            .collect()
    }

    pub fn child_text(&self, tag: &str) -> Option<&str> {
        self.child(tag).and_then(|c| c.text.as_deref())
    }

    /// Overwrites the first child resolving to `element.name`, or appends
    /// when none exists.
    pub fn set_child(&mut self, element: Element) {
        let tag = local_name_of(&element.name).to_string();
        if let Some(existing) = self.child_mut(&tag) {
            *existing = element;
        } else {
            self.children.push(element);
        }
    }

    pub fn set_child_text(&mut self, tag: &str, text: impl Into<String>) {
        if let Some(existing) = self.child_mut(tag) {
            existing.text = Some(text.into());
            existing.children.clear();
        } else {
            self.children.push(Element::with_text(tag, text));
        }
    }

    /// Returns a mutable handle to the child named `tag`, creating an empty
    /// one when absent.
    pub fn child_or_insert(&mut self, tag: &str) -> &mut Element {
        let index = match self
            .children
            .iter()
            .position(|c| name_matches(&c.name, tag))
        {
            Some(i) => i,
            None => {
                self.children.push(Element::new(tag));
                self.children.len() - 1
            }
        };
        &mut self.children[index]
    }

    pub fn push(&mut self, element: Element) {
        self.children.push(element);
    }

    /// Removes every child resolving to `tag` and returns them in order.
    pub fn remove_children(&mut self, tag: &str) -> Vec<Element> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.children.len());
        for child in self.children.drain(..) {
            if name_matches(&child.name, tag) {
                removed.push(child);
            } else {
                kept.push(child);
            }
        }
        self.children = kept;
        removed
    }

    pub fn remove_child_at(&mut self, index: usize) -> Element {
        self.children.remove(index)
    }

    /// Stable-moves all children resolving to `tag` to the end of the child
    /// list. Some destination schemas require reference tags in trailing
    /// declaration order.
    pub fn move_children_to_end(&mut self, tag: &str) {
        let moved = self.remove_children(tag);
        self.children.extend(moved);
    }

    /// Reorders direct children so tags listed in `order` come first, in the
    /// given order; unlisted children keep their relative order at the end.
    pub fn reorder_children(&mut self, order: &[&str]) {
        let mut front = Vec::new();
        for tag in order {
            front.extend(self.remove_children(tag));
        }
        front.append(&mut self.children);
        self.children = front;
    }

    pub fn parse(xml: &str) -> Result<Element, CoreError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    stack.push(element_from_start(&start)?);
                }
                Ok(Event::Empty(start)) => {
                    let element = element_from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| CoreError::validation("unbalanced XML end tag"))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(text)) => {
                    let value = text
                        .unescape()
                        .map_err(|e| CoreError::validation(format!("invalid XML text: {}", e)))?;
                    append_text(&mut stack, &value);
                }
                Ok(Event::CData(data)) => {
                    let value = String::from_utf8_lossy(&data).into_owned();
                    append_text(&mut stack, &value);
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(CoreError::validation(format!("invalid XML: {}", e)));
                }
            }
        }

        if !stack.is_empty() {
            return Err(CoreError::validation("unterminated XML element"));
        }
        root.ok_or_else(|| CoreError::validation("empty XML document"))
    }

    pub fn to_xml(&self) -> String {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        // Writing into a Vec cannot fail.
        let _ = self.write_into(&mut writer);
        String::from_utf8_lossy(&writer.into_inner()).into_owned()
    }

    fn write_into(&self, writer: &mut Writer<Vec<u8>>) -> quick_xml::Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.children.is_empty() && self.text.is_none() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }

        writer.write_event(Event::Start(start))?;
        if let Some(text) = &self.text {
            writer.write_event(Event::Text(BytesText::new(text)))?;
        }
        for child in &self.children {
            child.write_into(writer)?;
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        Ok(())
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, CoreError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut element = Element::new(name);
    for attr in start.attributes() {
        let attr =
            attr.map_err(|e| CoreError::validation(format!("invalid XML attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| CoreError::validation(format!("invalid XML attribute: {}", e)))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(
    stack: &mut Vec<Element>,
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), CoreError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            Ok(())
        }
        None => {
            if root.is_some() {
                return Err(CoreError::validation("multiple root elements"));
            }
            *root = Some(element);
            Ok(())
        }
    }
}

fn append_text(stack: &mut [Element], value: &str) {
    if value.trim().is_empty() {
        return;
    }
    if let Some(top) = stack.last_mut() {
        match &mut top.text {
            Some(existing) => existing.push_str(value),
            None => top.text = Some(value.to_string()),
        }
    }
}
