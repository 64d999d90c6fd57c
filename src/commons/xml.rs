//! Some convenience stuff for handling the legacy XML structures.
//!
//! Peers exchange small documents: a root element with text-only leaves
//! and a few nested containers. These are read into an [`XmlElement`]
//! tree once, and typed decoders elsewhere take it from there.

use std::{fmt, io};
use xml::reader::{EventReader, ParserConfig, XmlEvent};
use xml::writer::{EmitterConfig, XmlEvent as WriterEvent};


//------------ XmlElement ----------------------------------------------------

/// An element with its text content and child elements.
///
/// Attributes and mixed content do not occur in the documents we deal
/// with and are dropped when parsing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct XmlElement {
    name: String,
    text: String,
    children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        XmlElement {
            name: name.into(),
            text: String::new(),
            children: Vec::new(),
        }
    }

    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        XmlElement {
            name: name.into(),
            text: text.into(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn children(&self) -> &[XmlElement] {
        &self.children
    }

    pub fn push(&mut self, child: XmlElement) -> &mut Self {
        self.children.push(child);
        self
    }

    /// Adds a text-only child element.
    pub fn push_text(
        &mut self, name: impl Into<String>, text: impl Into<String>
    ) -> &mut Self {
        self.push(XmlElement::with_text(name, text))
    }

    /// Returns the first child with the given name.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Returns all children with the given name.
    pub fn children_named<'a>(
        &'a self, name: &'a str
    ) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Returns the text of the first child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Returns the text of a required child.
    pub fn req_child_text(&self, name: &str) -> Result<&str, XmlError> {
        self.child_text(name).ok_or_else(|| XmlError::missing(name))
    }

    /// Parses a complete document and returns its root element.
    pub fn parse(source: impl io::Read) -> Result<Self, XmlError> {
        let reader = EventReader::new_with_config(
            source,
            ParserConfig::new()
                .trim_whitespace(true)
                .ignore_comments(true)
                .cdata_to_characters(true),
        );

        let mut stack: Vec<XmlElement> = Vec::new();
        for event in reader {
            match event.map_err(|e| XmlError::Parse(e.to_string()))? {
                XmlEvent::StartElement { name, .. } => {
                    stack.push(XmlElement::new(name.local_name));
                }
                XmlEvent::Characters(chars) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&chars);
                    }
                }
                XmlEvent::EndElement { .. } => {
                    let done = stack.pop().ok_or_else(|| {
                        XmlError::Parse("unbalanced end element".into())
                    })?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => return Ok(done),
                    }
                }
                _ => {}
            }
        }
        Err(XmlError::Parse("document has no root element".into()))
    }

    pub fn parse_str(s: &str) -> Result<Self, XmlError> {
        Self::parse(s.as_bytes())
    }

    /// Serializes this element as a complete document.
    pub fn to_xml_string(&self) -> Result<String, XmlError> {
        let mut buf = Vec::new();
        {
            let mut writer = EmitterConfig::new()
                .perform_indent(false)
                .create_writer(&mut buf);
            self.write_to(&mut writer)?;
        }
        String::from_utf8(buf).map_err(|e| XmlError::Write(e.to_string()))
    }

    fn write_to<W: io::Write>(
        &self, writer: &mut xml::writer::EventWriter<W>
    ) -> Result<(), XmlError> {
        let write_err = |e: xml::writer::Error| XmlError::Write(e.to_string());
        writer
            .write(WriterEvent::start_element(self.name.as_str()))
            .map_err(write_err)?;
        if !self.text.is_empty() {
            writer
                .write(WriterEvent::characters(&self.text))
                .map_err(write_err)?;
        }
        for child in &self.children {
            child.write_to(writer)?;
        }
        writer.write(WriterEvent::end_element()).map_err(write_err)
    }
}


//------------ XmlError ------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum XmlError {
    Parse(String),
    Write(String),
    MissingElement(String),
    InvalidValue { element: String, value: String },
}

impl XmlError {
    pub fn missing(element: &str) -> Self {
        XmlError::MissingElement(element.to_string())
    }

    pub fn invalid(element: &str, value: &str) -> Self {
        XmlError::InvalidValue {
            element: element.to_string(),
            value: value.to_string(),
        }
    }
}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            XmlError::Parse(e) => write!(f, "cannot parse XML: {e}"),
            XmlError::Write(e) => write!(f, "cannot write XML: {e}"),
            XmlError::MissingElement(name) => {
                write!(f, "missing element '{name}'")
            }
            XmlError::InvalidValue { element, value } => {
                write!(f, "invalid value '{value}' in element '{element}'")
            }
        }
    }
}

impl std::error::Error for XmlError {}


//------------ Tests ---------------------------------------------------------
