//! Access to the directory server backing a subsystem.
//!
//! The installer only needs a handful of operations: read, search, add,
//! modify and delete of single entries, plus importing LDIF built on top
//! of those. They are expressed by the [`Directory`] trait so the
//! provisioning logic does not depend on a particular client.
//! Connections are handed out by a [`DirectoryFactory`] and released when
//! dropped.

pub mod ldif;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use serde::{Deserialize, Serialize};

pub use self::memory::{DirectoryOp, MemoryDirectory, MemoryDirectoryPool};


//------------ Directory -----------------------------------------------------

pub trait Directory: Send + Sync {
    /// Reads a single entry, failing with `NoSuchObject` if it is absent.
    fn read(&self, dn: &str) -> Result<Entry, DirectoryError>;

    fn search(
        &self, base: &str, scope: Scope, filter: &Filter
    ) -> Result<Vec<Entry>, DirectoryError>;

    fn add(&self, entry: Entry) -> Result<(), DirectoryError>;

    fn modify(
        &self, dn: &str, mods: &[Modification]
    ) -> Result<(), DirectoryError>;

    /// Deletes a leaf entry.
    fn delete(&self, dn: &str) -> Result<(), DirectoryError>;

    /// Returns whether an entry exists.
    ///
    /// Only `NoSuchObject` counts as absence, every other failure is
    /// returned as is.
    fn exists(&self, dn: &str) -> Result<bool, DirectoryError> {
        match self.read(dn) {
            Ok(_) => Ok(true),
            Err(err) if err.code() == ResultCode::NoSuchObject => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Reads an entry, returning `None` if it does not exist.
    fn read_opt(&self, dn: &str) -> Result<Option<Entry>, DirectoryError> {
        match self.read(dn) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) if err.code() == ResultCode::NoSuchObject => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Deletes an entry and everything below it, deepest entries first.
    fn delete_subtree(&self, dn: &str) -> Result<(), DirectoryError> {
        let mut entries = self.search(dn, Scope::Subtree, &Filter::any())?;
        entries.sort_by_key(|e| std::cmp::Reverse(dn_depth(e.dn())));
        for entry in entries {
            self.delete(entry.dn())?;
        }
        Ok(())
    }
}


//------------ DirectoryFactory ----------------------------------------------

/// Hands out connections to directory servers.
pub trait DirectoryFactory: Send + Sync {
    fn connect(
        &self, info: &LdapConnInfo
    ) -> Result<Box<dyn Directory>, DirectoryError>;
}


//------------ LdapConnInfo --------------------------------------------------

/// Where a directory server lives and how to bind to it.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LdapConnInfo {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    pub bind_dn: String,
    pub bind_password: String,
}

impl LdapConnInfo {
    /// Returns whether two connections point at the same server.
    pub fn same_server(&self, other: &LdapConnInfo) -> bool {
        self.host.eq_ignore_ascii_case(&other.host) && self.port == other.port
    }
}

impl fmt::Debug for LdapConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LdapConnInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("bind_dn", &self.bind_dn)
            .finish()
    }
}

impl fmt::Display for LdapConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = if self.secure { "ldaps" } else { "ldap" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}


//------------ Entry ---------------------------------------------------------

/// A directory entry.
///
/// Attribute names are matched case-insensitively and kept in lower case.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Entry {
    dn: String,
    attrs: BTreeMap<String, Vec<String>>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Entry {
            dn: dn.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Adds a value, builder style.
    pub fn with(mut self, attr: &str, value: impl Into<String>) -> Self {
        self.add_value(attr, value);
        self
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn add_value(&mut self, attr: &str, value: impl Into<String>) {
        let value = value.into();
        let values = self.attrs.entry(attr.to_ascii_lowercase()).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    pub fn set(&mut self, attr: &str, values: Vec<String>) {
        if values.is_empty() {
            self.attrs.remove(&attr.to_ascii_lowercase());
        } else {
            self.attrs.insert(attr.to_ascii_lowercase(), values);
        }
    }

    pub fn remove_attr(&mut self, attr: &str) -> Option<Vec<String>> {
        self.attrs.remove(&attr.to_ascii_lowercase())
    }

    pub fn values(&self, attr: &str) -> &[String] {
        self.attrs
            .get(&attr.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn first(&self, attr: &str) -> Option<&str> {
        self.values(attr).first().map(String::as_str)
    }

    pub fn has_attr(&self, attr: &str) -> bool {
        !self.values(attr).is_empty()
    }

    /// Checks for a value, ignoring case as most directory syntaxes do.
    pub fn has_value(&self, attr: &str, value: &str) -> bool {
        self.values(attr).iter().any(|v| v.eq_ignore_ascii_case(value))
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}


//------------ Modification --------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Modification {
    Add(String, Vec<String>),
    Replace(String, Vec<String>),

    /// Deletes the given values, or the whole attribute if there are none.
    Delete(String, Vec<String>),
}

impl Modification {
    pub fn add(attr: &str, value: impl Into<String>) -> Self {
        Modification::Add(attr.to_string(), vec![value.into()])
    }

    pub fn replace(attr: &str, value: impl Into<String>) -> Self {
        Modification::Replace(attr.to_string(), vec![value.into()])
    }

    pub fn delete_value(attr: &str, value: impl Into<String>) -> Self {
        Modification::Delete(attr.to_string(), vec![value.into()])
    }
}


//------------ Scope ---------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope {
    Base,
    OneLevel,
    Subtree,
}


//------------ Filter --------------------------------------------------------

/// A search filter.
///
/// Supports the subset of RFC 4515 the installer uses: presence, equality
/// (with `*` only as the presence shorthand), and, or and not.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Filter {
    Present(String),
    Equals(String, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Matches every entry.
    pub fn any() -> Self {
        Filter::Present("objectclass".into())
    }

    pub fn eq(attr: &str, value: impl Into<String>) -> Self {
        Filter::Equals(attr.to_string(), value.into())
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::Present(attr) => {
                attr.eq_ignore_ascii_case("objectclass") || entry.has_attr(attr)
            }
            Filter::Equals(attr, value) => entry.has_value(attr, value),
            Filter::And(filters) => filters.iter().all(|f| f.matches(entry)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(entry)),
            Filter::Not(filter) => !filter.matches(entry),
        }
    }

    /// Parses the string representation of a filter.
    pub fn parse(s: &str) -> Result<Self, DirectoryError> {
        let s = s.trim();
        let (filter, rest) = Self::parse_one(s)?;
        if !rest.trim().is_empty() {
            return Err(DirectoryError::filter(s));
        }
        Ok(filter)
    }

    fn parse_one(s: &str) -> Result<(Self, &str), DirectoryError> {
        let inner = s
            .strip_prefix('(')
            .ok_or_else(|| DirectoryError::filter(s))?;
        let first = inner.chars().next().ok_or_else(|| DirectoryError::filter(s))?;
        match first {
            '&' | '|' => {
                let mut rest = &inner[1..];
                let mut parts = Vec::new();
                while rest.starts_with('(') {
                    let (part, remaining) = Self::parse_one(rest)?;
                    parts.push(part);
                    rest = remaining;
                }
                let rest = rest
                    .strip_prefix(')')
                    .ok_or_else(|| DirectoryError::filter(s))?;
                let filter = if first == '&' {
                    Filter::And(parts)
                } else {
                    Filter::Or(parts)
                };
                Ok((filter, rest))
            }
            '!' => {
                let (part, rest) = Self::parse_one(&inner[1..])?;
                let rest = rest
                    .strip_prefix(')')
                    .ok_or_else(|| DirectoryError::filter(s))?;
                Ok((Filter::Not(Box::new(part)), rest))
            }
            _ => {
                let end = inner.find(')').ok_or_else(|| DirectoryError::filter(s))?;
                let (attr, value) = inner[..end]
                    .split_once('=')
                    .ok_or_else(|| DirectoryError::filter(s))?;
                let filter = if value == "*" {
                    Filter::Present(attr.trim().to_string())
                } else {
                    Filter::Equals(attr.trim().to_string(), value.to_string())
                };
                Ok((filter, &inner[end + 1..]))
            }
        }
    }
}


//------------ DN helpers ----------------------------------------------------

/// Returns a DN in canonical form for comparison.
///
/// Lower cases everything and removes spaces around separators. Escaped
/// separators are not taken into account.
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| {
            let rdn = rdn.trim();
            match rdn.split_once('=') {
                Some((attr, value)) => format!(
                    "{}={}",
                    attr.trim().to_ascii_lowercase(),
                    value.trim().to_ascii_lowercase()
                ),
                None => rdn.to_ascii_lowercase(),
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Returns the parent of a DN, if it has one.
pub fn parent_dn(dn: &str) -> Option<&str> {
    dn.split_once(',').map(|(_, parent)| parent.trim_start())
}

/// Returns whether `dn` lies below (or is) `base`.
pub fn is_within(dn: &str, base: &str) -> bool {
    let dn = normalize_dn(dn);
    let base = normalize_dn(base);
    dn == base || dn.ends_with(&format!(",{base}"))
}

/// Returns the number of RDNs in a DN.
pub fn dn_depth(dn: &str) -> usize {
    dn.split(',').count()
}

/// Escapes a value for use in a DN attribute value.
pub fn escape_dn_value(value: &str) -> String {
    let mut res = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') {
            res.push('\\');
        }
        res.push(c);
    }
    res
}


//------------ ResultCode ----------------------------------------------------

/// The LDAP result codes the installer distinguishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResultCode {
    OperationsError,
    NoSuchAttribute,
    TypeOrValueExists,
    NoSuchObject,
    InvalidCredentials,
    Unavailable,
    UnwillingToPerform,
    ObjectClassViolation,
    NotAllowedOnNonLeaf,
    EntryAlreadyExists,
    FilterError,
    Other,
}

impl ResultCode {
    pub fn code(self) -> u32 {
        match self {
            ResultCode::OperationsError => 1,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::TypeOrValueExists => 20,
            ResultCode::NoSuchObject => 32,
            ResultCode::InvalidCredentials => 49,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::ObjectClassViolation => 65,
            ResultCode::NotAllowedOnNonLeaf => 66,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::FilterError => 87,
            ResultCode::Other => 80,
        }
    }
}


//------------ DirectoryError ------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectoryError {
    code: ResultCode,
    msg: String,
}

impl DirectoryError {
    pub fn new(code: ResultCode, msg: impl fmt::Display) -> Self {
        DirectoryError {
            code,
            msg: msg.to_string(),
        }
    }

    pub fn no_such_object(dn: &str) -> Self {
        Self::new(ResultCode::NoSuchObject, format!("no such entry: {dn}"))
    }

    pub fn already_exists(dn: &str) -> Self {
        Self::new(
            ResultCode::EntryAlreadyExists,
            format!("entry already exists: {dn}"),
        )
    }

    pub fn filter(filter: &str) -> Self {
        Self::new(ResultCode::FilterError, format!("bad filter: {filter}"))
    }

    pub fn other(msg: impl fmt::Display) -> Self {
        Self::new(ResultCode::Other, msg)
    }

    pub fn code(&self) -> ResultCode {
        self.code
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (LDAP result {})", self.msg, self.code.code())
    }
}

impl std::error::Error for DirectoryError {}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_and_compare_dns() {
        assert_eq!(
            normalize_dn("CN=Foo, O=Example ,ou=People"),
            "cn=foo,o=example,ou=people"
        );
        assert!(is_within("cn=x,ou=people,o=pki", "O=PKI"));
        assert!(is_within("o=pki", "o=pki"));
        assert!(!is_within("o=pki2", "o=pki"));
        assert_eq!(parent_dn("cn=x, o=pki"), Some("o=pki"));
        assert_eq!(parent_dn("o=pki"), None);
    }

    #[test]
    fn parse_filters() {
        let f = Filter::parse("(&(objectClass=pkiUser)(|(uid=admin)(!(uid=x))))")
            .unwrap();
        let entry = Entry::new("uid=admin,ou=people,o=pki")
            .with("objectClass", "pkiUser")
            .with("uid", "admin");
        assert!(f.matches(&entry));

        assert_eq!(
            Filter::parse("(cn=*)").unwrap(),
            Filter::Present("cn".into())
        );
        assert!(Filter::parse("(cn=x").is_err());
        assert!(Filter::parse("cn=x").is_err());
    }

    #[test]
    fn entry_attributes_are_case_insensitive() {
        let mut entry = Entry::new("cn=x").with("ObjectClass", "top");
        entry.add_value("objectclass", "top");
        entry.add_value("OBJECTCLASS", "person");
        assert_eq!(entry.values("objectClass"), &["top", "person"]);
        assert!(entry.has_value("objectclass", "PERSON"));
    }

    #[test]
    fn escape_values() {
        assert_eq!(escape_dn_value("a,b=c"), "a\\,b\\=c");
    }
}
