//! LDIF templates and their import.
//!
//! Templates shipped in `defaults/ldif` contain `{name}` placeholders that
//! are filled in per instance before the LDIF is parsed and applied.

use std::fmt;
use std::path::Path;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, warn};
use crate::commons::file;
use super::{Directory, DirectoryError, Entry, Modification, ResultCode};


//------------ LdifParams ----------------------------------------------------

/// Values for the placeholders of LDIF templates.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LdifParams {
    pub instance_id: String,
    pub root_suffix: String,
    pub database: String,
    pub dbuser: String,
}

impl LdifParams {
    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "instanceId" => Some(&self.instance_id),
            "rootSuffix" => Some(&self.root_suffix),
            "database" => Some(&self.database),
            "dbuser" => Some(&self.dbuser),
            _ => None,
        }
    }

    /// Replaces all `{name}` placeholders.
    ///
    /// Unknown names are replaced by nothing. An opening brace without a
    /// closing one is copied as is, together with the rest of the text.
    pub fn substitute(&self, template: &str) -> String {
        let mut res = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            res.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match self.lookup(name) {
                        Some(value) => res.push_str(value),
                        None => debug!("Dropping unknown LDIF token '{{{name}}}'"),
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    res.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        res.push_str(rest);
        res
    }
}


//------------ LdifBundle ----------------------------------------------------

/// The LDIF templates used when provisioning a database.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LdifBundle {
    Schema,
    Core,
    Seed,
    Index,
    Vlv,
    VlvTasks,
    Reindex,
}

impl LdifBundle {
    pub fn file_name(self) -> &'static str {
        match self {
            LdifBundle::Schema => "schema.ldif",
            LdifBundle::Core => "core.ldif",
            LdifBundle::Seed => "seed.ldif",
            LdifBundle::Index => "index.ldif",
            LdifBundle::Vlv => "vlv.ldif",
            LdifBundle::VlvTasks => "vlvtasks.ldif",
            LdifBundle::Reindex => "reindex.ldif",
        }
    }

    fn builtin(self) -> &'static str {
        match self {
            LdifBundle::Schema => include_str!("../../defaults/ldif/schema.ldif"),
            LdifBundle::Core => include_str!("../../defaults/ldif/core.ldif"),
            LdifBundle::Seed => include_str!("../../defaults/ldif/seed.ldif"),
            LdifBundle::Index => include_str!("../../defaults/ldif/index.ldif"),
            LdifBundle::Vlv => include_str!("../../defaults/ldif/vlv.ldif"),
            LdifBundle::VlvTasks => include_str!("../../defaults/ldif/vlvtasks.ldif"),
            LdifBundle::Reindex => include_str!("../../defaults/ldif/reindex.ldif"),
        }
    }

    /// Returns the template, from `dir` if it has one, else the builtin.
    pub fn template(self, dir: Option<&Path>) -> Result<String, DirectoryError> {
        if let Some(dir) = dir {
            let path = dir.join(self.file_name());
            if path.exists() {
                return file::read_to_string(&path).map_err(DirectoryError::other);
            }
        }
        Ok(self.builtin().to_string())
    }
}

impl fmt::Display for LdifBundle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.file_name())
    }
}


//------------ LdifRecord ----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LdifRecord {
    Add(Entry),
    Modify { dn: String, mods: Vec<Modification> },
    Delete(String),
}

impl LdifRecord {
    pub fn dn(&self) -> &str {
        match self {
            LdifRecord::Add(entry) => entry.dn(),
            LdifRecord::Modify { dn, .. } => dn,
            LdifRecord::Delete(dn) => dn,
        }
    }
}

/// Parses LDIF content into records.
pub fn parse(content: &str) -> Result<Vec<LdifRecord>, DirectoryError> {
    let mut records = Vec::new();
    for block in blocks(content) {
        if let Some(record) = parse_record(&block)? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Splits content into blocks of unfolded lines, one per record.
fn blocks(content: &str) -> Vec<Vec<String>> {
    let mut res = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            if !current.is_empty() {
                res.push(std::mem::take(&mut current));
            }
        } else if line.starts_with('#') {
            continue;
        } else if let Some(cont) = line.strip_prefix(' ') {
            if let Some(last) = current.last_mut() {
                last.push_str(cont);
            }
        } else {
            current.push(line.to_string());
        }
    }
    if !current.is_empty() {
        res.push(current);
    }
    res
}

fn split_line(line: &str) -> Result<(String, String), DirectoryError> {
    let (attr, rest) = line
        .split_once(':')
        .ok_or_else(|| DirectoryError::other(format!("bad LDIF line: {line}")))?;
    let value = if let Some(encoded) = rest.strip_prefix(':') {
        let bytes = BASE64.decode(encoded.trim()).map_err(|e| {
            DirectoryError::other(format!("bad base64 value for {attr}: {e}"))
        })?;
        String::from_utf8(bytes).map_err(|e| {
            DirectoryError::other(format!("non UTF-8 value for {attr}: {e}"))
        })?
    } else {
        rest.trim_start().to_string()
    };
    Ok((attr.trim().to_string(), value))
}

fn parse_record(lines: &[String]) -> Result<Option<LdifRecord>, DirectoryError> {
    let mut iter = lines.iter().map(|l| split_line(l)).peekable();

    let (attr, dn) = match iter.next() {
        Some(first) => first?,
        None => return Ok(None),
    };
    if attr.eq_ignore_ascii_case("version") {
        // A leading version line may share the block with the first record.
        let rest: Vec<String> = lines[1..].to_vec();
        return parse_record(&rest);
    }
    if !attr.eq_ignore_ascii_case("dn") {
        return Err(DirectoryError::other(format!(
            "LDIF record does not start with dn: {attr}"
        )));
    }

    let mut changetype = "add".to_string();
    if let Some(Ok((attr, value))) = iter.peek() {
        if attr.eq_ignore_ascii_case("changetype") {
            changetype = value.to_ascii_lowercase();
            iter.next();
        }
    }

    match changetype.as_str() {
        "add" => {
            let mut entry = Entry::new(dn);
            for item in iter {
                let (attr, value) = item?;
                entry.add_value(&attr, value);
            }
            Ok(Some(LdifRecord::Add(entry)))
        }
        "delete" => Ok(Some(LdifRecord::Delete(dn))),
        "modify" => {
            let mut mods = Vec::new();
            let mut current: Option<(String, String, Vec<String>)> = None;
            for line in &lines[2..] {
                if line.trim() == "-" {
                    if let Some(m) = current.take() {
                        mods.push(to_modification(m)?);
                    }
                    continue;
                }
                let (attr, value) = split_line(line)?;
                match &mut current {
                    None => current = Some((attr.to_ascii_lowercase(), value, Vec::new())),
                    Some((_, target, values)) => {
                        if !attr.eq_ignore_ascii_case(target) {
                            return Err(DirectoryError::other(format!(
                                "unexpected attribute {attr} in change of {target}"
                            )));
                        }
                        values.push(value);
                    }
                }
            }
            if let Some(m) = current.take() {
                mods.push(to_modification(m)?);
            }
            Ok(Some(LdifRecord::Modify { dn, mods }))
        }
        other => Err(DirectoryError::other(format!(
            "unsupported changetype '{other}' for {dn}"
        ))),
    }
}

fn to_modification(
    (op, attr, values): (String, String, Vec<String>)
) -> Result<Modification, DirectoryError> {
    match op.as_str() {
        "add" => Ok(Modification::Add(attr, values)),
        "replace" => Ok(Modification::Replace(attr, values)),
        "delete" => Ok(Modification::Delete(attr, values)),
        _ => Err(DirectoryError::other(format!(
            "unsupported modify operation '{op}'"
        ))),
    }
}


//------------ Import --------------------------------------------------------

/// The outcome of importing LDIF.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImportReport {
    pub applied: usize,

    /// Records skipped because their change was already present.
    pub skipped: usize,

    pub errors: Vec<String>,
}

/// Applies LDIF to a directory.
///
/// Adding an entry that exists, or a value that is present, is not an
/// error so an interrupted import can simply be repeated. Other failures
/// are collected. With `suppress` they are logged and the report is
/// returned, otherwise the import fails after all records were tried.
pub fn import(
    dir: &dyn Directory,
    name: &str,
    content: &str,
    suppress: bool,
) -> Result<ImportReport, DirectoryError> {
    let mut report = ImportReport::default();
    for record in parse(content)? {
        let res = match &record {
            LdifRecord::Add(entry) => dir.add(entry.clone()),
            LdifRecord::Modify { dn, mods } => dir.modify(dn, mods),
            LdifRecord::Delete(dn) => dir.delete(dn),
        };
        match res {
            Ok(()) => report.applied += 1,
            Err(err)
                if matches!(
                    err.code(),
                    ResultCode::EntryAlreadyExists | ResultCode::TypeOrValueExists
                ) =>
            {
                debug!("{name}: {} already applied", record.dn());
                report.skipped += 1;
            }
            Err(err) => {
                report.errors.push(format!("{}: {}", record.dn(), err));
            }
        }
    }

    if report.errors.is_empty() {
        debug!(
            "Imported {name}: {} applied, {} skipped",
            report.applied, report.skipped
        );
        Ok(report)
    } else if suppress {
        for err in &report.errors {
            warn!("Ignoring error importing {name}: {err}");
        }
        Ok(report)
    } else {
        Err(DirectoryError::other(format!(
            "errors importing {name}: {}",
            report.errors.join("; ")
        )))
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;

    fn params() -> LdifParams {
        LdifParams {
            instance_id: "pki-tomcat".into(),
            root_suffix: "o=pki-tomcat-CA".into(),
            database: "ca".into(),
            dbuser: "uid=pkidbuser,ou=people,o=pki-tomcat-CA".into(),
        }
    }

    #[test]
    fn substitute_known_unknown_and_unterminated() {
        let p = params();
        assert_eq!(
            p.substitute("dn: cn={database},{rootSuffix}"),
            "dn: cn=ca,o=pki-tomcat-CA"
        );
        assert_eq!(p.substitute("a{unknown}b"), "ab");
        assert_eq!(p.substitute("x {instanceId"), "x {instanceId");
        assert_eq!(p.substitute("no tokens"), "no tokens");
    }

    #[test]
    fn parse_add_modify_delete() {
        let ldif = "version: 1\n\
            dn: ou=people,o=pki\n\
            objectClass: top\n\
            objectClass: organizationalUnit\n\
            description:: aGVsbG8gd29y\n \
            bGQ=\n\
            \n\
            # comment\n\
            dn: cn=config\n\
            changetype: modify\n\
            add: nsslapd-x\n\
            nsslapd-x: 1\n\
            -\n\
            replace: nsslapd-y\n\
            nsslapd-y: 2\n\
            \n\
            dn: cn=old,o=pki\n\
            changetype: delete\n";

        let records = parse(ldif).unwrap();
        assert_eq!(records.len(), 3);
        match &records[0] {
            LdifRecord::Add(entry) => {
                assert_eq!(entry.dn(), "ou=people,o=pki");
                assert_eq!(entry.values("objectclass").len(), 2);
                assert_eq!(entry.first("description"), Some("hello world"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            records[1],
            LdifRecord::Modify {
                dn: "cn=config".into(),
                mods: vec![
                    Modification::Add("nsslapd-x".into(), vec!["1".into()]),
                    Modification::Replace("nsslapd-y".into(), vec!["2".into()]),
                ],
            }
        );
        assert_eq!(records[2], LdifRecord::Delete("cn=old,o=pki".into()));
    }

    #[test]
    fn import_is_repeatable_and_collects_errors() {
        let dir = MemoryDirectory::new();
        let ldif = "dn: o=pki\nobjectClass: top\n\n\
                    dn: ou=people,o=pki\nobjectClass: top\n";
        let first = import(&dir, "core", ldif, false).unwrap();
        assert_eq!(first.applied, 2);
        let second = import(&dir, "core", ldif, false).unwrap();
        assert_eq!(second.skipped, 2);

        let broken = "dn: cn=x,o=pki\ndescription: no class\n";
        assert!(import(&dir, "broken", broken, false).is_err());
        let report = import(&dir, "broken", broken, true).unwrap();
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn builtin_templates_parse() {
        let p = params();
        for bundle in [
            LdifBundle::Schema,
            LdifBundle::Core,
            LdifBundle::Seed,
            LdifBundle::Index,
            LdifBundle::Vlv,
            LdifBundle::VlvTasks,
            LdifBundle::Reindex,
        ] {
            let content = p.substitute(&bundle.template(None).unwrap());
            assert!(!parse(&content).unwrap().is_empty(), "{bundle}");
        }
    }
}
