//! Users and groups of a subsystem instance.

use log::{debug, info};
use crate::commons::error::Error;
use crate::commons::{SetupEmptyResult, SetupResult};
use crate::crypto::{base64_encode, softtoken};
use crate::directory::{
    escape_dn_value, Directory, Entry, Filter, Modification, ResultCode, Scope,
};


//------------ UserGroupSubsystem --------------------------------------------

pub trait UserGroupSubsystem: Send + Sync {
    /// Creates a user, failing with a conflict if the user exists.
    fn create_user(&self, user: &User) -> SetupEmptyResult;

    fn user_exists(&self, uid: &str) -> SetupResult<bool>;

    /// Adds a DER encoded certificate to a user.
    fn add_cert(&self, uid: &str, cert: &[u8]) -> SetupEmptyResult;

    /// Adds a user to a group. Adding an existing member is no error.
    fn add_to_group(&self, uid: &str, group: &str) -> SetupEmptyResult;

    fn is_member(&self, uid: &str, group: &str) -> SetupResult<bool>;

    /// Checks the password of a user.
    fn authenticate(&self, uid: &str, password: &str) -> SetupResult<bool>;
}


//------------ User ----------------------------------------------------------

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct User {
    pub uid: String,
    pub full_name: String,
    pub email: Option<String>,
    pub password: Option<String>,

    /// `adminType` for administrators, `agentType` for subsystem users.
    pub user_type: Option<String>,
    pub state: Option<String>,
}

impl User {
    pub fn new(uid: &str, full_name: &str) -> Self {
        User {
            uid: uid.to_string(),
            full_name: full_name.to_string(),
            ..Default::default()
        }
    }
}


//------------ DirectoryUserStore --------------------------------------------

/// Keeps users below `ou=people` and groups below `ou=groups`.
pub struct DirectoryUserStore {
    dir: Box<dyn Directory>,
    base_dn: String,
}

impl DirectoryUserStore {
    pub fn new(dir: Box<dyn Directory>, base_dn: &str) -> Self {
        DirectoryUserStore {
            dir,
            base_dn: base_dn.to_string(),
        }
    }

    fn user_dn(&self, uid: &str) -> String {
        format!("uid={},ou=people,{}", escape_dn_value(uid), self.base_dn)
    }

    fn group_dn(&self, group: &str) -> String {
        format!("cn={},ou=groups,{}", escape_dn_value(group), self.base_dn)
    }
}

impl UserGroupSubsystem for DirectoryUserStore {
    fn create_user(&self, user: &User) -> SetupEmptyResult {
        let mut entry = Entry::new(self.user_dn(&user.uid))
            .with("objectClass", "top")
            .with("objectClass", "person")
            .with("objectClass", "organizationalPerson")
            .with("objectClass", "inetOrgPerson")
            .with("objectClass", "cmsuser")
            .with("uid", &user.uid)
            .with("cn", &user.full_name)
            .with("sn", &user.full_name);
        if let Some(email) = &user.email {
            entry.add_value("mail", email);
        }
        if let Some(password) = &user.password {
            entry.add_value("userPassword", password);
        }
        if let Some(user_type) = &user.user_type {
            entry.add_value("usertype", user_type);
        }
        entry.add_value("userstate", user.state.as_deref().unwrap_or("1"));

        match self.dir.add(entry) {
            Ok(()) => {
                info!("Created user '{}'", user.uid);
                Ok(())
            }
            Err(err) if err.code() == ResultCode::EntryAlreadyExists => {
                Err(Error::already_exists(format!("User '{}'", user.uid)))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn user_exists(&self, uid: &str) -> SetupResult<bool> {
        Ok(self.dir.exists(&self.user_dn(uid))?)
    }

    fn add_cert(&self, uid: &str, cert: &[u8]) -> SetupEmptyResult {
        let subject = softtoken::subject_dn(cert)?;
        let mods = [
            Modification::add("userCertificate", base64_encode(cert)),
            Modification::add("description", format!("2;{subject}")),
        ];
        match self.dir.modify(&self.user_dn(uid), &mods) {
            Ok(()) => Ok(()),
            Err(err) if err.code() == ResultCode::TypeOrValueExists => {
                debug!("User '{uid}' already has certificate '{subject}'");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn add_to_group(&self, uid: &str, group: &str) -> SetupEmptyResult {
        let member = self.user_dn(uid);
        let res = self.dir.modify(
            &self.group_dn(group),
            &[Modification::add("uniqueMember", member)],
        );
        match res {
            Ok(()) => {
                info!("Added '{uid}' to group '{group}'");
                Ok(())
            }
            Err(err) if err.code() == ResultCode::TypeOrValueExists => Ok(()),
            Err(err) if err.code() == ResultCode::NoSuchObject => Err(
                Error::validation(format!("group '{group}' does not exist"))
            ),
            Err(err) => Err(err.into()),
        }
    }

    fn is_member(&self, uid: &str, group: &str) -> SetupResult<bool> {
        let member = self.user_dn(uid);
        let found = self.dir.search(
            &self.group_dn(group),
            Scope::Base,
            &Filter::eq("uniqueMember", member),
        );
        match found {
            Ok(entries) => Ok(!entries.is_empty()),
            Err(err) if err.code() == ResultCode::NoSuchObject => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn authenticate(&self, uid: &str, password: &str) -> SetupResult<bool> {
        match self.dir.read_opt(&self.user_dn(uid))? {
            Some(entry) => Ok(entry.values("userPassword").iter().any(|p| p == password)),
            None => Ok(false),
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;

    fn store() -> DirectoryUserStore {
        let dir = MemoryDirectory::empty();
        dir.seed([
            Entry::new("o=pki").with("objectClass", "top"),
            Entry::new("ou=people,o=pki").with("objectClass", "organizationalUnit"),
            Entry::new("ou=groups,o=pki").with("objectClass", "organizationalUnit"),
            Entry::new("cn=Administrators,ou=groups,o=pki")
                .with("objectClass", "groupOfUniqueNames"),
        ]);
        DirectoryUserStore::new(Box::new(dir), "o=pki")
    }

    #[test]
    fn create_and_authenticate() {
        let users = store();
        let mut admin = User::new("caadmin", "CA Administrator");
        admin.password = Some("Secret.123".into());
        users.create_user(&admin).unwrap();

        assert!(users.user_exists("caadmin").unwrap());
        assert!(users.authenticate("caadmin", "Secret.123").unwrap());
        assert!(!users.authenticate("caadmin", "wrong").unwrap());
        assert!(!users.authenticate("nobody", "Secret.123").unwrap());
        assert!(matches!(users.create_user(&admin), Err(Error::Conflict(_))));
    }

    #[test]
    fn group_membership() {
        let users = store();
        users.create_user(&User::new("caadmin", "CA Administrator")).unwrap();
        users.add_to_group("caadmin", "Administrators").unwrap();
        users.add_to_group("caadmin", "Administrators").unwrap();

        assert!(users.is_member("caadmin", "Administrators").unwrap());
        assert!(!users.is_member("caadmin", "Nonexistent").unwrap());
        assert!(users.add_to_group("caadmin", "Nonexistent").is_err());
    }
}
