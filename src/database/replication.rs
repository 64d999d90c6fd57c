//! Multi-master replication between a master and its clone.
//!
//! Both directory servers get a changelog, a replication manager and a
//! replica entry for the base DN. An agreement on each side then pushes
//! changes to the other, and the clone is initialised from the master
//! with a total update.

use log::{debug, info};
use crate::commons::error::Error;
use crate::commons::SetupResult;
use crate::constants::CHANGELOG_DN;
use crate::directory::{
    escape_dn_value, Directory, Entry, LdapConnInfo, Modification, ResultCode,
};
use super::task::{TaskPoller, TaskProgress};


//------------ ReplicaSide ---------------------------------------------------

/// One end of the replication.
#[derive(Clone, Debug)]
pub struct ReplicaSide {
    pub conn: LdapConnInfo,

    /// The port the other side connects to for replication.
    pub replication_port: u16,

    /// The replica id to use if the side has no replica yet.
    pub replica_id: u32,
}


//------------ ReplicationParams ---------------------------------------------

#[derive(Clone, Debug)]
pub struct ReplicationParams {
    pub master: ReplicaSide,
    pub clone: ReplicaSide,
    pub base_dn: String,

    /// Distinguishes the agreements of several instances on one server.
    pub instance_id: String,

    /// Password of the replication managers on both sides.
    pub password: String,
}

impl ReplicationParams {
    fn master_agreement_name(&self) -> String {
        format!("masterAgreement1-{}-{}", self.clone.conn.host, self.instance_id)
    }

    fn clone_agreement_name(&self) -> String {
        format!("cloneAgreement1-{}-{}", self.master.conn.host, self.instance_id)
    }
}


//------------ ReplicationReport ---------------------------------------------

/// The replica ids in use after setting up replication.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplicationReport {
    pub master_replica_id: u32,
    pub clone_replica_id: u32,
}


//------------ setup ---------------------------------------------------------

/// Sets up replication and initialises the clone.
///
/// Parts that exist already are kept. A master that replicates to other
/// clones keeps its replica id.
pub fn setup(
    master: &dyn Directory,
    clone: &dyn Directory,
    params: &ReplicationParams,
    poller: &TaskPoller,
) -> SetupResult<ReplicationReport> {
    let master_name = params.master_agreement_name();
    let clone_name = params.clone_agreement_name();

    enable_changelog(master, &params.instance_id)?;
    enable_changelog(clone, &params.instance_id)?;

    let master_manager = create_manager(master, &master_name, &params.password)?;
    let clone_manager = create_manager(clone, &clone_name, &params.password)?;

    let master_replica_id = enable_replica(
        master, &params.base_dn, params.master.replica_id, &master_manager
    )?;
    let mut clone_replica_id = params.clone.replica_id;
    if clone_replica_id == master_replica_id {
        clone_replica_id += 1;
    }
    let clone_replica_id = enable_replica(
        clone, &params.base_dn, clone_replica_id, &clone_manager
    )?;
    if clone_replica_id == master_replica_id {
        return Err(Error::consistency(format!(
            "master and clone both use replica id {master_replica_id}"
        )));
    }

    let to_clone = create_agreement(
        master, &master_name, &params.base_dn,
        &params.clone.conn.host, params.clone.replication_port,
        &clone_manager, &params.password,
    )?;
    create_agreement(
        clone, &clone_name, &params.base_dn,
        &params.master.conn.host, params.master.replication_port,
        &master_manager, &params.password,
    )?;

    info!("Initialising {} from {}", params.clone.conn, params.master.conn);
    master.modify(&to_clone, &[
        Modification::replace("nsds5BeginReplicaRefresh", "start")
    ])?;
    poller.wait(master, &to_clone, TaskProgress::of_replica_init)?;
    info!("Replication of {} set up", params.base_dn);

    Ok(ReplicationReport { master_replica_id, clone_replica_id })
}

/// Returns the DN of the replica entry for a base DN.
pub fn replica_dn(base_dn: &str) -> String {
    format!("cn=replica,{}", super::mapping_dn(base_dn))
}

fn enable_changelog(dir: &dyn Directory, instance_id: &str) -> SetupResult<()> {
    let entry = Entry::new(CHANGELOG_DN)
        .with("objectClass", "top")
        .with("objectClass", "extensibleObject")
        .with("cn", "changelog5")
        .with(
            "nsslapd-changelogdir",
            format!("/var/lib/dirsrv/slapd-{instance_id}/changelogdb"),
        );
    add_or_keep(dir, entry)?;
    Ok(())
}

fn create_manager(
    dir: &dyn Directory, name: &str, password: &str
) -> SetupResult<String> {
    add_or_keep(dir, Entry::new("ou=csusers,cn=config")
        .with("objectClass", "top")
        .with("objectClass", "organizationalUnit")
        .with("ou", "csusers"))?;

    let cn = format!("Replication Manager {name}");
    let dn = format!("cn={},ou=csusers,cn=config", escape_dn_value(&cn));
    let entry = Entry::new(dn.as_str())
        .with("objectClass", "top")
        .with("objectClass", "person")
        .with("cn", cn.as_str())
        .with("sn", "manager")
        .with("userPassword", password)
        .with("passwordExpirationTime", "20380119031407Z");
    if !add_or_keep(dir, entry)? {
        dir.modify(&dn, &[Modification::replace("userPassword", password)])?;
    }
    Ok(dn)
}

/// Makes the base DN a read-write replica, returning its replica id.
fn enable_replica(
    dir: &dyn Directory, base_dn: &str, replica_id: u32, manager_dn: &str
) -> SetupResult<u32> {
    let dn = replica_dn(base_dn);
    if let Some(existing) = dir.read_opt(&dn)? {
        let id = existing
            .first("nsDS5ReplicaId")
            .and_then(|id| id.trim().parse::<u32>().ok())
            .ok_or_else(|| Error::custom(format!("{dn} has no valid replica id")))?;
        if !existing.has_value("nsds5ReplicaBindDN", manager_dn) {
            dir.modify(&dn, &[Modification::add("nsds5ReplicaBindDN", manager_dn)])?;
        }
        debug!("{dn} exists with replica id {id}");
        return Ok(id);
    }

    let entry = Entry::new(dn.as_str())
        .with("objectClass", "top")
        .with("objectClass", "nsDS5Replica")
        .with("objectClass", "extensibleObject")
        .with("cn", "replica")
        .with("nsDS5ReplicaRoot", base_dn)
        .with("nsDS5ReplicaType", "3")
        .with("nsDS5Flags", "1")
        .with("nsDS5ReplicaId", replica_id.to_string())
        .with("nsds5ReplicaPurgeDelay", "604800")
        .with("nsds5ReplicaBindDN", manager_dn);
    dir.add(entry)?;
    debug!("Enabled replica {replica_id} for {base_dn}");
    Ok(replica_id)
}

fn create_agreement(
    dir: &dyn Directory,
    name: &str,
    base_dn: &str,
    peer_host: &str,
    peer_port: u16,
    bind_dn: &str,
    password: &str,
) -> SetupResult<String> {
    let dn = format!("cn={name},{}", replica_dn(base_dn));
    let entry = Entry::new(dn.as_str())
        .with("objectClass", "top")
        .with("objectClass", "nsds5replicationagreement")
        .with("cn", name)
        .with("nsds5replicaroot", base_dn)
        .with("nsds5replicahost", peer_host)
        .with("nsds5replicaport", peer_port.to_string())
        .with("nsds5ReplicaBindDN", bind_dn)
        .with("nsds5replicabindmethod", "SIMPLE")
        .with("nsds5replicacredentials", password)
        .with("nsds5ReplicaTransportInfo", "LDAP")
        .with("description", name);
    if add_or_keep(dir, entry)? {
        debug!("Created agreement {name}");
    }
    Ok(dn)
}

fn add_or_keep(dir: &dyn Directory, entry: Entry) -> SetupResult<bool> {
    match dir.add(entry) {
        Ok(()) => Ok(true),
        Err(err) if err.code() == ResultCode::EntryAlreadyExists => Ok(false),
        Err(err) => Err(err.into()),
    }
}

//------------ Tests ---------------------------------------------------------
