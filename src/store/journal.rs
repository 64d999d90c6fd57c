//! The installation journal.
//!
//! While an instance is being configured, every workflow step records what
//! it was run with below `preop.journal.<step>`. A step whose record
//! matches the current inputs is not run again. If the inputs changed, the
//! step and everything after it is invalidated and run anew.
//!
//! The journal, together with all other `preop` scratch values, is removed
//! by [`InstallationJournal::commit_installation`] in the same write that
//! marks the instance as configured.

use std::collections::BTreeMap;
use std::fmt;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use crate::constants::{CS_STATE_KEY, PREOP_PREFIX};
use super::{ConfigStore, StoreError};


//------------ Step ----------------------------------------------------------

/// The steps of a configuration run, in execution order.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Token,
    SecurityDomain,
    Subsystem,
    Hierarchy,
    Database,
    Certificates,
    Admin,
    Done,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::Token,
        Step::SecurityDomain,
        Step::Subsystem,
        Step::Hierarchy,
        Step::Database,
        Step::Certificates,
        Step::Admin,
        Step::Done,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::Token => "token",
            Step::SecurityDomain => "security_domain",
            Step::Subsystem => "subsystem",
            Step::Hierarchy => "hierarchy",
            Step::Database => "database",
            Step::Certificates => "certificates",
            Step::Admin => "admin",
            Step::Done => "done",
        }
    }

    /// Returns this step and all steps after it.
    pub fn and_following(self) -> impl Iterator<Item = Step> {
        Step::ALL.into_iter().filter(move |s| *s >= self)
    }

    fn key(self) -> String {
        format!("{PREOP_PREFIX}.journal.{}", self.name())
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}


//------------ StepRecord ----------------------------------------------------

/// What the journal knows about a completed step.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StepRecord {
    /// Digest over the inputs the step ran with.
    pub digest: String,

    pub completed: DateTime<Utc>,

    /// Values produced by the step that later steps or a resumed run need.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}


//------------ StepState -----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StepState {
    /// Never completed, or invalidated.
    Pending,

    /// Completed with the same inputs.
    Completed(StepRecord),

    /// Completed with different inputs.
    Stale(StepRecord),
}


//------------ InstallationJournal -------------------------------------------

/// Typed access to the journal part of the configuration store.
pub struct InstallationJournal<'a> {
    store: &'a mut ConfigStore,
}

impl<'a> InstallationJournal<'a> {
    pub fn new(store: &'a mut ConfigStore) -> Self {
        InstallationJournal { store }
    }

    /// Calculates the digest for the inputs of a step.
    pub fn digest(inputs: &impl Serialize) -> Result<String, StoreError> {
        let json = serde_json::to_vec(inputs)
            .map_err(|e| StoreError::Journal(e.to_string()))?;
        Ok(hex::encode(openssl::sha::sha256(&json)))
    }

    pub fn record(&self, step: Step) -> Result<Option<StepRecord>, StoreError> {
        match self.store.get(&step.key()) {
            None => Ok(None),
            Some(json) => serde_json::from_str(json)
                .map(Some)
                .map_err(|e| {
                    StoreError::Journal(format!("bad record for {step}: {e}"))
                }),
        }
    }

    pub fn state(&self, step: Step, digest: &str) -> Result<StepState, StoreError> {
        Ok(match self.record(step)? {
            None => StepState::Pending,
            Some(record) if record.digest == digest => {
                StepState::Completed(record)
            }
            Some(record) => StepState::Stale(record),
        })
    }

    /// Records completion of a step and commits the store.
    pub fn complete(
        &mut self,
        step: Step,
        digest: String,
        outputs: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let record = StepRecord {
            digest,
            completed: Utc::now(),
            outputs,
        };
        let json = serde_json::to_string(&record)
            .map_err(|e| StoreError::Journal(e.to_string()))?;
        self.store.put(&step.key(), json);
        self.store.commit()?;
        debug!("Recorded completion of step '{step}'");
        Ok(())
    }

    /// Forgets the given step and all following ones.
    ///
    /// Returns the steps that had been completed before, in order, so the
    /// caller can clean up after them. Does not commit.
    pub fn invalidate_from(
        &mut self, step: Step
    ) -> Result<Vec<Step>, StoreError> {
        let mut res = Vec::new();
        for later in step.and_following() {
            if self.store.remove(&later.key()).is_some() {
                res.push(later);
            }
        }
        if !res.is_empty() {
            info!(
                "Inputs for step '{step}' changed, invalidated: {}",
                res.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
            );
        }
        Ok(res)
    }

    pub fn completed_steps(&self) -> Result<Vec<Step>, StoreError> {
        let mut res = Vec::new();
        for step in Step::ALL {
            if self.record(step)?.is_some() {
                res.push(step);
            }
        }
        Ok(res)
    }

    /// Ends the installation.
    ///
    /// Removes the whole `preop` namespace and marks the instance as
    /// configured, in a single commit.
    pub fn commit_installation(self) -> Result<(), StoreError> {
        let removed = self.store.remove_prefix(PREOP_PREFIX);
        self.store.put(CS_STATE_KEY, 1);
        self.store.commit()?;
        info!("Installation committed, removed {removed} journal entries");
        Ok(())
    }
}


//------------ Tests ---------------------------------------------------------
