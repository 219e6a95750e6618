//! Build plans: the TOML file `kiln run` executes.
//!
//! ```toml
//! [[package]]
//! package = "dev-libs/foo-1.0"
//! priority = "hard"
//! fetch = ["sh", "-c", "curl -sO https://example.org/foo-1.0.tar.gz"]
//! phases = [["make"], ["make", "install"]]
//!
//! [blockers]
//! "dev-libs/foo-1.0" = ["dev-libs/foo-compat"]
//! ```

use crate::merge::{MergeListItem, StaticBlockers};
use crate::{klog_debug, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    #[serde(rename = "package", default)]
    pub packages: Vec<MergeListItem>,
    /// Installed packages that block each planned package.
    #[serde(default)]
    pub blockers: BTreeMap<String, BTreeSet<String>>,
}

impl BuildPlan {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::PlanNotFound(path.display().to_string()));
        }
        let plan = Self::from_toml(&fs::read_to_string(path)?)?;
        klog_debug!(
            "BuildPlan::load path={} packages={}",
            path.display(),
            plan.packages.len()
        );
        Ok(plan)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let plan: Self = toml::from_str(text)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for item in &self.packages {
            if item.package.trim().is_empty() {
                return Err(Error::Validation("package name must not be empty".to_string()));
            }
            if !seen.insert(item.package.as_str()) {
                return Err(Error::Validation(format!(
                    "package {} is listed twice",
                    item.package
                )));
            }
            if item.fetch.as_ref().is_some_and(|argv| argv.is_empty()) {
                return Err(Error::Validation(format!(
                    "{}: fetch command is empty",
                    item.package
                )));
            }
            if let Some(i) = item.phases.iter().position(|argv| argv.is_empty()) {
                return Err(Error::Validation(format!(
                    "{}: phase {} is empty",
                    item.package,
                    i + 1
                )));
            }
        }
        Ok(())
    }

    pub fn blocker_query(&self) -> StaticBlockers {
        StaticBlockers(self.blockers.clone())
    }
}
