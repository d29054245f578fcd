//! Resource limits: cpu and memory through rctl, disk through the
//! dataset quota. Failures on individual limits are reported without
//! aborting the rest, matching teardown semantics elsewhere.

use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::WardenResult;
use crate::exec::{Cmd, CommandRunner};
use crate::jail::jail_name;
use crate::store::PropertyStore;

/// A limit is either unset (unlimited) or a value in the unit the
/// target subsystem expects: `maxCpu` in percent, `maxRam`/`maxHdd`
/// with a size suffix such as `512M` or `1G`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Limit {
    Unlimited,
    Value(String),
}

impl Limit {
    pub fn parse(raw: &str) -> Limit {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unlimited") {
            Limit::Unlimited
        } else {
            Limit::Value(trimmed.to_string())
        }
    }

    pub fn as_stored(&self) -> String {
        match self {
            Limit::Unlimited => "unlimited".to_string(),
            Limit::Value(v) => v.clone(),
        }
    }
}

pub struct ResourceLimiter {
    runner: Arc<dyn CommandRunner>,
}

impl ResourceLimiter {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Apply cpu/ram limits to a live jail and the disk quota to its
    /// dataset. Each limit is attempted independently.
    pub fn apply(
        &self,
        uuid: &str,
        store: &Arc<dyn PropertyStore>,
        dataset: &str,
        max_cpu: &Limit,
        max_ram: &Limit,
        max_hdd: &Limit,
    ) -> WardenResult<()> {
        match max_cpu {
            Limit::Unlimited => info!(uuid, "cpu unlimited, no rctl rule"),
            Limit::Value(v) => {
                let pcpu = v.trim_end_matches('%');
                if let Err(err) = self.rctl_add(uuid, "pcpu", pcpu) {
                    warn!(uuid, limit = %v, %err, "could not apply cpu limit");
                }
            }
        }
        match max_ram {
            Limit::Unlimited => info!(uuid, "ram unlimited, no rctl rule"),
            Limit::Value(v) => {
                if let Err(err) = self.rctl_add(uuid, "memoryuse", v) {
                    warn!(uuid, limit = %v, %err, "could not apply ram limit");
                }
            }
        }
        match max_hdd {
            Limit::Unlimited => info!(uuid, "hdd unlimited, no quota"),
            Limit::Value(v) => {
                if let Err(err) = store.set(dataset, "quota", v) {
                    warn!(uuid, limit = %v, %err, "could not apply disk quota");
                }
            }
        }
        Ok(())
    }

    /// Drop every rctl rule for the jail.
    pub fn release(&self, uuid: &str) -> WardenResult<()> {
        let subject = format!("jail:{}", jail_name(uuid));
        let cmd = Cmd::new("rctl").args(["-r", &subject]);
        self.runner.run_checked(&cmd).map(|_| ())
    }

    fn rctl_add(&self, uuid: &str, resource: &str, amount: &str) -> WardenResult<()> {
        let rule = format!("jail:{}:{}:deny={}", jail_name(uuid), resource, amount);
        let cmd = Cmd::new("rctl").args(["-a", &rule]);
        self.runner.run_checked(&cmd).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_recognizes_unlimited() {
        assert_eq!(Limit::parse(""), Limit::Unlimited);
        assert_eq!(Limit::parse("unlimited"), Limit::Unlimited);
        assert_eq!(Limit::parse("Unlimited"), Limit::Unlimited);
        assert_eq!(Limit::parse("512M"), Limit::Value("512M".into()));
    }

    #[test]
    fn stored_form_round_trips() {
        assert_eq!(Limit::parse(&Limit::Unlimited.as_stored()), Limit::Unlimited);
        let v = Limit::Value("2G".into());
        assert_eq!(Limit::parse(&v.as_stored()), v);
    }
}
