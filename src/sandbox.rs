//! Self-contained network for offline runs and tests.
//!
//! One [`InMemoryCa`] per configured organisation and a single
//! [`InMemoryLedger`] that trusts every org's CA root and hosts the `basic`
//! product contract on the configured channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::ca::{CaBackend, CaError, InMemoryCa};
use crate::config::Config;
use crate::error::AppError;
use crate::gateway::basic::ProductContract;
use crate::gateway::{GatewayBackend, InMemoryLedger};
use crate::orchestrator::Backends;

#[derive(Debug, Clone)]
pub struct Sandbox {
    cas: BTreeMap<u8, InMemoryCa>,
    ledger: InMemoryLedger,
}

impl Sandbox {
    pub fn for_config(config: &Config) -> Result<Self, AppError> {
        let ledger = InMemoryLedger::new();
        let mut cas = BTreeMap::new();
        for org in &config.orgs {
            let ca = InMemoryCa::for_org(org).map_err(|e| sandbox_error(&org.msp_id, e))?;
            let root = ca.root_certificate_pem().map_err(|e| sandbox_error(&org.msp_id, e))?;
            ledger.trust(&org.msp_id, &root)?;
            debug!(msp = %org.msp_id, ca = %org.ca_name, "sandbox CA ready");
            cas.insert(org.number, ca);
        }
        ledger.deploy(&config.channel, &config.contract, Arc::new(ProductContract));
        Ok(Self { cas, ledger })
    }

    pub fn ca(&self, org: u8) -> Option<&InMemoryCa> {
        self.cas.get(&org)
    }

    pub fn ledger(&self) -> &InMemoryLedger {
        &self.ledger
    }

    /// Backends for every org; clones share state with this sandbox.
    pub fn backends(&self) -> Backends {
        Backends {
            ca: self
                .cas
                .iter()
                .map(|(n, ca)| (*n, CaBackend::Memory(ca.clone())))
                .collect(),
            gateway: self
                .cas
                .keys()
                .map(|n| (*n, GatewayBackend::Memory(self.ledger.clone())))
                .collect(),
        }
    }
}

fn sandbox_error(msp: &str, e: CaError) -> AppError {
    AppError::Config(format!("cannot build in-memory CA for {msp}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn one_ca_per_org_and_shared_ledger() {
        let config = Config::memory_default(Path::new("wallet"));
        let sandbox = Sandbox::for_config(&config).unwrap();
        assert!(sandbox.ca(1).is_some());
        assert!(sandbox.ca(2).is_some());
        assert!(sandbox.ca(3).is_none());

        let backends = sandbox.backends();
        assert_eq!(backends.ca.len(), 2);
        assert_eq!(backends.gateway.len(), 2);
        assert_eq!(sandbox.ca(2).unwrap().ca_name(), "ca-org2");
    }
}
