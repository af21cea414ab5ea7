//! Shared test harness
//!
//! Builds the full stack over the in-memory ledger, the in-memory
//! mediator backend, the echo machine, and a temporary spool directory.

// Not every test binary touches every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use jobgate::ledger::{Ledger, MemoryLedger};
use jobgate::machine::{EchoMachine, MachineRegistry};
use jobgate::mediator::{MemoryBackend, Mediator};
use jobgate::scheduler::{PermissionAuthority, ResourceAuthority, Scheduler};
use jobgate::{Gateway, OutputGateway};

pub struct Stack {
    pub ledger: Arc<MemoryLedger>,
    pub backend: MemoryBackend,
    pub mediator: Arc<Mediator>,
    pub machines: Arc<MachineRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub gateway: Arc<Gateway>,
    pub output: Arc<OutputGateway>,
    pub spool: TempDir,
}

/// Build a stack with permissive stub authorities
pub fn stack() -> Stack {
    stack_with(|scheduler| scheduler)
}

/// Build a stack, letting the caller adjust the scheduler (authorities,
/// concurrency) before it is shared
pub fn stack_with(customize: impl FnOnce(Scheduler) -> Scheduler) -> Stack {
    let ledger = Arc::new(MemoryLedger::new());
    let ledger_dyn: Arc<dyn Ledger> = ledger.clone();

    let backend = MemoryBackend::new();
    let mediator = Arc::new(Mediator::new(Box::new(backend.clone())));

    let mut machines = MachineRegistry::new();
    machines.register(Arc::new(EchoMachine::new()));
    let machines = Arc::new(machines);

    let spool = TempDir::new().expect("spool dir");
    let scheduler = Scheduler::new(
        ledger_dyn.clone(),
        mediator.clone(),
        machines.clone(),
        spool.path().to_path_buf(),
    );
    let scheduler = Arc::new(customize(scheduler));

    let gateway = Arc::new(Gateway::new(
        ledger_dyn.clone(),
        mediator.clone(),
        machines.clone(),
    ));
    let output = Arc::new(OutputGateway::new(ledger_dyn, spool.path().to_path_buf()));

    Stack {
        ledger,
        backend,
        mediator,
        machines,
        scheduler,
        gateway,
        output,
        spool,
    }
}

/// Authorities that resolve fixed claims and deny a fixed set of names
pub fn restrictive_authorities(
    claims: Vec<jobgate::scheduler::ResourceClaim>,
    denied: Vec<String>,
) -> (PermissionAuthority, ResourceAuthority) {
    use jobgate::scheduler::{AuthorityError, PermissionBackend, ResourceBackend, ResourceClaim};

    struct FixedResources(Vec<ResourceClaim>);
    impl ResourceBackend for FixedResources {
        fn resolve(
            &self,
            _job_type: &str,
            _parameters: &serde_json::Value,
            _requester: &str,
        ) -> Result<Vec<ResourceClaim>, AuthorityError> {
            Ok(self.0.clone())
        }
    }

    struct DenyNamed(Vec<String>);
    impl PermissionBackend for DenyNamed {
        fn can_use(
            &self,
            _requester: &str,
            resource: &ResourceClaim,
        ) -> Result<bool, AuthorityError> {
            Ok(!self.0.contains(&resource.name))
        }
    }

    (
        PermissionAuthority::Remote(Box::new(DenyNamed(denied))),
        ResourceAuthority::Remote(Box::new(FixedResources(claims))),
    )
}

/// Drive dispatch passes until `cond` holds or a generous budget runs out
pub fn drive_until(scheduler: &Scheduler, mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..1_000 {
        scheduler.run_pending(Utc::now()).expect("dispatch pass");
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}
