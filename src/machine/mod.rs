//! Execution machine contract
//!
//! Execution machines are the opaque, pluggable payload runners keyed by
//! `job_type`. The crate consumes them through two calls:
//!
//! - `prefilter`: parse raw submission parameters into a sanitized payload
//!   plus any secret variables that must never reach the ledger
//! - `run`: execute the job, writing line-oriented output through the
//!   provided sink and honouring the cooperative cancel flag
//!
//! Each machine also declares a parameter schema that the scheduler
//! validates admitted tasks against.

mod echo;

pub use echo::EchoMachine;

use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::ledger::SecretVars;

/// Result of prefiltering raw submission parameters
#[derive(Debug, Clone)]
pub struct Prefiltered {
    /// Parameters with secrets stripped, safe to persist
    pub sanitized: Value,
    /// Extracted secret variables, if any
    pub secrets: SecretVars,
}

/// Prefilter parse failure — a bad request, never retried
#[derive(Debug, thiserror::Error)]
#[error("cannot parse parameters: {0}")]
pub struct PrefilterError(pub String);

/// Expected shape of one parameter field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    Bool,
    Map,
    List,
    /// Any JSON value
    Any,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::Text => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Map => value.is_object(),
            FieldKind::List => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

/// One field in a machine's declared parameter schema
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Dot-separated path into the parameter object
    pub path: &'static str,
    /// Expected value shape
    pub kind: FieldKind,
    /// Whether the field must be present
    pub required: bool,
}

/// Declared parameter schema of an execution machine
#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    /// Field specifications
    pub fields: Vec<FieldSpec>,
}

impl ParamSchema {
    /// Validate `params` against the schema, returning every offending
    /// field path. An empty result means the parameters conform.
    pub fn violations(&self, params: &Value) -> Vec<String> {
        let mut offending = Vec::new();
        for field in &self.fields {
            match lookup(params, field.path) {
                None if field.required => offending.push(format!("{}: missing", field.path)),
                None => {}
                Some(value) if !field.kind.matches(value) => {
                    offending.push(format!("{}: expected {:?}", field.path, field.kind))
                }
                Some(_) => {}
            }
        }
        offending
    }
}

fn lookup<'a>(params: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = params;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Everything a machine needs to execute one admitted job
pub struct RunContext<'a> {
    /// Sanitized parameters as persisted on the job row
    pub parameters: &'a Value,
    /// Secret variables fetched (and deleted) from the mediator
    pub secrets: SecretVars,
    /// Line-oriented stdout sink
    pub output: &'a mut OutputSink,
    /// Cooperative cancel flag; machines should poll it between steps
    pub cancelled: &'a AtomicBool,
}

impl RunContext<'_> {
    /// Whether cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Line-oriented output writer; every line is flushed so that tail
/// readers see it immediately
pub struct OutputSink {
    writer: BufWriter<Box<dyn Write + Send>>,
}

impl OutputSink {
    /// Wrap an arbitrary writer
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Append one output line
    pub fn line(&mut self, text: &str) -> io::Result<()> {
        self.writer.write_all(text.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Opaque payload runner keyed by job type
pub trait ExecutionMachine: Send + Sync {
    /// The `job_type` this machine handles
    fn job_type(&self) -> &str;

    /// Declared parameter schema, validated at admission
    fn schema(&self) -> ParamSchema;

    /// Parse raw submission parameters, splitting out secret variables
    fn prefilter(&self, raw: &Value) -> Result<Prefiltered, PrefilterError>;

    /// Execute the job. `Ok` carries the result text of a successful run,
    /// `Err` the failure text.
    fn run(&self, ctx: RunContext<'_>) -> Result<String, String>;
}

/// Registry of execution machines by job type
#[derive(Default)]
pub struct MachineRegistry {
    machines: HashMap<String, Arc<dyn ExecutionMachine>>,
}

impl MachineRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a machine under its declared job type
    pub fn register(&mut self, machine: Arc<dyn ExecutionMachine>) {
        self.machines.insert(machine.job_type().to_string(), machine);
    }

    /// Look up the machine for a job type
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn ExecutionMachine>> {
        self.machines.get(job_type).cloned()
    }
}
