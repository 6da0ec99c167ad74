//! Task specifications as submitted by clients.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::Address;
use crate::key::TaskKey;

/// One argument of a task call: a literal value, the result of another task,
/// or a list mixing both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    Value(Value),
    Future(TaskKey),
    List(Vec<Arg>),
}

impl Arg {
    /// Keys this argument depends on.
    pub fn collect_dependencies(&self, out: &mut BTreeSet<TaskKey>) {
        match self {
            Arg::Value(_) => {}
            Arg::Future(key) => {
                out.insert(key.clone());
            }
            Arg::List(items) => {
                for item in items {
                    item.collect_dependencies(out);
                }
            }
        }
    }

    /// Argument list referencing every key in `keys`, e.g. for `sum(futures)`.
    pub fn keys<'a>(keys: impl IntoIterator<Item = &'a TaskKey>) -> Self {
        Arg::List(keys.into_iter().cloned().map(Arg::Future).collect())
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Value(v)
    }
}

impl From<TaskKey> for Arg {
    fn from(k: TaskKey) -> Self {
        Arg::Future(k)
    }
}

impl From<&TaskKey> for Arg {
    fn from(k: &TaskKey) -> Self {
        Arg::Future(k.clone())
    }
}

macro_rules! arg_from_scalar {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Arg {
                fn from(v: $t) -> Self {
                    Arg::Value(Value::from(v))
                }
            }
        )*
    };
}

arg_from_scalar!(i32, i64, u32, u64, usize, f64, bool, String, &str);

/// What to run for a task: a registered function name and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub function: String,
    pub args: Vec<Arg>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Arg>,
}

impl RunSpec {
    pub fn new(function: impl Into<String>, args: Vec<Arg>, kwargs: BTreeMap<String, Arg>) -> Self {
        Self {
            function: function.into(),
            args,
            kwargs,
        }
    }

    /// Every task key referenced anywhere in the arguments.
    pub fn dependencies(&self) -> BTreeSet<TaskKey> {
        let mut deps = BTreeSet::new();
        for arg in &self.args {
            arg.collect_dependencies(&mut deps);
        }
        for arg in self.kwargs.values() {
            arg.collect_dependencies(&mut deps);
        }
        deps
    }
}

/// Placement restrictions attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Restrictions {
    /// Only run on these workers (unless `allow_other_workers`).
    #[serde(default)]
    pub workers: Option<BTreeSet<Address>>,
    /// Treat `workers` as a preference rather than a hard limit.
    #[serde(default)]
    pub allow_other_workers: bool,
    /// Abstract resources consumed while the task executes.
    #[serde(default)]
    pub resources: BTreeMap<String, f64>,
}

impl Restrictions {
    pub fn is_empty(&self) -> bool {
        self.workers.is_none() && self.resources.is_empty()
    }
}

/// A task as submitted in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub key: TaskKey,
    /// `None` marks a dependency-only placeholder for data that must
    /// already exist on the cluster.
    pub run_spec: Option<RunSpec>,
    pub dependencies: BTreeSet<TaskKey>,
    /// Lower values run first.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub restrictions: Restrictions,
}

impl TaskSpec {
    pub fn new(key: TaskKey, run_spec: RunSpec) -> Self {
        let dependencies = run_spec.dependencies();
        Self {
            key,
            run_spec: Some(run_spec),
            dependencies,
            priority: 0,
            retries: 0,
            restrictions: Restrictions::default(),
        }
    }

    pub fn placeholder(key: TaskKey) -> Self {
        Self {
            key,
            run_spec: None,
            dependencies: BTreeSet::new(),
            priority: 0,
            retries: 0,
            restrictions: Restrictions::default(),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_restrictions(mut self, restrictions: Restrictions) -> Self {
        self.restrictions = restrictions;
        self
    }
}
