//! The job type registry.
//!
//! Job types are registered during startup and frozen when the engine is
//! activated. After that the registry is read-only.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use jobhub_queue::{JobExecutor, JobQueueError, ProgressReporter};

use crate::args::{JobArgs, RawArgs, ValidationErrors};
use crate::codec::ArgsCodec;
use crate::context::JobContext;
use crate::error::{EngineError, RegistryError};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), JobQueueError>> + Send>>;

type Parser<A> = Arc<dyn Fn(&RawArgs) -> Result<A, ValidationErrors> + Send + Sync>;
type Handler<A> = Arc<dyn Fn(JobContext<A>) -> HandlerFuture + Send + Sync>;

/// Descriptive metadata of a job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTypeInfo {
    pub name: String,
    pub description: String,
    /// Optional grouping label, e.g. the resource the job operates on.
    pub resource: Option<String>,
}

/// A registered job type with its argument type erased.
pub trait ErasedJobType: Send + Sync {
    fn info(&self) -> &JobTypeInfo;

    fn name(&self) -> &str {
        &self.info().name
    }

    /// Parse and validate raw input into the canonical argument value.
    fn parse(&self, raw: &RawArgs) -> Result<Value, EngineError>;

    /// The executor the queue runs for units of this type.
    fn executor(&self, codec: Arc<dyn ArgsCodec>) -> Arc<dyn JobExecutor>;
}

impl fmt::Debug for dyn ErasedJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobType").field("info", self.info()).finish()
    }
}

/// A job type ready for registration. Build one with [`JobType::builder`].
#[derive(Clone)]
pub struct JobType {
    inner: Arc<dyn ErasedJobType>,
}

impl fmt::Debug for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl JobType {
    pub fn builder(name: impl Into<String>) -> JobTypeBuilder<()> {
        JobTypeBuilder {
            info: JobTypeInfo {
                name: name.into(),
                description: String::new(),
                resource: None,
            },
            parser: None,
            handler: None,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn info(&self) -> &JobTypeInfo {
        self.inner.info()
    }
}

/// Builder for [`JobType`]. The argument type is fixed by `parser` or
/// `serde_args`, which must come before `handler`.
pub struct JobTypeBuilder<A> {
    info: JobTypeInfo,
    parser: Option<Parser<A>>,
    handler: Option<Handler<A>>,
}

impl<A> JobTypeBuilder<A> {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.info.description = description.into();
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.info.resource = Some(resource.into());
        self
    }

    /// Use an explicit parser for raw input.
    pub fn parser<B, F>(self, parser: F) -> JobTypeBuilder<B>
    where
        B: JobArgs,
        F: Fn(&RawArgs) -> Result<B, ValidationErrors> + Send + Sync + 'static,
    {
        JobTypeBuilder {
            info: self.info,
            parser: Some(Arc::new(parser)),
            handler: None,
        }
    }

    /// Parse raw input by deserializing it straight into `B`.
    pub fn serde_args<B: JobArgs>(self) -> JobTypeBuilder<B> {
        self.parser(|raw: &RawArgs| raw.deserialize::<B>())
    }
}

impl<A: JobArgs> JobTypeBuilder<A> {
    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(JobContext<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobQueueError>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |ctx: JobContext<A>| -> HandlerFuture {
            Box::pin(handler(ctx))
        }));
        self
    }

    pub fn build(self) -> Result<JobType, RegistryError> {
        let incomplete = |reason| RegistryError::Incomplete {
            name: self.info.name.clone(),
            reason,
        };
        if self.info.name.trim().is_empty() {
            return Err(incomplete("name is empty"));
        }
        let parser = self.parser.clone().ok_or_else(|| incomplete("no argument parser"))?;
        let handler = self.handler.clone().ok_or_else(|| incomplete("no handler"))?;
        Ok(JobType {
            inner: Arc::new(TypedJobType {
                info: self.info,
                parser,
                handler,
            }),
        })
    }
}

struct TypedJobType<A> {
    info: JobTypeInfo,
    parser: Parser<A>,
    handler: Handler<A>,
}

impl<A: JobArgs> ErasedJobType for TypedJobType<A> {
    fn info(&self) -> &JobTypeInfo {
        &self.info
    }

    fn parse(&self, raw: &RawArgs) -> Result<Value, EngineError> {
        let args = (self.parser)(raw)?;
        args.validate()?;
        serde_json::to_value(&args).map_err(|e| crate::codec::CodecError(e.to_string()).into())
    }

    fn executor(&self, codec: Arc<dyn ArgsCodec>) -> Arc<dyn JobExecutor> {
        Arc::new(TypedExecutor {
            name: self.info.name.clone(),
            codec,
            handler: Arc::clone(&self.handler),
            _args: PhantomData,
        })
    }
}

struct TypedExecutor<A> {
    name: String,
    codec: Arc<dyn ArgsCodec>,
    handler: Handler<A>,
    _args: PhantomData<fn() -> A>,
}

#[async_trait]
impl<A: JobArgs> JobExecutor for TypedExecutor<A> {
    fn job_type(&self) -> &str {
        &self.name
    }

    async fn execute(&self, reporter: ProgressReporter) -> Result<(), JobQueueError> {
        let value = self
            .codec
            .decode(reporter.args())
            .map_err(|e| JobQueueError::failed(format!("cannot decode job arguments: {e}")))?;
        let args: A = serde_json::from_value(value)
            .map_err(|e| JobQueueError::failed(format!("invalid job arguments: {e}")))?;
        (self.handler)(JobContext::new(args, reporter)).await
    }
}

#[derive(Default)]
struct RegistryState {
    types: BTreeMap<String, Arc<dyn ErasedJobType>>,
    frozen: bool,
}

/// Process-wide table of job types.
#[derive(Default)]
pub struct JobRegistry {
    state: RwLock<RegistryState>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("JobRegistry")
            .field("types", &state.types.keys().collect::<Vec<_>>())
            .field("frozen", &state.frozen)
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_type: JobType) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let name = job_type.name().to_owned();
        if state.frozen {
            return Err(RegistryError::RegistryFrozen(name));
        }
        if state.types.contains_key(&name) {
            return Err(RegistryError::DuplicateJobType(name));
        }
        state.types.insert(name, job_type.inner);
        Ok(())
    }

    /// Not-found is a normal answer: persisted jobs may reference a type that
    /// has since been removed from code.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ErasedJobType>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .types
            .get(name)
            .cloned()
    }

    /// Stop accepting registrations and return every registered type.
    pub fn freeze(&self) -> Vec<Arc<dyn ErasedJobType>> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.frozen = true;
        state.types.values().cloned().collect()
    }

    pub fn is_frozen(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .frozen
    }

    /// Metadata of every registered type, sorted by name.
    pub fn infos(&self) -> Vec<JobTypeInfo> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .types
            .values()
            .map(|t| t.info().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        count: i64,
    }

    impl JobArgs for Ping {
        fn validate(&self) -> Result<(), ValidationErrors> {
            if self.count < 0 {
                return Err(ValidationErrors::single("count", "negative", "count must be >= 0"));
            }
            Ok(())
        }
    }

    fn ping(name: &str) -> JobType {
        JobType::builder(name)
            .description("test job")
            .serde_args::<Ping>()
            .handler(|_ctx: JobContext<Ping>| async { Ok(()) })
            .build()
            .unwrap()
    }

    #[test]
    fn duplicate_and_frozen_registration_fail() {
        let registry = JobRegistry::new();
        registry.register(ping("ping")).unwrap();
        assert!(matches!(
            registry.register(ping("ping")),
            Err(RegistryError::DuplicateJobType(name)) if name == "ping"
        ));

        let frozen = registry.freeze();
        assert_eq!(frozen.len(), 1);
        assert!(registry.lookup("ping").is_some());
        assert!(matches!(
            registry.register(ping("pong")),
            Err(RegistryError::RegistryFrozen(_))
        ));
        assert!(registry.lookup("pong").is_none());
    }

    #[test]
    fn builder_requires_parser_and_handler() {
        let err = JobType::builder("x")
            .serde_args::<Ping>()
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::Incomplete { reason: "no handler", .. }));
    }

    #[test]
    fn parse_runs_validation() {
        let job_type = ping("ping");
        let raw = RawArgs::from_json(json!({ "count": -1 })).unwrap();
        assert!(matches!(
            job_type.inner.parse(&raw),
            Err(EngineError::Validation(_))
        ));
        let raw = RawArgs::from_json(json!({ "count": 3 })).unwrap();
        assert_eq!(job_type.inner.parse(&raw).unwrap(), json!({ "count": 3 }));
    }

    #[test]
    fn infos_are_sorted() {
        let registry = JobRegistry::new();
        registry.register(ping("b")).unwrap();
        registry.register(ping("a")).unwrap();
        let names: Vec<_> = registry.infos().into_iter().map(|i| i.name).collect();
        assert_eq!(names, ["a", "b"]);
    }
}
