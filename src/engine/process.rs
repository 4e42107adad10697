//! Process - A unit of work the engine runs on every tick

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

use crate::core::{Error, Result};

type Task = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Immutable (function, context, arguments) triple.
///
/// The three parts are bound into a single task at construction; `valid`
/// records whether all of them were supplied. The engine does not look at
/// `valid` before running a process, so register only valid ones.
#[derive(Clone)]
pub struct Process {
    name: String,
    task: Option<Task>,
    valid: bool,
}

impl Process {
    pub fn new<C, A, F, Fut>(
        name: impl Into<String>,
        func: Option<F>,
        context: Option<Arc<C>>,
        args: Option<A>,
    ) -> Self
    where
        C: ?Sized + Send + Sync + 'static,
        A: Clone + Send + Sync + 'static,
        F: Fn(Arc<C>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let task: Option<Task> = match (func, context, args) {
            (Some(func), Some(context), Some(args)) => Some(Arc::new(move || {
                func(Arc::clone(&context), args.clone()).boxed()
            })),
            _ => None,
        };
        let valid = task.is_some();

        Self {
            name: name.into(),
            task,
            valid,
        }
    }

    /// All three parts present.
    pub fn bind<C, A, F, Fut>(name: impl Into<String>, func: F, context: Arc<C>, args: A) -> Self
    where
        C: ?Sized + Send + Sync + 'static,
        A: Clone + Send + Sync + 'static,
        F: Fn(Arc<C>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(name, Some(func), Some(context), Some(args))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Invoke the function with its context and arguments.
    pub async fn run(&self) -> Result<()> {
        match &self.task {
            Some(task) => task().await,
            None => Err(Error::validation(format!(
                "process '{}' is missing its function, context or arguments",
                self.name
            ))),
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("valid", &self.valid)
            .finish()
    }
}
