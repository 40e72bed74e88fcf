//! Task registry for type-erased executable creation
//!
//! The registry maps a stored task-type identifier to a factory producing
//! the executable, so workers never rely on dynamic class loading: anything
//! not registered at process start resolves to [`RegistryError::UnknownTaskType`].

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::task::TaskParams;

/// The unit of work a worker executes.
///
/// Implementations are constructed fresh for every execution attempt. Any
/// error returned is treated as an attempt failure and fed into the retry
/// transition; it never propagates past the worker boundary.
#[async_trait]
pub trait Task: Send + Sync {
    async fn execute(&self, params: &TaskParams) -> anyhow::Result<()>;
}

/// A [`Task`] with a stable stored type name, for typed registration.
///
/// # Example
///
/// ```
/// use deferq::{Task, TaskParams, TaskType};
///
/// #[derive(Default)]
/// struct Noop;
///
/// #[async_trait::async_trait]
/// impl Task for Noop {
///     async fn execute(&self, _params: &TaskParams) -> anyhow::Result<()> {
///         Ok(())
///     }
/// }
///
/// impl TaskType for Noop {
///     const TYPE: &'static str = "noop";
/// }
/// ```
pub trait TaskType: Task + Default + 'static {
    /// Identifier persisted in the task row's `task_class` column.
    const TYPE: &'static str;
}

/// Factory function type producing a fresh executable per attempt
pub type TaskFactory = Box<dyn Fn() -> Box<dyn Task> + Send + Sync>;

/// Registry of task factories, populated at process start.
pub struct TaskRegistry {
    factories: HashMap<String, TaskFactory>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a task type.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = TaskRegistry::new();
    /// registry.register::<SendEmailTask>();
    /// ```
    pub fn register<T: TaskType>(&mut self) {
        self.register_factory(T::TYPE, || Box::new(T::default()));
    }

    /// Register an explicit factory under a task-type identifier.
    pub fn register_factory(
        &mut self,
        task_class: &str,
        factory: impl Fn() -> Box<dyn Task> + Send + Sync + 'static,
    ) {
        self.factories
            .insert(task_class.to_string(), Box::new(factory));
    }

    /// Check if a task type is registered
    pub fn contains(&self, task_class: &str) -> bool {
        self.factories.contains_key(task_class)
    }

    /// Produce an executable for a stored task-type identifier.
    pub fn resolve(&self, task_class: &str) -> Result<Box<dyn Task>, RegistryError> {
        let factory = self
            .factories
            .get(task_class)
            .ok_or_else(|| RegistryError::UnknownTaskType(task_class.to_string()))?;

        Ok(factory())
    }

    /// Get the number of registered task types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Get all registered task-type names
    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Task type not registered; consumes an attempt like any execution failure
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),
}
