mod local;
mod tensor;

use std::{cell::RefCell, collections::HashMap, fmt, rc::Rc};

pub use local::LocalSession;
pub use tensor::Tensor;

use crate::{PolicyErr, Result};

/// The name of a node, variable or operation, defined in a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpHandle(String);

impl OpHandle {
    /// Creates the handle of the node `name` inside `scope`.
    pub fn scoped(scope: &str, name: &str) -> Self {
        if scope.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{scope}/{name}"))
        }
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The inputs of a single session run, keyed by placeholder name.
#[derive(Debug, Default, Clone)]
pub struct Feeds {
    tensors: HashMap<String, Tensor>,
}

impl Feeds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, placeholder: &OpHandle, tensor: impl Into<Tensor>) {
        self.tensors
            .insert(placeholder.name().to_string(), tensor.into());
    }

    /// Returns the tensor fed to `placeholder`.
    ///
    /// # Returns
    /// A `PolicyErr::MissingFeed` error if nothing was fed to it.
    pub fn get(&self, placeholder: &OpHandle) -> Result<&Tensor> {
        self.tensors
            .get(placeholder.name())
            .ok_or_else(|| PolicyErr::MissingFeed {
                name: placeholder.name().to_string(),
            })
    }

    pub fn contains(&self, placeholder: &OpHandle) -> bool {
        self.tensors.contains_key(placeholder.name())
    }
}

/// The parameter state held by a session.
#[derive(Debug, Default)]
pub struct Variables {
    values: HashMap<String, Tensor>,
    run: u64,
}

impl Variables {
    /// Identifies the run being evaluated, every op fetched in the same run sees the same id.
    pub fn run(&self) -> u64 {
        self.run
    }

    fn begin_run(&mut self) {
        self.run = self.run.wrapping_add(1);
    }

    pub fn get(&self, handle: &OpHandle) -> Result<&Tensor> {
        self.values
            .get(handle.name())
            .ok_or_else(|| unknown(handle))
    }

    pub fn get_mut(&mut self, handle: &OpHandle) -> Result<&mut Tensor> {
        self.values
            .get_mut(handle.name())
            .ok_or_else(|| unknown(handle))
    }

    fn contains(&self, handle: &OpHandle) -> bool {
        self.values.contains_key(handle.name())
    }

    fn insert(&mut self, handle: &OpHandle, tensor: Tensor) {
        self.values.insert(handle.name().to_string(), tensor);
    }
}

fn unknown(handle: &OpHandle) -> PolicyErr {
    PolicyErr::UnknownNode {
        name: handle.name().to_string(),
    }
}

/// A value computed once per run and shared by every op fetched in it.
#[derive(Debug)]
pub struct RunCache<T> {
    slot: RefCell<Option<(u64, Rc<T>)>>,
}

impl<T> Default for RunCache<T> {
    fn default() -> Self {
        Self {
            slot: RefCell::new(None),
        }
    }
}

impl<T> RunCache<T> {
    /// Returns the value cached for `run`, computing it with `f` if there's none.
    ///
    /// # Returns
    /// The error of `f`, nothing is cached in that case.
    pub fn get_or_try_insert_with<F>(&self, run: u64, f: F) -> Result<Rc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Some((cached, value)) = &*self.slot.borrow() {
            if *cached == run {
                return Ok(Rc::clone(value));
            }
        }

        let value = Rc::new(f()?);
        *self.slot.borrow_mut() = Some((run, Rc::clone(&value)));
        Ok(value)
    }

    /// Drops the cached value, the next lookup computes it again.
    pub fn clear(&self) {
        self.slot.borrow_mut().take();
    }
}

/// A computation evaluated by a session: reads the feeds, reads or writes the variables and
/// produces a single tensor.
pub trait Operation {
    fn eval(&mut self, vars: &mut Variables, feeds: &Feeds) -> Result<Tensor>;
}

impl<F> Operation for F
where
    F: FnMut(&mut Variables, &Feeds) -> Result<Tensor>,
{
    fn eval(&mut self, vars: &mut Variables, feeds: &Feeds) -> Result<Tensor> {
        self(vars, feeds)
    }
}

/// The runtime context that holds a model's parameters and executes its operations.
///
/// A session is shared by every policy of a training run. It's never owned by a policy, it's
/// handed to each operation that needs it.
pub trait Session {
    /// Defines a variable with an initial value.
    ///
    /// # Returns
    /// The handle of the variable or `PolicyErr::DuplicateNode` if the name is taken.
    fn define_variable(&mut self, handle: OpHandle, init: Tensor) -> Result<OpHandle>;

    /// Defines an operation.
    ///
    /// # Returns
    /// The handle of the operation or `PolicyErr::DuplicateNode` if the name is taken.
    fn define_op(&mut self, handle: OpHandle, op: Box<dyn Operation>) -> Result<OpHandle>;

    /// Runs the given nodes in order and returns their values.
    ///
    /// Fetching a variable returns its current value, fetching an operation evaluates it.
    ///
    /// # Arguments
    /// * `fetches` - The nodes to run.
    /// * `feeds` - The placeholder values for this run.
    fn run(&mut self, fetches: &[&OpHandle], feeds: &Feeds) -> Result<Vec<Tensor>>;

    /// Whether a node with that name exists.
    fn contains(&self, handle: &OpHandle) -> bool;
}
