//! Show variables, live scopes, and cue conditions
//!
//! A [`VariableList`] holds declarations as authored on a timeline. A
//! [`VariableScope`] is the live, lock-protected set of values a Controller
//! works against; scopes publish changes to subscribers so an Instancer can
//! forward a child's outputs to its parent.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::primitives::VariableId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VariableError {
    #[error("variable not found: {0}")]
    NotFound(VariableId),

    #[error("variable '{name}' holds {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("cannot parse {literal:?} as {expected}")]
    Parse {
        literal: String,
        expected: &'static str,
    },

    #[error("operator {op} is not defined for {kind}")]
    Unsupported { op: Comparison, kind: &'static str },
}

// =============================================================================
// VALUES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Bool(_) => "bool",
        }
    }

    /// Parse a literal into a value of the same kind as `self`
    pub fn parse_like(&self, literal: &str) -> Result<Value, VariableError> {
        let trimmed = literal.trim();
        let parse_error = || VariableError::Parse {
            literal: literal.to_string(),
            expected: self.kind(),
        };

        match self {
            Value::Number(_) => trimmed.parse().map(Value::Number).map_err(|_| parse_error()),
            Value::Bool(_) => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(parse_error()),
            },
            Value::Text(_) => Ok(Value::Text(literal.to_string())),
        }
    }

    fn same_kind(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

// =============================================================================
// DECLARATIONS
// =============================================================================

/// A declared variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: VariableId,
    pub name: String,
    pub initial: Value,
    /// May be overwritten by a parent Instancer at spawn
    #[serde(default)]
    pub input: bool,
    /// Changes are forwarded to a parent Instancer's outlets
    #[serde(default)]
    pub output: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, initial: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            initial,
            input: false,
            output: false,
        }
    }

    pub fn input(mut self) -> Self {
        self.input = true;
        self
    }

    pub fn output(mut self) -> Self {
        self.output = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableList {
    variables: Vec<Variable>,
}

impl VariableList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, variable: Variable) -> VariableId {
        let id = variable.id;
        self.variables.push(variable);
        id
    }

    pub fn get(&self, id: VariableId) -> Option<&Variable> {
        self.variables.iter().find(|v| v.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Overwrite a declaration's initial value, keeping its kind
    pub fn set_initial(&mut self, id: VariableId, value: Value) -> Result<(), VariableError> {
        let variable = self
            .variables
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or(VariableError::NotFound(id))?;
        if !variable.initial.same_kind(&value) {
            return Err(VariableError::TypeMismatch {
                name: variable.name.clone(),
                expected: variable.initial.kind(),
                found: value.kind(),
            });
        }
        variable.initial = value;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

// =============================================================================
// LIVE SCOPE
// =============================================================================

/// Handle returned by [`VariableScope::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ChangeHandler = Arc<dyn Fn(&Variable, &Value) + Send + Sync>;

struct ScopeState {
    values: HashMap<VariableId, Value>,
    subscribers: Vec<(SubscriptionId, ChangeHandler)>,
    next_subscription: u64,
}

/// Live values for one set of declarations
pub struct VariableScope {
    declarations: VariableList,
    state: Mutex<ScopeState>,
}

impl VariableScope {
    pub fn new(declarations: VariableList) -> Arc<Self> {
        let values = declarations
            .iter()
            .map(|v| (v.id, v.initial.clone()))
            .collect();
        Arc::new(Self {
            declarations,
            state: Mutex::new(ScopeState {
                values,
                subscribers: Vec::new(),
                next_subscription: 0,
            }),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(VariableList::new())
    }

    pub fn declarations(&self) -> &VariableList {
        &self.declarations
    }

    pub fn contains(&self, id: VariableId) -> bool {
        self.declarations.get(id).is_some()
    }

    pub fn get(&self, id: VariableId) -> Option<Value> {
        self.state.lock().values.get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Value> {
        let id = self.declarations.by_name(name)?.id;
        self.get(id)
    }

    /// Set a live value, notifying subscribers if it changed
    pub fn set(&self, id: VariableId, value: Value) -> Result<bool, VariableError> {
        let variable = self.declarations.get(id).ok_or(VariableError::NotFound(id))?;
        if !variable.initial.same_kind(&value) {
            return Err(VariableError::TypeMismatch {
                name: variable.name.clone(),
                expected: variable.initial.kind(),
                found: value.kind(),
            });
        }

        let handlers: Vec<ChangeHandler> = {
            let mut state = self.state.lock();
            if state.values.get(&id) == Some(&value) {
                return Ok(false);
            }
            state.values.insert(id, value.clone());
            state.subscribers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };

        for handler in handlers {
            handler(variable, &value);
        }
        Ok(true)
    }

    /// Restore every value to its declared initial value
    pub fn reset(&self) {
        for variable in self.declarations.iter() {
            // Kinds always match their own initial value
            let _ = self.set(variable.id, variable.initial.clone());
        }
    }

    /// Call `handler` after every change to a value in this scope
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Variable, &Value) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;
        state.subscribers.push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|(sub, _)| *sub != id);
        state.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

impl fmt::Debug for VariableScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableScope")
            .field("variables", &self.declarations.len())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Resolve a variable in a local scope, falling back to the globals
pub fn lookup(
    id: VariableId,
    locals: &VariableScope,
    globals: &VariableScope,
) -> Result<Value, VariableError> {
    locals
        .get(id)
        .or_else(|| globals.get(id))
        .ok_or(VariableError::NotFound(id))
}

// =============================================================================
// CONDITIONS & ASSIGNMENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        };
        f.write_str(symbol)
    }
}

/// Guard on a cue: `variable op value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub variable: VariableId,
    pub op: Comparison,
    pub value: Value,
}

impl Condition {
    pub fn new(variable: VariableId, op: Comparison, value: Value) -> Self {
        Self {
            variable,
            op,
            value,
        }
    }

    pub fn evaluate(
        &self,
        locals: &VariableScope,
        globals: &VariableScope,
    ) -> Result<bool, VariableError> {
        let current = lookup(self.variable, locals, globals)?;

        let ordering = match (&current, &self.value) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => {
                return match self.op {
                    Comparison::Eq => Ok(a == b),
                    Comparison::Ne => Ok(a != b),
                    op => Err(VariableError::Unsupported { op, kind: "bool" }),
                };
            }
            (current, expected) => {
                return Err(VariableError::TypeMismatch {
                    name: self.variable.to_string(),
                    expected: current.kind(),
                    found: expected.kind(),
                });
            }
        };

        // NaN compares unequal to everything
        let Some(ordering) = ordering else {
            return Ok(self.op == Comparison::Ne);
        };

        Ok(match self.op {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Ne => ordering != Ordering::Equal,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Le => ordering != Ordering::Greater,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Ge => ordering != Ordering::Less,
        })
    }
}

/// `variable := value`, applied when a cue fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub variable: VariableId,
    pub value: Value,
}

impl Assignment {
    /// Write to the local scope if it declares the variable, else to the globals
    pub fn apply(
        &self,
        locals: &VariableScope,
        globals: &VariableScope,
    ) -> Result<bool, VariableError> {
        if locals.contains(self.variable) {
            locals.set(self.variable, self.value.clone())
        } else {
            globals.set(self.variable, self.value.clone())
        }
    }
}
