//! Scoped value environment.
//!
//! Scopes form a stack; index 0 is the global scope.  Function calls swap
//! the visible chain for `[global, fresh]`, saving the caller's scopes on a
//! separate stack so recursion restores them correctly.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("cannot reassign constant '{0}'")]
    Constant(String),
    #[error("'{0}' is already defined in this scope")]
    Duplicate(String),
    #[error("undefined variable '{0}'")]
    NotFound(String),
}

#[derive(Debug, Default)]
struct Scope {
    vars: HashMap<String, Value>,
    consts: HashSet<String>,
}

#[derive(Debug)]
pub struct Environment {
    /// Visible chain, innermost last.  `scopes[0]` is the global scope.
    scopes: Vec<Scope>,
    /// Caller scope chains suspended by function calls.
    saved: Vec<Vec<Scope>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            scopes: vec![Scope::default()],
            saved: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Walk from innermost scope toward the global scope.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.vars.get(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Update in place where the name already exists; create in the
    /// innermost scope only if no ancestor has it.  This makes loop
    /// counters and other local-looking mutations update the scope they
    /// were first defined in.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), EnvError> {
        for scope in self.scopes.iter_mut().rev() {
            if scope.consts.contains(name) {
                return Err(EnvError::Constant(name.to_owned()));
            }
            if let Some(slot) = scope.vars.get_mut(name) {
                *slot = value;
                return Ok(());
            }
        }
        self.innermost().vars.insert(name.to_owned(), value);
        Ok(())
    }

    /// Bind a constant in the innermost scope.  Errors if the name is
    /// already bound there.
    pub fn set_const(&mut self, name: &str, value: Value) -> Result<(), EnvError> {
        let scope = self.innermost();
        if scope.vars.contains_key(name) {
            return Err(EnvError::Duplicate(name.to_owned()));
        }
        scope.vars.insert(name.to_owned(), value);
        scope.consts.insert(name.to_owned());
        Ok(())
    }

    /// Bind directly in the global scope.
    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), EnvError> {
        let global = &mut self.scopes[0];
        if global.consts.contains(name) {
            return Err(EnvError::Constant(name.to_owned()));
        }
        global.vars.insert(name.to_owned(), value);
        Ok(())
    }

    /// Always create (or update) in the innermost scope; shadows outer
    /// names.  Used to bind function parameters and loop variables.
    pub fn set_local(&mut self, name: &str, value: Value) -> Result<(), EnvError> {
        let scope = self.innermost();
        if scope.consts.contains(name) {
            return Err(EnvError::Constant(name.to_owned()));
        }
        scope.vars.insert(name.to_owned(), value);
        Ok(())
    }

    /// Remove a binding from the scope where it is found.
    pub fn delete(&mut self, name: &str) -> Result<(), EnvError> {
        for scope in self.scopes.iter_mut().rev() {
            if scope.consts.contains(name) {
                return Err(EnvError::Constant(name.to_owned()));
            }
            if scope.vars.remove(name).is_some() {
                return Ok(());
            }
        }
        Err(EnvError::NotFound(name.to_owned()))
    }

    // -----------------------------------------------------------------------
    // Scope management
    // -----------------------------------------------------------------------

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub fn pop_scope(&mut self) {
        // The global scope is never popped.
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Enter a function: the fresh scope's parent is the GLOBAL scope, not
    /// the caller.  The caller's chain is saved for `pop_function_scope`.
    pub fn push_function_scope(&mut self) {
        let caller_tail = self.scopes.split_off(1);
        self.saved.push(caller_tail);
        self.scopes.push(Scope::default());
    }

    /// Leave a function and restore the caller's scope chain.
    pub fn pop_function_scope(&mut self) {
        self.scopes.truncate(1);
        if let Some(tail) = self.saved.pop() {
            self.scopes.extend(tail);
        }
    }

    fn innermost(&mut self) -> &mut Scope {
        self.scopes
            .last_mut()
            .expect("environment always has a global scope")
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
