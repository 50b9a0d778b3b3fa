//! Test utilities for strata-lib.
//!
//! Helpers for building small plans out of closure commands.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use crate::command::{CommandError, FnCommand};
use crate::value::Value;

/// A counter shared between a test and the commands it builds, used to
/// assert how many times commands actually ran.
#[derive(Debug, Clone, Default)]
pub struct RunCounter(Arc<AtomicUsize>);

impl RunCounter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }

  pub fn bump(&self) {
    self.0.fetch_add(1, Ordering::SeqCst);
  }
}

/// A command that returns a constant value.
pub fn constant(value: Value, counter: &RunCounter) -> FnCommand {
  let counter = counter.clone();
  let body = format!("constant({})", value);
  FnCommand::new(body, move |_| {
    counter.bump();
    Ok(value.clone())
  })
}

/// A command that adds `n` to the numeric input `name`.
pub fn add(name: &str, n: i64, counter: &RunCounter) -> FnCommand {
  let counter = counter.clone();
  let input = name.to_string();
  FnCommand::new(format!("{} + {}", name, n), move |ctx| {
    counter.bump();
    let x = ctx
      .get(&input)?
      .as_i64()
      .ok_or_else(|| CommandError::failed(format!("{} is not an integer", input)))?;
    Ok(json!(x + n))
  })
  .reads([name])
}

/// A command that always fails.
pub fn failing(message: &str) -> FnCommand {
  let message = message.to_string();
  FnCommand::new(format!("fail({})", message), move |_| Err(CommandError::failed(message.clone())))
}
