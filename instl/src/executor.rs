// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Executor (component G): runs a batch's operations with per-op
//! enter/exit timing, structured error context, and an ignore/retry policy.
//!
//! Every operation is a tiny state machine: `new -> enter -> call -> exit ->
//! done`, with every exit path (success, ignored error, or surfaced error)
//! guaranteed to run the operation's cleanup.

use std::time::{Duration, Instant};

use crate::batch::{BatchAccumulator, Op, Section};

/// What an operation actually does. Kept separate from [`Op`]'s tree
/// metadata so the executor can dispatch on it without downcasting.
pub trait Action {
    fn enter(&mut self, _ctx: &mut Context) {}
    fn call(&mut self, ctx: &mut Context) -> Result<(), ActionError>;
    fn exit(&mut self, _ctx: &mut Context, _outcome: &Result<(), ActionError>) {}
}

/// Raised by an [`Action::call`]. Carries the data the executor needs to
/// build [`ErrorDict`] without the action itself knowing about stage paths.
#[derive(Debug)]
pub struct ActionError {
    pub message: String,
    pub doing: Option<String>,
    pub ignorable: bool,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            doing: None,
            ignorable: false,
        }
    }

    pub fn doing(mut self, doing: impl Into<String>) -> Self {
        self.doing = Some(doing.into());
        self
    }

    pub fn ignorable(mut self) -> Self {
        self.ignorable = true;
        self
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActionError {}

/// Per-run, mutable state threaded through every operation.
pub struct Context {
    pub stage: Vec<String>,
    pub running_progress: u64,
    pub total_progress: u64,
    pub report_own_progress: bool,
    pub cwd: std::path::PathBuf,
}

impl Context {
    pub fn new(total_progress: u64) -> Self {
        Self {
            stage: Vec::new(),
            running_progress: 0,
            total_progress,
            report_own_progress: true,
            cwd: std::env::current_dir().unwrap_or_default(),
        }
    }

    fn push_stage(&mut self, name: &str) {
        self.stage.push(name.to_string());
    }

    fn pop_stage(&mut self) {
        self.stage.pop();
    }

    fn stage_path(&self) -> String {
        self.stage.join(".")
    }
}

/// Enriched, loggable context captured at the moment an operation's error
/// escapes past every ignore policy.
#[derive(Debug)]
pub struct ErrorDict {
    pub doing: Option<String>,
    pub major_stage: String,
    pub stage: String,
    pub op_repr: String,
    pub running_progress: u64,
    pub total_progress: u64,
    pub cwd: std::path::PathBuf,
    pub elapsed: Duration,
    pub message: String,
}

impl std::fmt::Display for ErrorDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed at stage '{}' (doing: {}) after {:?}: {}",
            self.op_repr,
            self.stage,
            self.doing.as_deref().unwrap_or("?"),
            self.elapsed,
            self.message
        )
    }
}

/// Surfaced when an operation's error is not caught by any ignore policy.
#[derive(Debug)]
pub struct ExecutionError(pub ErrorDict);

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ExecutionError {}

/// Run every essential operation of `batch` in fixed section order,
/// dispatching each op's action via `dispatch`. `dispatch` maps an [`Op`]
/// to the [`Action`] it should run; ops without an action (pure context
/// managers like `Kind::Group`) pass `None`.
pub fn run(
    batch: &mut BatchAccumulator,
    mut dispatch: impl FnMut(&Op) -> Option<Box<dyn Action>>,
) -> Result<(), ExecutionError> {
    let total = batch.total_progress();
    let mut ctx = Context::new(total);

    let sections: Vec<(Section, Op)> = batch.iter_essential().map(|(s, op)| (s, op.clone())).collect();
    for (_section, op) in &sections {
        run_op(op, &mut ctx, &mut dispatch)?;
    }
    Ok(())
}

fn run_op(op: &Op, ctx: &mut Context, dispatch: &mut impl FnMut(&Op) -> Option<Box<dyn Action>>) -> Result<(), ExecutionError> {
    if op.is_anonymous {
        for child in &op.children {
            run_op(child, ctx, dispatch)?;
        }
        return Ok(());
    }
    if !op.essential && !op.children.iter().any(|c| c.essential) {
        return Ok(());
    }

    let label = format!("{:?}", op.kind);
    ctx.push_stage(&label);
    ctx.running_progress += op.own_progress_count;
    if ctx.report_own_progress {
        log::info!("Progress {} of {}", ctx.running_progress, ctx.total_progress);
    }

    let start = Instant::now();
    let mut action = dispatch(op);

    let outcome: Result<(), ActionError> = if op.call_call {
        if let Some(action) = action.as_mut() {
            action.enter(ctx);
            let result = action.call(ctx);
            action.exit(ctx, &result);
            result
        } else {
            Ok(())
        }
    } else {
        Ok(())
    };

    let mut child_result = Ok(());
    if op.is_context_manager && outcome.is_ok() {
        for child in &op.children {
            if let Err(err) = run_op(child, ctx, dispatch) {
                child_result = Err(err);
                break;
            }
        }
    }

    match (outcome, child_result) {
        (Ok(()), Ok(())) => {
            ctx.pop_stage();
            Ok(())
        }
        (Err(err), _) => {
            let dict = ErrorDict {
                doing: err.doing.clone(),
                major_stage: ctx.stage.first().cloned().unwrap_or_default(),
                stage: ctx.stage_path(),
                op_repr: label,
                running_progress: ctx.running_progress,
                total_progress: ctx.total_progress,
                cwd: ctx.cwd.clone(),
                elapsed: start.elapsed(),
                message: err.message.clone(),
            };
            if err.ignorable {
                log::warn!("{dict}");
                ctx.pop_stage();
                Ok(())
            } else {
                log::error!("{dict}");
                // Stack is deliberately not popped: the outermost handler
                // needs the full stage path still intact.
                Err(ExecutionError(dict))
            }
        }
        (Ok(()), Err(child_err)) => Err(child_err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Kind;

    struct Succeeds;
    impl Action for Succeeds {
        fn call(&mut self, _ctx: &mut Context) -> Result<(), ActionError> {
            Ok(())
        }
    }

    struct Fails;
    impl Action for Fails {
        fn call(&mut self, _ctx: &mut Context) -> Result<(), ActionError> {
            Err(ActionError::new("boom"))
        }
    }

    struct FailsButIgnorable;
    impl Action for FailsButIgnorable {
        fn call(&mut self, _ctx: &mut Context) -> Result<(), ActionError> {
            Err(ActionError::new("meh").ignorable())
        }
    }

    #[test]
    fn successful_batch_runs_every_op() {
        let mut batch = BatchAccumulator::new();
        batch.push(Section::Copy, Op::new(Kind::Copy { source: "a".into(), dest: "b".into() }));
        run(&mut batch, |_| Some(Box::new(Succeeds))).unwrap();
    }

    #[test]
    fn failing_op_surfaces_with_stage_path() {
        let mut batch = BatchAccumulator::new();
        batch.push(Section::Copy, Op::new(Kind::Copy { source: "a".into(), dest: "b".into() }));
        let err = run(&mut batch, |_| Some(Box::new(Fails))).unwrap_err();
        assert!(err.0.stage.contains("Copy"));
    }

    #[test]
    fn ignorable_error_is_suppressed() {
        let mut batch = BatchAccumulator::new();
        batch.push(Section::Remove, Op::new(Kind::Remove { path: "x".into() }));
        run(&mut batch, |_| Some(Box::new(FailsButIgnorable))).unwrap();
    }
}
