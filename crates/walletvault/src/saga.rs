//! Commit list with reverse-order compensation for multi-store operations.
//!
//! Each completed step registers an undo future. Futures are lazy, so nothing
//! runs unless the saga rolls back. A failed undo is logged and skipped; it
//! never replaces the error that triggered the rollback.

use std::{fmt::Display, future::Future, pin::Pin};

type Undo<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + 'a>>;

#[must_use = "a saga must be committed or rolled back"]
pub struct Saga<'a> {
    op: &'static str,
    undo: Vec<(&'static str, Undo<'a>)>,
}

impl std::fmt::Debug for Saga<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saga")
            .field("op", &self.op)
            .field("steps", &self.undo.iter().map(|(s, _)| *s).collect::<Vec<_>>())
            .finish()
    }
}

impl<'a> Saga<'a> {
    pub fn new(op: &'static str) -> Self {
        Self { op, undo: vec![] }
    }

    /// Register the compensation for a step that is about to take effect.
    pub fn push<E: Display>(
        &mut self,
        step: &'static str,
        undo: impl Future<Output = Result<(), E>> + 'a,
    ) {
        self.undo.push((
            step,
            Box::pin(async move { undo.await.map_err(|e| e.to_string()) }),
        ));
    }

    /// Pass `result` through; on error, roll back first.
    pub async fn check<T, E: Display>(&mut self, result: Result<T, E>) -> Result<T, E> {
        if let Err(e) = &result {
            tracing::debug!(op = self.op, error = %e, "step failed, rolling back");
            self.rollback().await;
        }
        result
    }

    /// Run every registered undo, newest first.
    pub async fn rollback(&mut self) {
        while let Some((step, undo)) = self.undo.pop() {
            match undo.await {
                Ok(()) => tracing::debug!(op = self.op, step, "rolled back"),
                Err(e) => tracing::warn!(op = self.op, step, error = %e, "rollback step failed"),
            }
        }
    }

    /// Keep every step; drops the compensations unrun.
    pub fn commit(self) {
        tracing::debug!(op = self.op, steps = self.undo.len(), "committed");
    }
}
