//! Identity-preserving duplication of a tube graph.
//!
//! The cloner keeps a map from original [`TubeId`]s to the ids of their copies.
//! A tube is copied at most once: every later request for the same original
//! returns the id already handed out, so shared nodes stay shared and cycles
//! terminate. The id is registered before the tube's own `copy` runs, which is
//! what lets a tube on a cycle ask for a copy of itself indirectly.

use crate::error::PipelineError;
use crate::tube::{Tube, TubeId, Tubeline};
use std::collections::HashMap;
use tracing::debug;

/// Copies tubes out of a source [`Tubeline`] into a new arena.
pub struct TubeCloner<'a> {
    source: &'a Tubeline,
    copies: Vec<Option<Box<dyn Tube>>>,
    master2copy: HashMap<TubeId, TubeId>,
}

impl<'a> TubeCloner<'a> {
    pub fn new(source: &'a Tubeline) -> Self {
        Self {
            source,
            copies: Vec::with_capacity(source.len()),
            master2copy: HashMap::new(),
        }
    }

    /// Id of the copy of `original`, creating it on first request.
    pub fn copy(&mut self, original: TubeId) -> Result<TubeId, PipelineError> {
        if let Some(&copy) = self.master2copy.get(&original) {
            return Ok(copy);
        }

        let source: &'a Tubeline = self.source;
        let tube = source
            .get(original)
            .ok_or_else(|| PipelineError::InvalidGraph(format!("no tube {} to copy", original)))?;

        let slot = TubeId(self.copies.len());
        self.copies.push(None);
        self.master2copy.insert(original, slot);

        let copy = tube.copy(self)?;
        self.copies[slot.0] = Some(copy);
        Ok(slot)
    }

    /// Id already assigned to the copy of `original`, if any.
    pub fn copy_of(&self, original: TubeId) -> Option<TubeId> {
        self.master2copy.get(&original).copied()
    }

    /// Copy everything reachable from the source's head.
    pub fn clone_tubeline(mut self) -> Result<Tubeline, PipelineError> {
        let head = self.copy(self.source.head())?;
        let tubes = self
            .copies
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| PipelineError::InvalidGraph(format!("copy of tube #{} never completed", index)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(tubes = tubes.len(), "Cloned tubeline");
        Tubeline::from_parts(tubes, head)
    }
}
