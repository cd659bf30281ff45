//! Show document and the explicit runtime context built from it
//!
//! [`Show`] is the mutable, authored document. [`Show::open`] freezes it into
//! a [`ShowContext`] that is handed to everything constructing Controllers or
//! Instancer players. There is no process-wide registry: the context lives
//! from "show loaded" until [`ShowContext::close`].

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::capacity::{Capacities, Capacity, CapacityDefinition, CapacityError};
use crate::primitives::{CapacityId, TimelineId, VariableId};
use crate::timeline::Timeline;
use crate::variables::{Variable, VariableList, VariableScope};

#[derive(Debug, Error)]
pub enum ShowError {
    #[error("show has no root timeline")]
    NoRoot,

    #[error("root timeline {0} is not part of the show")]
    RootNotFound(TimelineId),

    #[error("timeline {0} was added twice")]
    DuplicateTimeline(TimelineId),
}

/// Authored show: timelines, capacities, and global variables
pub struct Show {
    pub name: String,
    timelines: Vec<Timeline>,
    root: Option<TimelineId>,
    capacities: Capacities,
    globals: VariableList,
}

impl Show {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timelines: Vec::new(),
            root: None,
            capacities: Capacities::new(),
            globals: VariableList::new(),
        }
    }

    /// Use an existing collection, e.g. one created with a View attached
    pub fn with_capacities(mut self, capacities: Capacities) -> Self {
        self.capacities = capacities;
        self
    }

    /// Add a timeline; the first one added becomes the root
    pub fn add_timeline(&mut self, timeline: Timeline) -> TimelineId {
        let id = timeline.id;
        self.root.get_or_insert(id);
        self.timelines.push(timeline);
        id
    }

    pub fn set_root(&mut self, id: TimelineId) {
        self.root = Some(id);
    }

    pub fn add_capacity(&mut self, definition: CapacityDefinition) -> Arc<Capacity> {
        self.capacities.add(definition)
    }

    pub fn capacities_mut(&mut self) -> &mut Capacities {
        &mut self.capacities
    }

    pub fn add_global(&mut self, variable: Variable) -> VariableId {
        self.globals.add(variable)
    }

    /// Freeze the document into a runtime context
    pub fn open(self) -> Result<Arc<ShowContext>, ShowError> {
        let root = self.root.ok_or(ShowError::NoRoot)?;

        let mut timelines = HashMap::with_capacity(self.timelines.len());
        for timeline in self.timelines {
            let id = timeline.id;
            if timelines.insert(id, Arc::new(timeline)).is_some() {
                return Err(ShowError::DuplicateTimeline(id));
            }
        }
        if !timelines.contains_key(&root) {
            return Err(ShowError::RootNotFound(root));
        }

        info!(
            show = %self.name,
            timelines = timelines.len(),
            capacities = self.capacities.len(),
            "show opened"
        );

        Ok(Arc::new(ShowContext {
            name: self.name,
            timelines,
            root,
            capacities: self.capacities,
            globals: VariableScope::new(self.globals),
        }))
    }
}

/// Everything a Controller needs from the loaded show
pub struct ShowContext {
    name: String,
    timelines: HashMap<TimelineId, Arc<Timeline>>,
    root: TimelineId,
    capacities: Capacities,
    globals: Arc<VariableScope>,
}

impl ShowContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeline(&self, id: TimelineId) -> Option<&Arc<Timeline>> {
        self.timelines.get(&id)
    }

    pub fn root_timeline(&self) -> &Arc<Timeline> {
        // Presence checked in Show::open
        &self.timelines[&self.root]
    }

    pub fn timelines(&self) -> impl Iterator<Item = &Arc<Timeline>> {
        self.timelines.values()
    }

    pub fn capacities(&self) -> &Capacities {
        &self.capacities
    }

    pub fn capacity(&self, id: CapacityId) -> Option<&Arc<Capacity>> {
        self.capacities.get(id)
    }

    pub fn globals(&self) -> &Arc<VariableScope> {
        &self.globals
    }

    /// Show-closed teardown: restore every capacity
    ///
    /// Call after all Controllers have stopped; a capacity still held is
    /// reported and left untouched.
    pub fn close(&self) -> Result<(), CapacityError> {
        info!(show = %self.name, "show closed");
        self.capacities.reset_all()
    }
}
