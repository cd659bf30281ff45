//! Registry of live Controllers
//!
//! [`Instances`] owns the root Controller for a loaded show. Nested
//! Controllers are owned by the Instancer players that spawned them, so the
//! registry discovers them by walking the tree rather than tracking them.
//! Paths name each Controller by the tracks leading to it: `root`,
//! `root/crowd`, `root/crowd/extras`. A track sharing its name with an
//! earlier track of the same timeline is addressed as `crowd#2`.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::capacity::CapacityError;
use crate::controller::Controller;
use crate::primitives::{PlaybackState, RunMode, Time, TimelineId};
use crate::show::ShowContext;
use crate::variables::VariableScope;

pub const ROOT_PATH: &str = "root";

/// Snapshot of one live Controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceInfo {
    pub path: String,
    pub timeline: TimelineId,
    pub timeline_name: String,
    pub state: PlaybackState,
    pub position: Time,
    pub depth: usize,
}

pub struct Instances {
    context: Arc<ShowContext>,
    root: Controller,
}

impl Instances {
    /// Create the root Controller against the show's root timeline
    pub fn new(context: Arc<ShowContext>, run_mode: RunMode) -> Self {
        let timeline = Arc::clone(context.root_timeline());
        let locals = VariableScope::new(timeline.variables.clone());
        let root = Controller::new(timeline, Arc::clone(&context), locals, run_mode);
        Self { context, root }
    }

    pub fn context(&self) -> &Arc<ShowContext> {
        &self.context
    }

    pub fn root(&self) -> &Controller {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Controller {
        &mut self.root
    }

    /// Advance the whole tree; children are driven through their players
    pub fn update(&mut self, diff: Time) {
        self.root.update(diff);
    }

    /// Visit every live Controller, parents before children
    pub fn walk<F>(&self, mut visit: F)
    where
        F: FnMut(&str, usize, &Controller),
    {
        fn descend<F>(path: &str, depth: usize, controller: &Controller, visit: &mut F)
        where
            F: FnMut(&str, usize, &Controller),
        {
            visit(path, depth, controller);
            for (track, child) in controller.children() {
                let child_path = format!("{path}/{track}");
                descend(&child_path, depth + 1, child, visit);
            }
        }

        descend(ROOT_PATH, 0, &self.root, &mut visit);
    }

    pub fn list(&self) -> Vec<InstanceInfo> {
        let mut out = Vec::new();
        self.walk(|path, depth, controller| {
            out.push(InstanceInfo {
                path: path.to_string(),
                timeline: controller.timeline().id,
                timeline_name: controller.timeline().name.clone(),
                state: controller.state(),
                position: controller.position(),
                depth,
            });
        });
        out
    }

    pub fn find(&self, path: &str) -> Option<&Controller> {
        let mut segments = path.split('/');
        if segments.next()? != ROOT_PATH {
            return None;
        }

        let mut current = &self.root;
        for segment in segments {
            current = current
                .children()
                .find(|(track, _)| track == segment)
                .map(|(_, child)| child)?;
        }
        Some(current)
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Controller> {
        let mut segments = path.split('/');
        if segments.next()? != ROOT_PATH {
            return None;
        }

        let mut current = &mut self.root;
        for segment in segments {
            current = current.child_mut(segment)?;
        }
        Some(current)
    }

    /// Show-closed teardown: stop the tree and restore every capacity
    pub fn close(&mut self) -> Result<(), CapacityError> {
        self.root.stop();
        info!(show = %self.context.name(), "instances closed");
        self.context.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::show::Show;
    use crate::timeline::Timeline;

    fn instances() -> Instances {
        let mut show = Show::new("gala");
        show.add_timeline(Timeline::new("main"));
        Instances::new(show.open().unwrap(), RunMode::Master)
    }

    #[test]
    fn test_root_is_listed() {
        let instances = instances();
        let list = instances.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].path, "root");
        assert_eq!(list[0].timeline_name, "main");
        assert_eq!(list[0].state, PlaybackState::Stopped);
    }

    #[test]
    fn test_find_rejects_foreign_paths() {
        let mut instances = instances();
        assert!(instances.find("root").is_some());
        assert!(instances.find("main").is_none());
        assert!(instances.find("root/missing").is_none());
        assert!(instances.find_mut("root").is_some());
    }

    #[test]
    fn test_close_stops_root() {
        let mut instances = instances();
        instances.root_mut().play().unwrap();
        instances.update(Time(20));
        assert_eq!(instances.root().position(), Time(20));

        instances.close().unwrap();
        assert_eq!(instances.root().state(), PlaybackState::Stopped);
    }
}
