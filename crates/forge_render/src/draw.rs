//! Frame draw list
//!
//! Draws accumulate per tick and are sorted ascending by (group, pipeline,
//! mesh) before recording. The sort is purely a batching key so consecutive
//! draws share pipeline and vertex-buffer binds; it performs no distance or
//! translucency ordering. Callers that need ordered transparency assign
//! groups accordingly. The list is cleared unconditionally every tick.

use crate::registry::{MeshHandle, PipelineHandle, UniformGroupHandle};

/// One requested draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCommand {
    /// Caller-assigned ordering group; lower groups record first
    pub group: u32,
    pub pipeline: PipelineHandle,
    pub mesh: MeshHandle,
    pub uniforms: UniformGroupHandle,
}

/// The draws accumulated for the current tick.
#[derive(Debug, Default)]
pub struct DrawList {
    commands: Vec<DrawCommand>,
}

impl DrawList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: DrawCommand) {
        self.commands.push(command);
    }

    /// Sort into batching order and return the commands for recording.
    pub fn sorted(&mut self) -> &[DrawCommand] {
        self.commands
            .sort_by_key(|c| (c.group, c.pipeline, c.mesh));
        &self.commands
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn keys<K: slotmap::Key>(n: usize) -> Vec<K> {
        let mut slots: SlotMap<K, ()> = SlotMap::with_key();
        (0..n).map(|_| slots.insert(())).collect()
    }

    #[test]
    fn sort_groups_then_pipelines_then_meshes() {
        let pipelines: Vec<PipelineHandle> = keys(2);
        let meshes: Vec<MeshHandle> = keys(2);
        let groups: Vec<UniformGroupHandle> = keys(1);

        let mut list = DrawList::new();
        list.push(DrawCommand {
            group: 1,
            pipeline: pipelines[0],
            mesh: meshes[0],
            uniforms: groups[0],
        });
        list.push(DrawCommand {
            group: 0,
            pipeline: pipelines[1],
            mesh: meshes[1],
            uniforms: groups[0],
        });
        list.push(DrawCommand {
            group: 0,
            pipeline: pipelines[0],
            mesh: meshes[1],
            uniforms: groups[0],
        });
        list.push(DrawCommand {
            group: 0,
            pipeline: pipelines[0],
            mesh: meshes[0],
            uniforms: groups[0],
        });

        let sorted = list.sorted();
        assert_eq!(sorted[0].group, 0);
        assert_eq!((sorted[0].pipeline, sorted[0].mesh), (pipelines[0], meshes[0]));
        assert_eq!((sorted[1].pipeline, sorted[1].mesh), (pipelines[0], meshes[1]));
        assert_eq!(sorted[2].pipeline, pipelines[1]);
        assert_eq!(sorted[3].group, 1);
    }

    #[test]
    fn sort_is_deterministic_for_equal_keys() {
        let pipelines: Vec<PipelineHandle> = keys(1);
        let meshes: Vec<MeshHandle> = keys(1);
        let groups: Vec<UniformGroupHandle> = keys(2);

        let mut list = DrawList::new();
        for &uniforms in &[groups[0], groups[1], groups[0]] {
            list.push(DrawCommand {
                group: 0,
                pipeline: pipelines[0],
                mesh: meshes[0],
                uniforms,
            });
        }
        // Equal batching keys keep submission order (stable sort).
        let sorted: Vec<_> = list.sorted().to_vec();
        assert_eq!(sorted[0].uniforms, groups[0]);
        assert_eq!(sorted[1].uniforms, groups[1]);
        assert_eq!(sorted[2].uniforms, groups[0]);
    }

    #[test]
    fn clear_empties_the_list() {
        let pipelines: Vec<PipelineHandle> = keys(1);
        let meshes: Vec<MeshHandle> = keys(1);
        let groups: Vec<UniformGroupHandle> = keys(1);

        let mut list = DrawList::new();
        list.push(DrawCommand {
            group: 0,
            pipeline: pipelines[0],
            mesh: meshes[0],
            uniforms: groups[0],
        });
        assert_eq!(list.len(), 1);
        list.clear();
        assert!(list.is_empty());
    }
}
