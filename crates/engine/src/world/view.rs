//! Viewer regions of interest.
//!
//! Every viewer (a player or a spectator) sees a square window of chunks
//! around the chunk it stands in. The union of those windows is what must
//! stay resident. When nobody is connected, the world spawn stands in as a
//! fallback viewer so the spawn area stays warm.

use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};

use super::position::{BlockPos, ChunkPos};

new_key_type! {
    /// Handle for a tracked viewer.
    pub struct ViewerId;
}

/// Axis-aligned chunk rectangle: `start` inclusive, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRegion {
    pub start: ChunkPos,
    pub end: ChunkPos,
}

impl ViewRegion {
    /// The window of `distance` chunks around `center` on every side.
    pub fn around(center: ChunkPos, distance: u32) -> Self {
        let d = distance.min(i32::MAX as u32) as i32;
        Self {
            start: ChunkPos::new(center.x.saturating_sub(d), center.y.saturating_sub(d)),
            end: ChunkPos::new(
                center.x.saturating_add(d).saturating_add(1),
                center.y.saturating_add(d).saturating_add(1),
            ),
        }
    }

    #[inline]
    pub fn contains(&self, pos: ChunkPos) -> bool {
        pos.x >= self.start.x && pos.x < self.end.x && pos.y >= self.start.y && pos.y < self.end.y
    }

    pub fn width(&self) -> u64 {
        (self.end.x as i64 - self.start.x as i64) as u64
    }

    pub fn height(&self) -> u64 {
        (self.end.y as i64 - self.start.y as i64) as u64
    }

    pub fn area(&self) -> u64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> ChunkPos {
        ChunkPos::new(
            (self.start.x as i64 + (self.width() as i64 - 1).max(0) / 2) as i32,
            (self.start.y as i64 + (self.height() as i64 - 1).max(0) / 2) as i32,
        )
    }

    /// Every position in the region, row by row.
    pub fn positions(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        (self.start.y..self.end.y)
            .flat_map(move |y| (self.start.x..self.end.x).map(move |x| ChunkPos::new(x, y)))
    }

    /// Every position in the region, nearest to the center first.
    pub fn positions_nearest_first(&self) -> Vec<ChunkPos> {
        let center = self.center();
        let mut out: Vec<ChunkPos> = self.positions().collect();
        out.sort_by_key(|p| {
            let dx = (p.x as i64 - center.x as i64).abs();
            let dy = (p.y as i64 - center.y as i64).abs();
            (dx.max(dy), dx + dy)
        });
        out
    }
}

/// What kind of viewer holds a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerKind {
    Player(String),
    Spectator,
}

#[derive(Debug, Clone)]
pub struct Viewer {
    pub kind: ViewerKind,
    pub center: ChunkPos,
    pub region: ViewRegion,
}

/// Tracks every viewer's region and the spawn fallback.
pub struct ViewTracker {
    viewers: SlotMap<ViewerId, Viewer>,
    view_distance: u32,
    spawn: Option<ChunkPos>,
}

impl ViewTracker {
    pub fn new(view_distance: u32) -> Self {
        Self {
            viewers: SlotMap::with_key(),
            view_distance,
            spawn: None,
        }
    }

    pub fn view_distance(&self) -> u32 {
        self.view_distance
    }

    /// Change the view distance and re-derive every region.
    pub fn set_view_distance(&mut self, distance: u32) {
        if distance == self.view_distance {
            return;
        }
        self.view_distance = distance;
        for viewer in self.viewers.values_mut() {
            viewer.region = ViewRegion::around(viewer.center, distance);
        }
    }

    pub fn set_spawn(&mut self, spawn: BlockPos) {
        self.spawn = Some(spawn.chunk());
    }

    pub fn spawn_chunk(&self) -> Option<ChunkPos> {
        self.spawn
    }

    pub fn add_viewer(&mut self, kind: ViewerKind, at: BlockPos) -> ViewerId {
        let center = at.chunk();
        self.viewers.insert(Viewer {
            kind,
            center,
            region: ViewRegion::around(center, self.view_distance),
        })
    }

    /// Move a viewer. The region is only re-derived when the viewer crosses
    /// into another chunk; returns whether that happened.
    pub fn move_viewer(&mut self, id: ViewerId, to: BlockPos) -> bool {
        let Some(viewer) = self.viewers.get_mut(id) else {
            return false;
        };
        let center = to.chunk();
        if center == viewer.center {
            return false;
        }
        viewer.center = center;
        viewer.region = ViewRegion::around(center, self.view_distance);
        true
    }

    pub fn remove_viewer(&mut self, id: ViewerId) -> Option<Viewer> {
        self.viewers.remove(id)
    }

    pub fn viewer(&self, id: ViewerId) -> Option<&Viewer> {
        self.viewers.get(id)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Regions that currently keep chunks resident: every viewer's region,
    /// or the spawn region when there are no viewers at all.
    pub fn active_regions(&self) -> Vec<ViewRegion> {
        if self.viewers.is_empty() {
            return self
                .spawn
                .map(|spawn| vec![ViewRegion::around(spawn, self.view_distance)])
                .unwrap_or_default();
        }
        self.viewers.values().map(|v| v.region).collect()
    }

    pub fn is_viewed(&self, pos: ChunkPos) -> bool {
        self.active_regions().iter().any(|r| r.contains(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_around_origin_covers_25_chunks() {
        let region = ViewRegion::around(ChunkPos::new(0, 0), 2);
        assert_eq!(region.start, ChunkPos::new(-2, -2));
        assert_eq!(region.end, ChunkPos::new(3, 3));
        assert_eq!(region.area(), 25);
        assert_eq!(region.positions().count(), 25);
        for x in -2..=2 {
            for y in -2..=2 {
                assert!(region.contains(ChunkPos::new(x, y)));
            }
        }
        assert!(!region.contains(ChunkPos::new(3, 0)));
        assert!(!region.contains(ChunkPos::new(0, -3)));
    }

    #[test]
    fn moving_viewer_rederives_region() {
        let mut tracker = ViewTracker::new(2);
        let id = tracker.add_viewer(ViewerKind::Spectator, ChunkPos::new(0, 0).block_origin());
        assert!(tracker.viewer(id).unwrap().region.contains(ChunkPos::new(0, 0)));

        assert!(tracker.move_viewer(id, ChunkPos::new(5, 0).block_origin()));
        let region = tracker.viewer(id).unwrap().region;
        assert!(!region.contains(ChunkPos::new(0, 0)));
        assert!(region.contains(ChunkPos::new(3, 0)));
        assert!(region.contains(ChunkPos::new(7, 2)));
    }

    #[test]
    fn moving_within_a_chunk_keeps_region() {
        let mut tracker = ViewTracker::new(1);
        let id = tracker.add_viewer(ViewerKind::Player("ana".into()), BlockPos::new(1, 1));
        assert!(!tracker.move_viewer(id, BlockPos::new(30, 2)));
        assert!(tracker.move_viewer(id, BlockPos::new(32, 2)));
    }

    #[test]
    fn spawn_is_only_a_fallback() {
        let mut tracker = ViewTracker::new(1);
        tracker.set_spawn(BlockPos::new(0, 0));
        assert!(tracker.is_viewed(ChunkPos::new(0, 0)));

        let id = tracker.add_viewer(ViewerKind::Spectator, ChunkPos::new(50, 50).block_origin());
        assert!(!tracker.is_viewed(ChunkPos::new(0, 0)));
        assert!(tracker.is_viewed(ChunkPos::new(50, 51)));

        tracker.remove_viewer(id);
        assert!(tracker.is_viewed(ChunkPos::new(0, 0)));
    }

    #[test]
    fn nearest_first_starts_at_center() {
        let region = ViewRegion::around(ChunkPos::new(4, -4), 3);
        let order = region.positions_nearest_first();
        assert_eq!(order[0], ChunkPos::new(4, -4));
        assert_eq!(order.len(), 49);
    }
}
