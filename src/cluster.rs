//! Grouping of image regions into clusters of mutually proximate images.
//!
//! Two regions are connected when [`adjacent_or_overlapping`] holds for them;
//! a cluster is a connected component of that graph. Components are found by
//! breadth-first search, so cluster order follows the first-discovered seed
//! and member order follows discovery order within the component.

use crate::geometry::{adjacent_or_overlapping, MergeDirection, Rect};
use crate::pipeline::document::ObjectHandle;
use std::collections::VecDeque;
use std::path::PathBuf;

/// One embedded image on a page, ready for clustering.
#[derive(Debug, Clone)]
pub struct ImageRegion {
    /// Placement rectangle on the page.
    pub rect: Rect,
    /// Handle of the image object in the page's object table.
    pub source: ObjectHandle,
    /// Extracted raster in scratch storage, or why extraction failed.
    pub raster: Result<PathBuf, String>,
}

/// A non-empty, maximal set of connected regions.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub members: Vec<ImageRegion>,
}

impl Cluster {
    pub fn rects(&self) -> Vec<Rect> {
        self.members.iter().map(|m| m.rect).collect()
    }

    /// Layout for this cluster's composite, see [`choose_direction`].
    pub fn direction(&self) -> MergeDirection {
        choose_direction(&self.rects())
    }
}

/// Partition `rects` into connected components, returned as index lists.
pub fn group_indices(rects: &[Rect], padding: f32) -> Vec<Vec<usize>> {
    let mut visited = vec![false; rects.len()];
    let mut groups = Vec::new();

    for seed in 0..rects.len() {
        if visited[seed] {
            continue;
        }
        visited[seed] = true;

        let mut group = vec![seed];
        let mut frontier = VecDeque::from([seed]);
        while let Some(current) = frontier.pop_front() {
            for next in 0..rects.len() {
                if !visited[next] && adjacent_or_overlapping(&rects[current], &rects[next], padding) {
                    visited[next] = true;
                    group.push(next);
                    frontier.push_back(next);
                }
            }
        }
        groups.push(group);
    }
    groups
}

/// Cluster the regions of one page.
pub fn build_clusters(regions: Vec<ImageRegion>, padding: f32) -> Vec<Cluster> {
    let rects: Vec<Rect> = regions.iter().map(|r| r.rect).collect();
    let groups = group_indices(&rects, padding);

    let mut slots: Vec<Option<ImageRegion>> = regions.into_iter().map(Some).collect();
    groups
        .into_iter()
        .map(|group| Cluster {
            members: group.into_iter().filter_map(|i| slots[i].take()).collect(),
        })
        .collect()
}

/// Composite layout for a cluster with the given member rectangles.
///
/// A single member is `Vertical`. Otherwise members are ordered by
/// `(y0, x0)` and only the first two are compared: `Vertical` when the
/// vertical gap is strictly smaller than the horizontal gap, else
/// `Horizontal`. Larger clusters with mixed orientation get the layout of
/// their first pair.
pub fn choose_direction(rects: &[Rect]) -> MergeDirection {
    if rects.len() <= 1 {
        return MergeDirection::Vertical;
    }
    let mut sorted = rects.to_vec();
    sorted.sort_by(|a, b| a.y0.total_cmp(&b.y0).then(a.x0.total_cmp(&b.x0)));

    let (first, second) = (&sorted[0], &sorted[1]);
    let dy = (second.y0 - first.y1).abs();
    let dx = (second.x0 - first.x1).abs();
    if dy < dx {
        MergeDirection::Vertical
    } else {
        MergeDirection::Horizontal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(x0: f32, y0: f32, x1: f32, y1: f32) -> Rect {
        Rect::new(x0, y0, x1, y1)
    }

    fn assert_partition(rects: &[Rect], groups: &[Vec<usize>], padding: f32) {
        let mut seen = vec![0usize; rects.len()];
        for g in groups {
            assert!(!g.is_empty());
            for &i in g {
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1), "not a partition: {seen:?}");

        for (gi, a) in groups.iter().enumerate() {
            for b in groups.iter().skip(gi + 1) {
                for &i in a {
                    for &j in b {
                        assert!(
                            !adjacent_or_overlapping(&rects[i], &rects[j], padding),
                            "clusters not maximal: {i} ~ {j}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn partition_holds_for_assorted_layouts() {
        let layouts = vec![
            vec![],
            vec![r(0.0, 0.0, 1.0, 1.0)],
            vec![r(0.0, 0.0, 10.0, 10.0), r(100.0, 0.0, 110.0, 10.0)],
            vec![
                r(0.0, 0.0, 10.0, 10.0),
                r(13.0, 0.0, 20.0, 10.0),
                r(24.0, 0.0, 30.0, 10.0),
                r(300.0, 300.0, 310.0, 310.0),
            ],
            (0..12)
                .map(|i| {
                    let x = (i % 4) as f32 * 40.0;
                    let y = (i / 4) as f32 * 7.0;
                    r(x, y, x + 30.0, y + 5.0)
                })
                .collect(),
        ];
        for rects in layouts {
            let groups = group_indices(&rects, 5.0);
            assert_partition(&rects, &groups, 5.0);
        }
    }

    #[test]
    fn chain_is_connected_transitively() {
        // 0 ~ 1 ~ 2 but 0 and 2 are far apart.
        let rects = vec![
            r(0.0, 0.0, 10.0, 10.0),
            r(13.0, 0.0, 20.0, 10.0),
            r(24.0, 0.0, 30.0, 10.0),
        ];
        assert!(!adjacent_or_overlapping(&rects[0], &rects[2], 5.0));
        assert_eq!(group_indices(&rects, 5.0), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn order_follows_discovery() {
        let rects = vec![
            r(0.0, 0.0, 10.0, 10.0),
            r(500.0, 0.0, 510.0, 10.0),
            r(0.0, 12.0, 10.0, 20.0),
            r(505.0, 12.0, 510.0, 20.0),
        ];
        assert_eq!(group_indices(&rects, 5.0), vec![vec![0, 2], vec![1, 3]]);
    }

    #[test]
    fn build_clusters_keeps_regions() {
        let regions: Vec<ImageRegion> = [r(0.0, 0.0, 5.0, 5.0), r(200.0, 0.0, 205.0, 5.0)]
            .into_iter()
            .enumerate()
            .map(|(i, rect)| ImageRegion {
                rect,
                source: ObjectHandle(i),
                raster: Ok(PathBuf::from(format!("{i}.png"))),
            })
            .collect();
        let clusters = build_clusters(regions, 5.0);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[1].members[0].source, ObjectHandle(1));
    }

    #[test]
    fn single_member_is_vertical() {
        assert_eq!(choose_direction(&[r(3.0, 4.0, 50.0, 9.0)]), MergeDirection::Vertical);
        assert_eq!(choose_direction(&[]), MergeDirection::Vertical);
    }

    #[test]
    fn stacked_pair_picks_horizontal_by_literal_rule() {
        // vertical gap 10, horizontal gap |0 - 10| = 10 → not strictly smaller
        let rects = [r(0.0, 0.0, 10.0, 10.0), r(0.0, 20.0, 10.0, 30.0)];
        assert_eq!(choose_direction(&rects), MergeDirection::Horizontal);
    }

    #[test]
    fn direction_uses_sorted_order() {
        // Listed bottom-first; after sorting, dy = 1 and dx = 10.
        let rects = [r(0.0, 11.0, 10.0, 20.0), r(0.0, 0.0, 10.0, 10.0)];
        assert_eq!(choose_direction(&rects), MergeDirection::Vertical);
    }
}
