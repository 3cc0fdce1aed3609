//! Split-frame partitioning.
//!
//! [`compute_regions`] turns a distribution mode, a frame size, the active
//! device count and optional workload weights into one [`FrameRegion`] per
//! device. [`FrameDistributor`] caches that result and recomputes it when
//! any input changes.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

use crate::registry::{DeviceSet, GpuDeviceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrameDistributionMode {
    /// Side-by-side columns, one per device.
    #[default]
    SplitHorizontal,
    /// Stacked rows, one per device.
    SplitVertical,
    /// Fixed 2x2 grid for up to four devices.
    SplitQuadrants,
    /// Every frame is rendered whole by one device, round-robin.
    AlternateFrame,
}

/// A rectangle of the frame owned by one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameRegion {
    pub offset_x: u32,
    pub offset_y: u32,
    pub width: u32,
    pub height: u32,
    pub gpu_index: u32,
}

impl FrameRegion {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Cannot partition a frame across zero active devices")]
    Degenerate,
}

/// Relative per-device workload weights, written by the submission
/// distributor and read by the frame distributor.
///
/// Every change bumps a generation counter so readers can tell their cached
/// partition is stale.
#[derive(Debug, Default)]
pub struct WorkloadHint {
    weights: Mutex<Option<Vec<u32>>>,
    generation: AtomicU64,
}

impl WorkloadHint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_weights(&self, weights: Vec<u32>) {
        *self.weights.lock().expect("workload hint lock poisoned") = Some(weights);
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn clear(&self) {
        let mut guard = self.weights.lock().expect("workload hint lock poisoned");
        if guard.take().is_some() {
            self.generation.fetch_add(1, Ordering::Release);
        }
    }

    pub fn weights(&self) -> Option<Vec<u32>> {
        self.weights
            .lock()
            .expect("workload hint lock poisoned")
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Split `total` into `count` consecutive spans.
///
/// With usable weights each span is the floor of its proportional share;
/// otherwise spans are equal. The last span always absorbs the remainder.
fn split_spans(total: u32, count: u32, weights: Option<&[u32]>) -> Vec<(u32, u32)> {
    let weights = weights.filter(|w| {
        w.len() == count as usize && w.iter().map(|&x| x as u64).sum::<u64>() > 0
    });
    let weight_sum: u64 = weights
        .map(|w| w.iter().map(|&x| x as u64).sum())
        .unwrap_or(0);

    let mut spans = Vec::with_capacity(count as usize);
    let mut offset = 0u32;
    for i in 0..count {
        let len = if i + 1 == count {
            total - offset
        } else {
            match weights {
                Some(w) => (total as u64 * w[i as usize] as u64 / weight_sum) as u32,
                None => total / count,
            }
        };
        spans.push((offset, len));
        offset += len;
    }
    spans
}

/// Partition a `width` x `height` frame across `count` devices.
///
/// `weights` only affects the two linear split modes. `frame_index` only
/// affects [`FrameDistributionMode::AlternateFrame`].
pub fn compute_regions(
    mode: FrameDistributionMode,
    width: u32,
    height: u32,
    count: u32,
    weights: Option<&[u32]>,
    frame_index: u64,
) -> Result<Vec<FrameRegion>, PartitionError> {
    if count == 0 {
        return Err(PartitionError::Degenerate);
    }

    let regions = match mode {
        FrameDistributionMode::SplitHorizontal => split_spans(width, count, weights)
            .into_iter()
            .zip(0..)
            .map(|((offset_x, span), gpu_index)| FrameRegion {
                offset_x,
                offset_y: 0,
                width: span,
                height,
                gpu_index,
            })
            .collect(),
        FrameDistributionMode::SplitVertical => split_spans(height, count, weights)
            .into_iter()
            .zip(0..)
            .map(|((offset_y, span), gpu_index)| FrameRegion {
                offset_x: 0,
                offset_y,
                width,
                height: span,
                gpu_index,
            })
            .collect(),
        FrameDistributionMode::SplitQuadrants => {
            let left = width / 2;
            let top = height / 2;
            let quadrants = [
                (0, 0, left, top),
                (left, 0, width - left, top),
                (0, top, left, height - top),
                (left, top, width - left, height - top),
            ];
            quadrants
                .into_iter()
                .zip(0..count)
                .map(|((offset_x, offset_y, width, height), gpu_index)| FrameRegion {
                    offset_x,
                    offset_y,
                    width,
                    height,
                    gpu_index,
                })
                .collect()
        }
        FrameDistributionMode::AlternateFrame => vec![FrameRegion {
            offset_x: 0,
            offset_y: 0,
            width,
            height,
            gpu_index: (frame_index % count as u64) as u32,
        }],
    };
    Ok(regions)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PartitionKey {
    mode: FrameDistributionMode,
    width: u32,
    height: u32,
    count: u32,
    frame_index: u64,
    hint_generation: u64,
}

/// Caches the frame partition for the current mode, resolution and device
/// count.
pub struct FrameDistributor<S: DeviceSet = GpuDeviceRegistry> {
    devices: Arc<S>,
    hint: Arc<WorkloadHint>,
    mode: FrameDistributionMode,
    width: u32,
    height: u32,
    frame_index: u64,
    cache: Option<(PartitionKey, Vec<FrameRegion>)>,
}

impl<S: DeviceSet> std::fmt::Debug for FrameDistributor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDistributor")
            .field("mode", &self.mode)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("frame_index", &self.frame_index)
            .finish_non_exhaustive()
    }
}

impl<S: DeviceSet> FrameDistributor<S> {
    /// Horizontal split of a zero-sized frame until told otherwise.
    pub fn new(devices: Arc<S>) -> Self {
        Self {
            devices,
            hint: Arc::new(WorkloadHint::new()),
            mode: FrameDistributionMode::default(),
            width: 0,
            height: 0,
            frame_index: 0,
            cache: None,
        }
    }

    /// The hint this distributor reads weights from. Hand it to
    /// [`CommandSubmissionDistributor`](crate::command::CommandSubmissionDistributor).
    pub fn workload_hint(&self) -> Arc<WorkloadHint> {
        Arc::clone(&self.hint)
    }

    pub fn set_distribution_mode(&mut self, mode: FrameDistributionMode) {
        if self.mode != mode {
            tracing::debug!("Frame distribution mode {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
            self.cache = None;
        }
    }

    pub fn distribution_mode(&self) -> FrameDistributionMode {
        self.mode
    }

    pub fn set_frame_resolution(&mut self, width: u32, height: u32) {
        if (self.width, self.height) != (width, height) {
            self.width = width;
            self.height = height;
            self.cache = None;
        }
    }

    pub fn frame_resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Move on to the next frame. Only alternate-frame mode cares.
    pub fn advance_frame(&mut self) {
        self.frame_index = self.frame_index.wrapping_add(1);
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    fn current_key(&self) -> PartitionKey {
        PartitionKey {
            mode: self.mode,
            width: self.width,
            height: self.height,
            count: self.devices.active_gpu_count(),
            frame_index: match self.mode {
                FrameDistributionMode::AlternateFrame => self.frame_index,
                _ => 0,
            },
            hint_generation: self.hint.generation(),
        }
    }

    fn compute(&self, key: &PartitionKey) -> Result<Vec<FrameRegion>, PartitionError> {
        let weights = self.hint.weights();
        compute_regions(
            key.mode,
            key.width,
            key.height,
            key.count,
            weights.as_deref(),
            key.frame_index,
        )
    }

    /// The partition for the current settings, recomputed only when stale.
    pub fn regions(&mut self) -> Result<&[FrameRegion], PartitionError> {
        let key = self.current_key();
        let stale = self.cache.as_ref().is_none_or(|(cached, _)| *cached != key);
        if stale {
            let regions = self.compute(&key)?;
            self.cache = Some((key, regions));
        }
        Ok(self
            .cache
            .as_ref()
            .map(|(_, regions)| regions.as_slice())
            .unwrap_or_default())
    }

    /// The region owned by device `gpu_index`, or an empty region if it owns
    /// none. Always recomputed from the current settings.
    pub fn region_for_gpu(&self, gpu_index: u32) -> Result<FrameRegion, PartitionError> {
        let key = self.current_key();
        Ok(self
            .compute(&key)?
            .into_iter()
            .find(|region| region.gpu_index == gpu_index)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDevices(u32);

    impl DeviceSet for FixedDevices {
        fn active_gpu_count(&self) -> u32 {
            self.0
        }
    }

    fn distributor(count: u32) -> FrameDistributor<FixedDevices> {
        FrameDistributor::new(Arc::new(FixedDevices(count)))
    }

    /// Every pixel of the frame is owned exactly once.
    fn assert_exact_partition(regions: &[FrameRegion], width: u32, height: u32) {
        let mut owners = vec![0u8; (width * height) as usize];
        for r in regions {
            assert!(r.offset_x + r.width <= width, "{r:?} exceeds width {width}");
            assert!(r.offset_y + r.height <= height, "{r:?} exceeds height {height}");
            for y in r.offset_y..r.offset_y + r.height {
                for x in r.offset_x..r.offset_x + r.width {
                    owners[(y * width + x) as usize] += 1;
                }
            }
        }
        assert!(
            owners.iter().all(|&n| n == 1),
            "regions {regions:?} do not partition {width}x{height}"
        );
    }

    #[test]
    fn every_mode_partitions_the_frame() {
        let sizes = [(1, 1), (7, 5), (64, 48), (33, 97)];
        let skewed = [5, 0, 2, 9, 1];
        for (width, height) in sizes {
            for count in 1..=5 {
                let weights = &skewed[..count as usize];
                for mode in [
                    FrameDistributionMode::SplitHorizontal,
                    FrameDistributionMode::SplitVertical,
                    FrameDistributionMode::AlternateFrame,
                ] {
                    let regions =
                        compute_regions(mode, width, height, count, None, 3).unwrap();
                    assert_exact_partition(&regions, width, height);

                    let weighted =
                        compute_regions(mode, width, height, count, Some(weights), 3)
                            .unwrap();
                    assert_exact_partition(&weighted, width, height);
                }
            }
            for count in 4..=6 {
                let regions = compute_regions(
                    FrameDistributionMode::SplitQuadrants,
                    width,
                    height,
                    count,
                    None,
                    0,
                )
                .unwrap();
                assert_eq!(regions.len(), 4);
                assert_exact_partition(&regions, width, height);
            }
        }
    }

    #[test]
    fn horizontal_split_of_1920_across_three() {
        let regions = compute_regions(
            FrameDistributionMode::SplitHorizontal,
            1920,
            1080,
            3,
            None,
            0,
        )
        .unwrap();

        let widths: Vec<u32> = regions.iter().map(|r| r.width).collect();
        let offsets: Vec<u32> = regions.iter().map(|r| r.offset_x).collect();
        assert_eq!(widths, vec![640, 640, 640]);
        assert_eq!(offsets, vec![0, 640, 1280]);
        assert!(regions.iter().all(|r| r.height == 1080 && r.offset_y == 0));
    }

    #[test]
    fn last_column_absorbs_remainder() {
        let regions = compute_regions(
            FrameDistributionMode::SplitHorizontal,
            1921,
            1080,
            3,
            None,
            0,
        )
        .unwrap();

        let widths: Vec<u32> = regions.iter().map(|r| r.width).collect();
        assert_eq!(widths, vec![640, 640, 641]);
    }

    #[test]
    fn vertical_split_uses_rows() {
        let regions =
            compute_regions(FrameDistributionMode::SplitVertical, 800, 601, 2, None, 0)
                .unwrap();

        assert_eq!(
            regions,
            vec![
                FrameRegion { offset_x: 0, offset_y: 0, width: 800, height: 300, gpu_index: 0 },
                FrameRegion { offset_x: 0, offset_y: 300, width: 800, height: 301, gpu_index: 1 },
            ]
        );
    }

    #[test]
    fn quadrants_of_100_square() {
        let regions =
            compute_regions(FrameDistributionMode::SplitQuadrants, 100, 100, 4, None, 0)
                .unwrap();

        let rects: Vec<(u32, u32, u32, u32, u32)> = regions
            .iter()
            .map(|r| (r.gpu_index, r.offset_x, r.offset_y, r.width, r.height))
            .collect();
        assert_eq!(
            rects,
            vec![
                (0, 0, 0, 50, 50),
                (1, 50, 0, 50, 50),
                (2, 0, 50, 50, 50),
                (3, 50, 50, 50, 50),
            ]
        );
    }

    #[test]
    fn quadrant_remainder_goes_right_and_down() {
        let regions =
            compute_regions(FrameDistributionMode::SplitQuadrants, 101, 51, 4, None, 0)
                .unwrap();

        assert_eq!((regions[0].width, regions[0].height), (50, 25));
        assert_eq!((regions[3].width, regions[3].height), (51, 26));
    }

    #[test]
    fn quadrants_with_fewer_devices_leave_gaps() {
        let regions =
            compute_regions(FrameDistributionMode::SplitQuadrants, 100, 100, 2, None, 0)
                .unwrap();

        assert_eq!(regions.len(), 2);
        let covered: u64 = regions.iter().map(FrameRegion::area).sum();
        assert_eq!(covered, 5000);
    }

    #[test]
    fn zero_devices_is_degenerate() {
        for mode in [
            FrameDistributionMode::SplitHorizontal,
            FrameDistributionMode::SplitVertical,
            FrameDistributionMode::SplitQuadrants,
            FrameDistributionMode::AlternateFrame,
        ] {
            assert_eq!(
                compute_regions(mode, 1920, 1080, 0, None, 0),
                Err(PartitionError::Degenerate)
            );
        }
        let mut distributor = distributor(0);
        distributor.set_frame_resolution(1920, 1080);
        assert_eq!(distributor.regions(), Err(PartitionError::Degenerate));
        assert_eq!(distributor.region_for_gpu(0), Err(PartitionError::Degenerate));
    }

    #[test]
    fn weights_size_spans_proportionally() {
        let regions = compute_regions(
            FrameDistributionMode::SplitHorizontal,
            100,
            10,
            2,
            Some(&[1, 3]),
            0,
        )
        .unwrap();

        assert_eq!(regions[0].width, 25);
        assert_eq!(regions[1].offset_x, 25);
        assert_eq!(regions[1].width, 75);

        let uneven = compute_regions(
            FrameDistributionMode::SplitVertical,
            10,
            100,
            3,
            Some(&[1, 1, 1]),
            0,
        )
        .unwrap();
        let heights: Vec<u32> = uneven.iter().map(|r| r.height).collect();
        assert_eq!(heights, vec![33, 33, 34]);
    }

    #[test]
    fn unusable_weights_fall_back_to_equal_split() {
        let wrong_len = compute_regions(
            FrameDistributionMode::SplitHorizontal,
            90,
            10,
            3,
            Some(&[5, 1]),
            0,
        )
        .unwrap();
        let all_zero = compute_regions(
            FrameDistributionMode::SplitHorizontal,
            90,
            10,
            3,
            Some(&[0, 0, 0]),
            0,
        )
        .unwrap();

        for regions in [wrong_len, all_zero] {
            let widths: Vec<u32> = regions.iter().map(|r| r.width).collect();
            assert_eq!(widths, vec![30, 30, 30]);
        }
    }

    #[test]
    fn alternate_frame_rotates_owner() {
        let mut distributor = distributor(3);
        distributor.set_distribution_mode(FrameDistributionMode::AlternateFrame);
        distributor.set_frame_resolution(640, 480);

        let mut owners = Vec::new();
        for _ in 0..4 {
            let regions = distributor.regions().unwrap();
            assert_eq!(regions.len(), 1);
            assert_eq!((regions[0].width, regions[0].height), (640, 480));
            owners.push(regions[0].gpu_index);
            distributor.advance_frame();
        }

        assert_eq!(owners, vec![0, 1, 2, 0]);
    }

    #[test]
    fn region_for_gpu_matches_filtered_partition() {
        let mut distributor = distributor(3);
        distributor.set_frame_resolution(1921, 1080);
        distributor.workload_hint().set_weights(vec![1, 2, 4]);

        for mode in [
            FrameDistributionMode::SplitHorizontal,
            FrameDistributionMode::SplitVertical,
            FrameDistributionMode::SplitQuadrants,
            FrameDistributionMode::AlternateFrame,
        ] {
            distributor.set_distribution_mode(mode);
            let regions = distributor.regions().unwrap().to_vec();

            for gpu in 0..3 {
                let expected = regions
                    .iter()
                    .copied()
                    .find(|r| r.gpu_index == gpu)
                    .unwrap_or_default();
                assert_eq!(distributor.region_for_gpu(gpu), Ok(expected), "{mode:?}");
            }
            assert_eq!(distributor.region_for_gpu(9), Ok(FrameRegion::default()));
        }
    }

    #[test]
    fn alternate_frame_idle_devices_get_an_empty_region() {
        let mut distributor = distributor(3);
        distributor.set_distribution_mode(FrameDistributionMode::AlternateFrame);
        distributor.set_frame_resolution(800, 600);
        distributor.advance_frame();

        let owner = distributor.region_for_gpu(1).unwrap();
        assert_eq!((owner.width, owner.height), (800, 600));
        for idle in [0, 2] {
            let region = distributor.region_for_gpu(idle).unwrap();
            assert_eq!(region, FrameRegion::default());
            assert!(region.is_empty());
        }
    }

    #[test]
    fn repeated_settings_give_identical_regions() {
        let mut distributor = distributor(2);
        distributor.set_distribution_mode(FrameDistributionMode::SplitVertical);
        distributor.set_frame_resolution(1280, 720);
        let first = distributor.regions().unwrap().to_vec();

        distributor.set_distribution_mode(FrameDistributionMode::SplitVertical);
        distributor.set_frame_resolution(1280, 720);
        let second = distributor.regions().unwrap().to_vec();

        assert_eq!(first, second);
    }

    #[test]
    fn hint_change_invalidates_cache() {
        let mut distributor = distributor(2);
        distributor.set_frame_resolution(100, 100);
        assert_eq!(distributor.regions().unwrap()[0].width, 50);

        let hint = distributor.workload_hint();
        hint.set_weights(vec![3, 1]);
        assert_eq!(distributor.regions().unwrap()[0].width, 75);

        hint.clear();
        assert_eq!(distributor.regions().unwrap()[0].width, 50);
    }

    #[test]
    fn resolution_change_invalidates_cache() {
        let mut distributor = distributor(2);
        distributor.set_frame_resolution(100, 100);
        assert_eq!(distributor.regions().unwrap()[1].width, 50);

        distributor.set_frame_resolution(200, 100);
        assert_eq!(distributor.regions().unwrap()[1].width, 100);
    }
}
