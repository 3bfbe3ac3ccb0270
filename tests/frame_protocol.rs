// Frame protocol checks against a simulated GPU.
//
// The simulated backend tracks fence state the way the device would: a
// submit leaves the slot's fence unsignaled until the next wait on it, and a
// surface rebuild drains the queue.

use ash::vk;
use rt_frame_core::backend::sync::{AcquireOutcome, FrameStatus, FrameSynchronizer, PresentBackend, PresentOutcome};
use rt_frame_core::error::{ErrorCategory, RenderError, Result};
use std::collections::VecDeque;

struct SimulatedGpu {
    images: usize,
    /// `true` = signaled
    fences: Vec<bool>,
    /// Slot whose submission last wrote each image
    image_writer: Vec<Option<usize>>,
    next_image: u32,
    acquire_script: VecDeque<Result<AcquireOutcome>>,
    present_script: VecDeque<PresentOutcome>,
    /// Image count after the next rebuild
    rebuild_images: Option<usize>,
    ready: bool,
    ready_after_rebuild: bool,
    rebuild_calls: usize,
    submits: Vec<(usize, u32)>,
    max_unsignaled: usize,
    violations: Vec<String>,
}

impl SimulatedGpu {
    fn new(images: usize, depth: usize) -> Self {
        Self {
            images,
            fences: vec![true; depth],
            image_writer: vec![None; images],
            next_image: 0,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            rebuild_images: None,
            ready: true,
            ready_after_rebuild: true,
            rebuild_calls: 0,
            submits: Vec::new(),
            max_unsignaled: 0,
            violations: Vec::new(),
        }
    }

    fn unsignaled(&self) -> usize {
        self.fences.iter().filter(|signaled| !**signaled).count()
    }
}

impl PresentBackend for SimulatedGpu {
    fn image_count(&self) -> usize {
        self.images
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn wait_slot(&mut self, slot: usize) -> Result<()> {
        self.fences[slot] = true;
        Ok(())
    }

    fn acquire(&mut self, _slot: usize) -> Result<AcquireOutcome> {
        if let Some(scripted) = self.acquire_script.pop_front() {
            return scripted;
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.images as u32;
        Ok(AcquireOutcome::Image {
            index,
            suboptimal: false,
        })
    }

    fn record_and_submit(&mut self, slot: usize, image: u32) -> Result<()> {
        if !self.fences[slot] {
            self.violations
                .push(format!("slot {} reused before its fence signaled", slot));
        }
        if let Some(writer) = self.image_writer[image as usize] {
            if !self.fences[writer] {
                self.violations.push(format!(
                    "image {} recorded while slot {} still renders it",
                    image, writer
                ));
            }
        }

        self.fences[slot] = false;
        self.image_writer[image as usize] = Some(slot);
        self.submits.push((slot, image));
        self.max_unsignaled = self.max_unsignaled.max(self.unsignaled());
        Ok(())
    }

    fn present(&mut self, _slot: usize, _image: u32) -> Result<PresentOutcome> {
        Ok(self
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn rebuild_surface(&mut self) -> Result<()> {
        self.rebuild_calls += 1;
        // Device idle: every fence is signaled again
        self.fences.iter_mut().for_each(|f| *f = true);
        if let Some(images) = self.rebuild_images.take() {
            self.images = images;
        }
        self.image_writer = vec![None; self.images];
        self.next_image = 0;
        self.ready = self.ready_after_rebuild;
        Ok(())
    }
}

/// Deterministic acquire order that keeps handing back recently used images
fn shuffled_acquires(images: u32, count: usize) -> VecDeque<Result<AcquireOutcome>> {
    let mut state = 0x2545_f491_u32;
    (0..count)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            Ok(AcquireOutcome::Image {
                index: state % images,
                suboptimal: false,
            })
        })
        .collect()
}

#[test]
fn steady_state_presents_every_frame() {
    let mut sync = FrameSynchronizer::new(SimulatedGpu::new(3, 2), 2).unwrap();
    for _ in 0..10 {
        assert_eq!(sync.acquire_and_present().unwrap(), FrameStatus::Presented);
    }
    assert_eq!(sync.frame_counter(), 10);
    assert_eq!(sync.rebuilds(), 0);
    assert_eq!(sync.backend().submits.len(), 10);
}

#[test]
fn never_more_than_depth_frames_in_flight() {
    for (images, depth) in [(2, 3), (3, 2), (4, 3), (3, 1)] {
        let mut gpu = SimulatedGpu::new(images, depth);
        gpu.acquire_script = shuffled_acquires(images as u32, 200);
        let mut sync = FrameSynchronizer::new(gpu, depth).unwrap();
        for _ in 0..200 {
            sync.acquire_and_present().unwrap();
        }
        let gpu = sync.backend();
        assert!(
            gpu.max_unsignaled <= depth,
            "{} frames in flight with depth {}",
            gpu.max_unsignaled,
            depth
        );
        assert!(gpu.violations.is_empty(), "{:?}", gpu.violations);
    }
}

#[test]
fn images_outnumbered_by_slots_are_never_reused_early() {
    let mut gpu = SimulatedGpu::new(2, 3);
    gpu.acquire_script = shuffled_acquires(2, 100);
    let mut sync = FrameSynchronizer::new(gpu, 3).unwrap();
    for _ in 0..100 {
        sync.acquire_and_present().unwrap();
    }
    assert!(sync.backend().violations.is_empty(), "{:?}", sync.backend().violations);
}

#[test]
fn stale_acquire_rebuilds_without_advancing() {
    let mut gpu = SimulatedGpu::new(3, 2);
    gpu.acquire_script = VecDeque::from([Ok(AcquireOutcome::Stale), Ok(AcquireOutcome::Stale)]);
    let mut sync = FrameSynchronizer::new(gpu, 2).unwrap();

    for _ in 0..2 {
        assert_eq!(
            sync.acquire_and_present().unwrap(),
            FrameStatus::Stale { submitted: false }
        );
    }
    assert_eq!(sync.rebuilds(), 2);
    assert_eq!(sync.frame_counter(), 0);
    assert!(sync.backend().submits.is_empty());

    assert_eq!(sync.acquire_and_present().unwrap(), FrameStatus::Presented);
    assert_eq!(sync.frame_counter(), 1);
}

#[test]
fn stale_present_rebuilds_after_submitting() {
    let mut gpu = SimulatedGpu::new(3, 2);
    gpu.present_script = VecDeque::from([PresentOutcome::Stale]);
    let mut sync = FrameSynchronizer::new(gpu, 2).unwrap();

    assert_eq!(
        sync.acquire_and_present().unwrap(),
        FrameStatus::Stale { submitted: true }
    );
    assert_eq!(sync.frame_counter(), 1);
    assert_eq!(sync.rebuilds(), 1);
    assert_eq!(sync.backend().submits, vec![(0, 0)]);
    assert_eq!(sync.images_in_flight(), &[None, None, None]);
}

#[test]
fn suboptimal_acquire_still_presents_then_rebuilds() {
    let mut gpu = SimulatedGpu::new(3, 2);
    gpu.acquire_script = VecDeque::from([Ok(AcquireOutcome::Image {
        index: 1,
        suboptimal: true,
    })]);
    let mut sync = FrameSynchronizer::new(gpu, 2).unwrap();

    assert_eq!(
        sync.acquire_and_present().unwrap(),
        FrameStatus::Stale { submitted: true }
    );
    assert_eq!(sync.backend().submits, vec![(0, 1)]);
    assert_eq!(sync.rebuilds(), 1);
}

#[test]
fn rebuild_resizes_image_table() {
    let mut gpu = SimulatedGpu::new(3, 2);
    gpu.rebuild_images = Some(5);
    let mut sync = FrameSynchronizer::new(gpu, 2).unwrap();

    sync.acquire_and_present().unwrap();
    sync.request_rebuild();
    sync.acquire_and_present().unwrap();

    assert_eq!(sync.images_in_flight().len(), 5);
    assert_eq!(sync.images_in_flight()[0], Some(1));
}

#[test]
fn deferred_surface_skips_frames_until_ready() {
    let mut gpu = SimulatedGpu::new(3, 2);
    gpu.ready_after_rebuild = false;
    let mut sync = FrameSynchronizer::new(gpu, 2).unwrap();

    // Minimized: the rebuild leaves no surface behind
    sync.request_rebuild();
    for _ in 0..3 {
        assert_eq!(
            sync.acquire_and_present().unwrap(),
            FrameStatus::Stale { submitted: false }
        );
    }
    assert_eq!(sync.rebuilds(), 0);
    assert_eq!(sync.frame_counter(), 0);
    assert!(sync.backend().submits.is_empty());

    // Restored
    sync.backend_mut().ready_after_rebuild = true;
    assert_eq!(sync.acquire_and_present().unwrap(), FrameStatus::Presented);
    assert_eq!(sync.rebuilds(), 1);
}

#[test]
fn image_index_outside_the_surface_is_a_protocol_violation() {
    let mut gpu = SimulatedGpu::new(3, 2);
    gpu.acquire_script = VecDeque::from([Ok(AcquireOutcome::Image {
        index: 7,
        suboptimal: false,
    })]);
    let mut sync = FrameSynchronizer::new(gpu, 2).unwrap();

    let err = sync.acquire_and_present().unwrap_err();
    assert!(matches!(err, RenderError::ProtocolViolation(_)));
    assert!(sync.backend().submits.is_empty());
}

#[test]
fn device_failure_propagates() {
    let mut gpu = SimulatedGpu::new(3, 2);
    gpu.acquire_script = VecDeque::from([Err(RenderError::Device {
        subsystem: "swapchain",
        call: "vkAcquireNextImageKHR",
        result: vk::Result::ERROR_DEVICE_LOST,
    })]);
    let mut sync = FrameSynchronizer::new(gpu, 2).unwrap();

    let err = sync.acquire_and_present().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::DeviceFailure);
    assert_eq!(sync.frame_counter(), 0);
    assert_eq!(sync.rebuilds(), 0);
}
