// Synchronization primitives and the frame protocol
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync, plus the acquire -> submit
// -> present state machine that drives them. The state machine talks to the
// device through `PresentBackend` so it can be exercised without a GPU.

use super::DeviceContext;
use crate::error::{RenderError, Result, VkResultExt};
use ash::vk;
use std::sync::Arc;

const SUBSYSTEM: &str = "sync";

/// Frame synchronization - one per frame in flight
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<DeviceContext>,
}

impl FrameSlot {
    pub fn new(device: &Arc<DeviceContext>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        let raw = &device.device;
        let mut slot = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
            device: device.clone(),
        };
        unsafe {
            slot.image_available = raw
                .create_semaphore(&semaphore_info, None)
                .vk_context(SUBSYSTEM, "create_semaphore")?;
            slot.render_finished = raw
                .create_semaphore(&semaphore_info, None)
                .vk_context(SUBSYSTEM, "create_semaphore")?;
            slot.in_flight_fence = raw
                .create_fence(&fence_info, None)
                .vk_context(SUBSYSTEM, "create_fence")?;
        }
        Ok(slot)
    }

    /// Block until the last submission from this slot has finished
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
        }
        .vk_context(SUBSYSTEM, "wait_for_fences")
    }

    /// Unsignal the fence. Only call right before the submission that signals it.
    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.in_flight_fence]) }
            .vk_context(SUBSYSTEM, "reset_fences")
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        // Null handles are ignored by the destroy calls
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Result of asking the surface for its next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image { index: u32, suboptimal: bool },
    /// The surface no longer matches the window
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Out of date or suboptimal; the frame was still queued
    Stale,
}

/// What one call to `acquire_and_present` achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// The surface was (or needs to be) rebuilt. `submitted` tells whether
    /// work for this frame reached the queue before that happened.
    Stale { submitted: bool },
}

/// Device side of the frame protocol.
///
/// Slots are indices in `0..depth`; image indices come from `acquire`.
pub trait PresentBackend {
    /// Number of images in the current swap surface
    fn image_count(&self) -> usize;

    /// False while no surface can be created (e.g. minimized window)
    fn is_ready(&self) -> bool {
        true
    }

    /// Block on the slot's submission fence
    fn wait_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire the next image, signalling the slot's image-acquired semaphore
    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Record the image's commands, reset the slot fence, then submit:
    /// wait image-acquired, signal render-complete and the slot fence
    fn record_and_submit(&mut self, slot: usize, image: u32) -> Result<()>;

    /// Present `image` once the slot's render-complete semaphore signals
    fn present(&mut self, slot: usize, image: u32) -> Result<PresentOutcome>;

    /// Wait for device idle, tear the surface down and create it again
    fn rebuild_surface(&mut self) -> Result<()>;
}

/// Owns the frame counter and the image-in-use table, and runs the per-frame
/// protocol against a `PresentBackend`.
pub struct FrameSynchronizer<B: PresentBackend> {
    backend: B,
    depth: usize,
    frame_counter: u64,
    images_in_flight: Vec<Option<usize>>,
    rebuild_requested: bool,
    rebuilds: u64,
}

impl<B: PresentBackend> FrameSynchronizer<B> {
    pub fn new(backend: B, depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(RenderError::ProtocolViolation(
                "at least one frame in flight is required".into(),
            ));
        }
        let images = backend.image_count();
        Ok(Self {
            backend,
            depth,
            frame_counter: 0,
            images_in_flight: vec![None; images],
            rebuild_requested: false,
            rebuilds: 0,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn current_slot(&self) -> usize {
        (self.frame_counter % self.depth as u64) as usize
    }

    /// Number of surface rebuilds performed so far
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Slot guarding each swap image, if any
    pub fn images_in_flight(&self) -> &[Option<usize>] {
        &self.images_in_flight
    }

    /// Rebuild the surface before the next frame (window resized)
    pub fn request_rebuild(&mut self) {
        self.rebuild_requested = true;
    }

    /// Run one frame: wait, acquire, record, submit, present.
    ///
    /// Stale surfaces are rebuilt here and reported as `FrameStatus::Stale`.
    /// Any error returned is fatal.
    pub fn acquire_and_present(&mut self) -> Result<FrameStatus> {
        let slot = self.current_slot();

        self.backend.wait_slot(slot)?;

        if self.rebuild_requested || !self.backend.is_ready() {
            self.rebuild()?;
            if !self.backend.is_ready() {
                return Ok(FrameStatus::Stale { submitted: false });
            }
        }

        let (image, acquire_suboptimal) = match self.backend.acquire(slot)? {
            AcquireOutcome::Image { index, suboptimal } => (index, suboptimal),
            AcquireOutcome::Stale => {
                log::debug!("Surface stale on acquire (frame {})", self.frame_counter);
                self.rebuild()?;
                return Ok(FrameStatus::Stale { submitted: false });
            }
        };

        let image_slot = image as usize;
        let Some(guard) = self.images_in_flight.get(image_slot).copied() else {
            return Err(RenderError::ProtocolViolation(format!(
                "acquired image {} but the surface has {} images",
                image,
                self.images_in_flight.len()
            )));
        };

        if let Some(other) = guard {
            if other != slot {
                self.backend.wait_slot(other)?;
            }
        }

        self.backend.record_and_submit(slot, image)?;
        self.images_in_flight[image_slot] = Some(slot);

        let present = self.backend.present(slot, image)?;
        self.frame_counter += 1;

        if present == PresentOutcome::Stale || acquire_suboptimal {
            log::debug!("Surface stale on present (frame {})", self.frame_counter);
            self.rebuild()?;
            return Ok(FrameStatus::Stale { submitted: true });
        }

        Ok(FrameStatus::Presented)
    }

    fn rebuild(&mut self) -> Result<()> {
        self.rebuild_requested = false;
        self.backend.rebuild_surface()?;
        self.images_in_flight = vec![None; self.backend.image_count()];
        if self.backend.is_ready() {
            self.rebuilds += 1;
            log::info!(
                "Swap surface rebuilt ({} images, rebuild #{})",
                self.images_in_flight.len(),
                self.rebuilds
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that accepts everything and records the call order
    struct Recording {
        images: usize,
        next_image: u32,
        calls: Vec<String>,
    }

    impl PresentBackend for Recording {
        fn image_count(&self) -> usize {
            self.images
        }

        fn wait_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(format!("wait {}", slot));
            Ok(())
        }

        fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(format!("acquire {}", slot));
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.images as u32;
            Ok(AcquireOutcome::Image {
                index,
                suboptimal: false,
            })
        }

        fn record_and_submit(&mut self, slot: usize, image: u32) -> Result<()> {
            self.calls.push(format!("submit {} {}", slot, image));
            Ok(())
        }

        fn present(&mut self, slot: usize, image: u32) -> Result<PresentOutcome> {
            self.calls.push(format!("present {} {}", slot, image));
            Ok(PresentOutcome::Presented)
        }

        fn rebuild_surface(&mut self) -> Result<()> {
            self.calls.push("rebuild".into());
            Ok(())
        }
    }

    fn recording(images: usize) -> Recording {
        Recording {
            images,
            next_image: 0,
            calls: Vec::new(),
        }
    }

    #[test]
    fn zero_depth_is_rejected() {
        assert!(FrameSynchronizer::new(recording(3), 0).is_err());
    }

    #[test]
    fn slots_rotate_with_the_frame_counter() {
        let mut sync = FrameSynchronizer::new(recording(3), 2).unwrap();
        for expected in [0, 1, 0, 1] {
            assert_eq!(sync.current_slot(), expected);
            assert_eq!(sync.acquire_and_present().unwrap(), FrameStatus::Presented);
        }
        assert_eq!(sync.frame_counter(), 4);
    }

    #[test]
    fn frame_follows_wait_acquire_submit_present() {
        let mut sync = FrameSynchronizer::new(recording(3), 2).unwrap();
        sync.acquire_and_present().unwrap();
        assert_eq!(
            sync.backend().calls,
            vec!["wait 0", "acquire 0", "submit 0 0", "present 0 0"]
        );
    }

    #[test]
    fn image_guarded_by_other_slot_is_waited_on() {
        // Two images, three slots: image 0 comes back while slot 0 guards it
        let mut sync = FrameSynchronizer::new(recording(2), 3).unwrap();
        sync.acquire_and_present().unwrap();
        sync.acquire_and_present().unwrap();
        sync.backend_mut().calls.clear();

        sync.acquire_and_present().unwrap();
        assert_eq!(
            sync.backend().calls,
            vec!["wait 2", "acquire 2", "wait 0", "submit 2 0", "present 2 0"]
        );
        assert_eq!(sync.images_in_flight(), &[Some(2), Some(1)]);
    }

    #[test]
    fn requested_rebuild_happens_before_acquire() {
        let mut sync = FrameSynchronizer::new(recording(3), 2).unwrap();
        sync.request_rebuild();
        assert_eq!(sync.acquire_and_present().unwrap(), FrameStatus::Presented);
        assert_eq!(sync.backend().calls[..3], ["wait 0", "rebuild", "acquire 0"]);
        assert_eq!(sync.rebuilds(), 1);
    }
}
