//! rsmpi-backed communicator (feature `mpi-support`).

use core::ptr::NonNull;
use mpi::collective::CommunicatorCollectives;
use mpi::environment::Universe;
use mpi::point_to_point::{Destination, Source};
use mpi::topology::{Communicator as _, SimpleCommunicator};

use super::{Communicator, Wait};

/// MPI world communicator. Owns the universe for the process lifetime.
pub struct MpiComm {
    _universe: Universe,
    world: SimpleCommunicator,
    rank: usize,
    size: usize,
}

unsafe impl Send for MpiComm {}
unsafe impl Sync for MpiComm {}

impl Default for MpiComm {
    fn default() -> Self {
        let universe = mpi::initialize().expect("MPI initialization failed");
        let world = universe.world();
        let rank = world.rank() as usize;
        let size = world.size() as usize;
        Self {
            _universe: universe,
            world,
            rank,
            size,
        }
    }
}

impl Communicator for MpiComm {
    type SendHandle = MpiSendHandle;
    type RecvHandle = MpiRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        use mpi::request::StaticScope;
        // The request outlives this call; hand it a stable heap buffer.
        let raw: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
        let slice: &[u8] = unsafe { &*raw };
        let req = self
            .world
            .process_at_rank(peer as i32)
            .immediate_send_with_tag(StaticScope, slice, tag as i32);
        MpiSendHandle {
            req: Some(req),
            buf: Some(unsafe { NonNull::new_unchecked(raw) }),
        }
    }

    fn irecv(&self, peer: usize, tag: u16, template: &mut [u8]) -> Self::RecvHandle {
        use mpi::request::StaticScope;
        let len = template.len();
        let raw: *mut [u8] = Box::into_raw(vec![0u8; len].into_boxed_slice());
        let slice_mut: &mut [u8] = unsafe { &mut *raw };
        let req = self
            .world
            .process_at_rank(peer as i32)
            .immediate_receive_into_with_tag(StaticScope, slice_mut, tag as i32);
        MpiRecvHandle {
            req: Some(req),
            buf: Some(unsafe { NonNull::new_unchecked(raw) }),
            len,
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.world.barrier();
    }
}

pub struct MpiSendHandle {
    req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
    buf: Option<NonNull<[u8]>>,
}

impl Wait for MpiSendHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(r) = self.req.take() {
            let _ = r.wait();
        }
        if let Some(ptr) = self.buf.take() {
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }
        None
    }
}

impl Drop for MpiSendHandle {
    fn drop(&mut self) {
        if let Some(r) = self.req.take() {
            let _ = r.wait();
        }
        if let Some(ptr) = self.buf.take() {
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }
    }
}

pub struct MpiRecvHandle {
    req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
    buf: Option<NonNull<[u8]>>,
    len: usize,
}

impl Wait for MpiRecvHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(r) = self.req.take() {
            let _ = r.wait();
        }
        let ptr = self.buf.take().expect("receive buffer missing");
        let boxed: Box<[u8]> = unsafe { Box::from_raw(ptr.as_ptr()) };
        let mut v = Vec::from(boxed);
        v.truncate(self.len);
        Some(v)
    }
}

impl Drop for MpiRecvHandle {
    fn drop(&mut self) {
        if let Some(r) = self.req.take() {
            let _ = r.wait();
        }
        if let Some(ptr) = self.buf.take() {
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }
    }
}
