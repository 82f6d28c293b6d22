//! Collective communication between the ranks of a run.
//!
//! PMI needs exactly two collectives: a broadcast rooted at the controller,
//! and a gather of one frame per worker back to the controller. Both are
//! blocking and are entered by every rank in the same order.

use crate::{Error, Rank};

mod local;
#[cfg(feature = "quic")]
mod quic;

pub use local::LocalTransport;
#[cfg(feature = "quic")]
pub use quic::QuicTransport;

pub trait Transport {
    fn rank(&self) -> Rank;

    /// Number of ranks, controller included.
    fn size(&self) -> usize;

    /// Controller side of a broadcast. Delivery is attempted to every worker
    /// before the first failure is reported.
    fn broadcast(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Worker side of a broadcast. Blocks until the controller's next frame.
    fn receive_broadcast(&mut self) -> Result<Vec<u8>, Error>;

    /// Controller side of a gather. Returns one frame per worker, ordered by
    /// rank starting at rank 1.
    fn gather_root(&mut self) -> Result<Vec<Vec<u8>>, Error>;

    /// Worker side of a gather.
    fn gather_send(&mut self, frame: Vec<u8>) -> Result<(), Error>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn rank(&self) -> Rank {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn broadcast(&mut self, frame: &[u8]) -> Result<(), Error> {
        (**self).broadcast(frame)
    }

    fn receive_broadcast(&mut self) -> Result<Vec<u8>, Error> {
        (**self).receive_broadcast()
    }

    fn gather_root(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        (**self).gather_root()
    }

    fn gather_send(&mut self, frame: Vec<u8>) -> Result<(), Error> {
        (**self).gather_send(frame)
    }
}

fn wrong_side(rank: Rank, operation: &str) -> Error {
    Error::Internal {
        rank,
        message: format!("{operation} is not available on rank {rank}"),
    }
}
