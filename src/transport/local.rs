use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use super::{wrong_side, Transport};
use crate::{Error, Rank, CONTROLLER};

enum Links {
    Controller {
        to_workers: Vec<UnboundedSender<Vec<u8>>>,
        from_workers: Vec<UnboundedReceiver<Vec<u8>>>,
    },
    Worker {
        from_controller: UnboundedReceiver<Vec<u8>>,
        to_controller: UnboundedSender<Vec<u8>>,
    },
}

/// Ranks living in one process, one thread each, connected by channels.
///
/// Receiving blocks the calling thread, so a `LocalTransport` must not be
/// driven from inside an async runtime.
pub struct LocalTransport {
    rank: Rank,
    size: usize,
    links: Links,
}

impl LocalTransport {
    /// Creates the endpoints of a run with `size` ranks. Element `i` belongs
    /// to rank `i`; element 0 is the controller.
    pub fn group(size: usize) -> Vec<LocalTransport> {
        if size == 0 {
            return Vec::new();
        }
        let mut to_workers = Vec::with_capacity(size - 1);
        let mut from_workers = Vec::with_capacity(size - 1);
        let mut workers = Vec::with_capacity(size - 1);
        for rank in 1..size {
            let (down_tx, down_rx) = mpsc::unbounded_channel();
            let (up_tx, up_rx) = mpsc::unbounded_channel();
            to_workers.push(down_tx);
            from_workers.push(up_rx);
            workers.push(LocalTransport {
                rank,
                size,
                links: Links::Worker {
                    from_controller: down_rx,
                    to_controller: up_tx,
                },
            });
        }

        let mut group = Vec::with_capacity(size);
        group.push(LocalTransport {
            rank: CONTROLLER,
            size,
            links: Links::Controller {
                to_workers,
                from_workers,
            },
        });
        group.extend(workers);
        group
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast(&mut self, frame: &[u8]) -> Result<(), Error> {
        let Links::Controller { to_workers, .. } = &self.links else {
            return Err(wrong_side(self.rank, "broadcast"));
        };
        let mut first_error = None;
        for (i, tx) in to_workers.iter().enumerate() {
            if tx.send(frame.to_vec()).is_err() {
                first_error.get_or_insert(Error::Disconnected { rank: i + 1 });
            }
        }
        trace!("broadcast {} bytes to {} workers", frame.len(), to_workers.len());
        first_error.map_or(Ok(()), Err)
    }

    fn receive_broadcast(&mut self) -> Result<Vec<u8>, Error> {
        let rank = self.rank;
        let Links::Worker {
            from_controller, ..
        } = &mut self.links
        else {
            return Err(wrong_side(rank, "receive_broadcast"));
        };
        from_controller
            .blocking_recv()
            .ok_or(Error::Disconnected { rank: CONTROLLER })
    }

    fn gather_root(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        let rank = self.rank;
        let Links::Controller { from_workers, .. } = &mut self.links else {
            return Err(wrong_side(rank, "gather_root"));
        };
        from_workers
            .iter_mut()
            .enumerate()
            .map(|(i, rx)| rx.blocking_recv().ok_or(Error::Disconnected { rank: i + 1 }))
            .collect()
    }

    fn gather_send(&mut self, frame: Vec<u8>) -> Result<(), Error> {
        let Links::Worker { to_controller, .. } = &self.links else {
            return Err(wrong_side(self.rank, "gather_send"));
        };
        to_controller
            .send(frame)
            .map_err(|_| Error::Disconnected { rank: CONTROLLER })
    }
}
