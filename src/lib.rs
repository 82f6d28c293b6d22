//! Parallel Method Invocation.
//!
//! One controller process (rank 0) drives a fixed group of worker processes
//! in SPMD style: creating an object, invoking a method on it or destroying
//! it on the controller replays the same operation on every worker's mirror
//! of that object.
//!
//! Every process builds the same [`Registry`] and calls [`main_entry`]. On
//! rank 0 it returns a [`Controller`] right away; on every other rank it runs
//! the dispatch loop and only returns once the controller has called
//! [`Controller::end_all`] (or was dropped).

pub mod config;
pub mod error;
mod macros;
pub mod protocol;
pub mod transport;

use tracing::info;

pub use config::PmiConfig;
#[cfg(feature = "quic")]
pub use config::QuicConfig;
pub use error::{Error, Failure, UserError};
pub use protocol::{
    Controller, IntoOutcome, Invocable, Method, MethodWithArgument, ParallelClass,
    ParallelObject, Payload, ProtocolStats, Registry, StatusReport, Worker, WorkerSummary,
};
#[cfg(feature = "quic")]
pub use transport::QuicTransport;
pub use transport::{LocalTransport, Transport};

/// Index of a process in the run.
pub type Rank = usize;

pub type Id = u32;
pub type ClassId = Id;
pub type MethodId = Id;
pub type ObjectId = Id;

/// Marks an id slot that does not apply to a command.
pub const NOT_ASSOCIATED: Id = Id::MAX;

pub const CONTROLLER: Rank = 0;

/// What [`main_entry`] decided this process is.
#[derive(Debug)]
pub enum Role {
    /// Rank 0: run the user program through this controller.
    Controller(Controller),
    /// A worker whose dispatch loop has been stopped. The process has
    /// nothing left to do.
    WorkerDone(WorkerSummary),
}

impl Role {
    pub fn is_controller(&self) -> bool {
        matches!(self, Role::Controller(_))
    }
}

/// Entry point every rank calls once, with the same registrations and the
/// same configuration.
pub fn main_entry<T>(transport: T, registry: Registry, config: PmiConfig) -> Result<Role, Error>
where
    T: Transport + 'static,
{
    let rank = transport.rank();
    let size = transport.size();
    if rank >= size {
        return Err(Error::Config(format!(
            "rank {rank} is out of range for {size} ranks"
        )));
    }

    if rank == CONTROLLER {
        info!(
            "controller of {} ranks, status channel {}",
            size,
            if config.status_channel { "on" } else { "off" }
        );
        Ok(Role::Controller(Controller::new(
            Box::new(transport),
            registry,
            config,
        )))
    } else {
        Worker::new(Box::new(transport), registry, config)
            .run()
            .map(Role::WorkerDone)
    }
}
