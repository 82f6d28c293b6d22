//! The PMI protocol proper: name registration, id association, the
//! controller session and the worker dispatch loop.

pub mod association;
pub mod controller;
pub mod registry;
pub mod status;
pub mod wire;
pub mod worker;

pub use controller::{Controller, ParallelObject, ProtocolStats};
pub use registry::{
    ArgumentCall, GatheringCall, IntoOutcome, Invocable, Method, MethodWithArgument,
    ParallelClass, PlainCall, Registry,
};
pub use status::StatusReport;
pub use wire::{Command, CommandCode, Payload, Reply};
pub use worker::{ObjectTable, Step, Worker, WorkerSummary};
