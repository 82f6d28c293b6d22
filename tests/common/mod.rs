#![allow(dead_code)]

use std::thread;

use pmi::{
    parallel_method, Controller, Error, LocalTransport, ParallelClass, PmiConfig, Rank,
    Registry, Role, Transport, UserError, WorkerSummary,
};
use tracing_subscriber::EnvFilter;

#[derive(Default, Debug)]
pub struct Counter {
    pub count: u64,
    pub step: u64,
}

impl ParallelClass for Counter {
    const NAME: &'static str = "Counter";
}

impl Counter {
    pub fn increment(&mut self) {
        self.count += self.step.max(1);
    }

    pub fn count(&mut self) -> u64 {
        self.count
    }

    pub fn set_step(&mut self, step: u64) -> Result<(), UserError> {
        if step == 0 {
            return Err(UserError::new("bad value: step 0"));
        }
        self.step = step;
        Ok(())
    }

    pub fn load(&mut self, bytes: Vec<u8>) {
        self.count = bytes.len() as u64;
    }
}

parallel_method!(pub Increment => Counter::increment() -> ());
parallel_method!(pub Count => Counter::count() -> u64);
parallel_method!(pub SetStep => Counter::set_step(u64) -> Result<(), UserError>);
parallel_method!(pub Load => Counter::load(Vec<u8>) -> ());

/// An argument too large to fit in a single frame.
pub fn oversized() -> Vec<u8> {
    vec![7u8; pmi::protocol::wire::MAX_FRAME_LEN]
}

/// Knows which rank it lives on; fails on rank 2.
#[derive(Debug)]
pub struct Flaky {
    pub rank: Rank,
}

impl ParallelClass for Flaky {
    const NAME: &'static str = "Flaky";
}

impl Flaky {
    pub fn check(&mut self) -> Result<(), UserError> {
        if self.rank == 2 {
            return Err(UserError::new(format!("bad value on rank {}", self.rank)));
        }
        Ok(())
    }

    pub fn rank(&mut self) -> Result<u64, UserError> {
        Ok(self.rank as u64)
    }
}

parallel_method!(pub Check => Flaky::check() -> Result<(), UserError>);
parallel_method!(pub WhichRank => Flaky::rank() -> Result<u64, UserError>);

pub fn registry(rank: Rank) -> Registry {
    let mut registry = Registry::new();
    registry
        .register_class::<Counter>()
        .register_method::<Increment>()
        .register_gathering_method::<Count>()
        .register_method_with_argument::<SetStep>()
        .register_method_with_argument::<Load>()
        .register_class_with(move || Flaky { rank })
        .register_method::<Check>()
        .register_gathering_method::<WhichRank>();
    registry
}

pub struct Outcome<R> {
    pub controller: R,
    pub workers: Vec<Result<WorkerSummary, Error>>,
}

/// Runs a controller and `size - 1` worker threads over a local transport.
/// `drive` gets the controller by value; dropping it releases the workers.
pub fn run<R>(
    size: usize,
    config: PmiConfig,
    registry: fn(Rank) -> Registry,
    drive: impl FnOnce(Controller) -> R,
) -> Outcome<R> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut group = LocalTransport::group(size);
    let workers: Vec<_> = group.drain(1..).collect();
    let controller_transport = group.pop().expect("controller endpoint");

    let handles: Vec<_> = workers
        .into_iter()
        .map(|transport| {
            let config = config.clone();
            thread::spawn(move || {
                let rank = transport.rank();
                match pmi::main_entry(transport, registry(rank), config)? {
                    Role::WorkerDone(summary) => Ok(summary),
                    Role::Controller(_) => panic!("rank {rank} returned as controller"),
                }
            })
        })
        .collect();

    let controller = match pmi::main_entry(controller_transport, registry(0), config) {
        Ok(Role::Controller(controller)) => controller,
        Ok(Role::WorkerDone(_)) => panic!("rank 0 ran the dispatch loop"),
        Err(e) => panic!("controller entry failed: {e}"),
    };
    let controller = drive(controller);

    let workers = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker thread panicked"))
        .collect();
    Outcome {
        controller,
        workers,
    }
}

pub fn checked() -> PmiConfig {
    PmiConfig::builder().status_channel(true).build()
}

pub fn unchecked() -> PmiConfig {
    PmiConfig::builder().status_channel(false).build()
}

/// Status channel on, every rank fully registered.
pub fn default_run<R>(size: usize, drive: impl FnOnce(Controller) -> R) -> Outcome<R> {
    run(size, checked(), registry, drive)
}
