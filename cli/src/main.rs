use std::env;
use std::error::Error;
use std::process::{Command, ExitCode};

use pmi::{
    parallel_method, parallel_proxy, Controller, ParallelClass, PmiConfig, QuicConfig,
    QuicTransport, Registry, Role, UserError,
};
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_RANKS: usize = 4;
const INCREMENTS: usize = 5;

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug)]
#[archive(check_bytes)]
pub struct Window {
    pub start: u64,
    pub step: u64,
}

#[derive(Default, Debug)]
pub struct Counter {
    value: u64,
    step: u64,
}

impl ParallelClass for Counter {
    const NAME: &'static str = "Counter";
}

impl Counter {
    fn increment(&mut self) {
        self.value += self.step;
    }

    fn value(&mut self) -> u64 {
        self.value
    }

    fn set_window(&mut self, window: Window) -> Result<(), UserError> {
        if window.step == 0 {
            return Err(UserError::new("bad value: step must be positive"));
        }
        self.value = window.start;
        self.step = window.step;
        Ok(())
    }
}

parallel_method!(Increment => Counter::increment() -> ());
parallel_method!(Value => Counter::value() -> u64);
parallel_method!(SetWindow => Counter::set_window(Window) -> Result<(), UserError>);

parallel_proxy! {
    struct CounterProxy(Counter) {
        fn increment() => Increment;
        set set_window(Window) => SetWindow;
        gather values() => Value;
    }
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register_class::<Counter>()
        .register_method::<Increment>()
        .register_gathering_method::<Value>()
        .register_method_with_argument::<SetWindow>();
    registry
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // launched by ourselves with a rank assigned, or by the user
    let result = match env::var("PMI_RANK") {
        Ok(_) => run_rank(),
        Err(_) => launch(),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Starts one copy of this binary per rank on the local machine.
fn launch() -> Result<(), Box<dyn Error>> {
    let size = match env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => DEFAULT_RANKS,
    };
    let controller = env::var("PMI_CONTROLLER")
        .unwrap_or_else(|_| pmi::config::DEFAULT_CONTROLLER_ADDR.to_owned());
    let exe = env::current_exe()?;
    info!("launching {} ranks, controller at {}", size, controller);

    let mut children = Vec::with_capacity(size);
    for rank in 0..size {
        let child = Command::new(&exe)
            .env("PMI_RANK", rank.to_string())
            .env("PMI_SIZE", size.to_string())
            .env("PMI_CONTROLLER", &controller)
            .spawn()?;
        children.push((rank, child));
    }

    let mut failed = Vec::new();
    for (rank, mut child) in children {
        if !child.wait()?.success() {
            failed.push(rank);
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!("ranks {failed:?} failed").into())
    }
}

fn run_rank() -> Result<(), Box<dyn Error>> {
    let transport = QuicTransport::connect(QuicConfig::from_env()?)?;
    match pmi::main_entry(transport, registry(), PmiConfig::default())? {
        Role::Controller(controller) => drive(&controller)?,
        Role::WorkerDone(summary) => info!(
            "worker {} done after {} commands",
            summary.rank, summary.commands
        ),
    }
    Ok(())
}

fn drive(controller: &Controller) -> Result<(), Box<dyn Error>> {
    let mut counter = CounterProxy::create(controller, Counter::default())?;
    counter.set_window(Window { start: 10, step: 2 })?;
    for _ in 0..INCREMENTS {
        counter.increment()?;
    }

    let values = counter.values()?;
    println!("values by rank: {values:?}");
    let total = counter
        .object_mut()
        .invoke_reduce::<Value, _>(|a, b| a + b)?;
    println!("sum over {} ranks: {}", controller.size(), total);

    if let Err(e) = counter.set_window(Window { start: 0, step: 0 }) {
        println!("rejected window: {e}");
    }

    for (rank, ids) in controller.dump()?.iter().enumerate() {
        println!("rank {rank} holds objects {ids:?}");
    }
    counter.destroy()?;

    println!("{:?}", controller.stats());
    controller.end_all()?;
    Ok(())
}
