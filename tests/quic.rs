#![cfg(feature = "quic")]

mod common;

use std::{
    net::{SocketAddr, UdpSocket},
    thread,
};

use common::*;
use pmi::{Error, QuicConfig, QuicTransport, Role};

fn free_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

#[test]
fn counter_over_loopback_quic() {
    let size: usize = 3;
    let addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let config = |rank: usize| {
        QuicConfig::builder()
            .rank(rank)
            .size(size)
            .controller_addr(addr)
            .build()
    };

    let workers: Vec<_> = (1..size)
        .map(|rank| {
            let config = config(rank);
            thread::spawn(move || {
                let transport = QuicTransport::connect(config).unwrap();
                match pmi::main_entry(transport, registry(rank), checked()).unwrap() {
                    Role::WorkerDone(summary) => summary,
                    Role::Controller(_) => panic!("worker {rank} returned as controller"),
                }
            })
        })
        .collect();

    let transport = QuicTransport::connect(config(0)).unwrap();
    let Role::Controller(controller) = pmi::main_entry(transport, registry(0), checked()).unwrap()
    else {
        panic!("rank 0 ran the dispatch loop");
    };

    let mut counter = controller.create_default::<Counter>().unwrap();

    let err = counter.invoke_with_argument::<Load>(oversized()).unwrap_err();
    assert!(matches!(err, Error::Encode));
    assert!(controller.abort_reason().is_none());
    assert!(controller.is_workers_active());

    counter.invoke_with_argument::<SetStep>(5).unwrap();
    for _ in 0..5 {
        counter.invoke::<Increment>().unwrap();
    }
    assert_eq!(counter.invoke_gather::<Count>().unwrap(), vec![25; 3]);
    counter.destroy().unwrap();
    controller.end_all().unwrap();
    let commands = controller.stats().commands;
    drop(controller);

    for worker in workers {
        let summary = worker.join().unwrap();
        assert_eq!(summary.commands, commands);
        assert_eq!(summary.objects_left, 0);
    }
}
