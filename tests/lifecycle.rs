mod common;

use common::*;
use pmi::Error;

#[test]
fn end_all_releases_workers_and_rejects_later_commands() {
    let outcome = default_run(4, |controller| {
        let mut counter = controller.create_default::<Counter>().unwrap();
        counter.invoke::<Increment>().unwrap();
        controller.end_all().unwrap();
        assert!(!controller.is_workers_active());

        assert!(matches!(
            counter.invoke::<Increment>(),
            Err(Error::WorkersTerminated)
        ));
        assert!(matches!(
            controller.create_default::<Counter>(),
            Err(Error::WorkersTerminated)
        ));
        assert!(matches!(controller.end_all(), Err(Error::WorkersTerminated)));
        assert!(matches!(controller.dump(), Err(Error::WorkersTerminated)));

        // nothing left to tell the workers
        counter.destroy().unwrap();
        assert!(controller.live_objects().is_empty());
        controller.stats()
    });

    let stats = outcome.controller;
    assert_eq!(stats.objects_destroyed, 0);
    assert_eq!(stats.commands, 5);
    for worker in outcome.workers {
        let summary = worker.unwrap();
        assert_eq!(summary.commands, 5);
        assert_eq!(summary.objects_left, 1);
    }
}

#[test]
fn dropping_the_controller_stops_the_workers() {
    let outcome = default_run(3, |controller| {
        let counter = controller.create_default::<Counter>().unwrap();
        drop(counter);
        drop(controller);
    });
    for worker in outcome.workers {
        let summary = worker.unwrap();
        // associate, create, destroy, stop
        assert_eq!(summary.commands, 4);
        assert_eq!(summary.objects_left, 0);
    }
}

#[test]
fn dropping_an_object_destroys_it_everywhere() {
    default_run(3, |controller| {
        let first = controller.create_default::<Counter>().unwrap();
        let second = controller.create_default::<Counter>().unwrap();
        assert_eq!(controller.dump().unwrap(), vec![vec![0, 1]; 3]);

        drop(first);
        assert_eq!(controller.dump().unwrap(), vec![vec![1]; 3]);

        drop(second);
        assert_eq!(controller.dump().unwrap(), vec![Vec::<u32>::new(); 3]);
        assert_eq!(controller.stats().objects_destroyed, 2);
    });
}

#[test]
fn object_ids_are_never_reused() {
    let outcome = default_run(2, |controller| {
        let mut ids = Vec::new();
        for _ in 0..5 {
            let counter = controller.create_default::<Counter>().unwrap();
            ids.push(counter.id());
            counter.destroy().unwrap();
        }
        ids
    });
    assert_eq!(outcome.controller, vec![0, 1, 2, 3, 4]);
}

#[test]
fn unchecked_runs_keep_the_same_protocol() {
    let outcome = run(4, unchecked(), registry, |controller| {
        let mut counter = controller.create_default::<Counter>().unwrap();
        counter.invoke_with_argument::<SetStep>(2).unwrap();
        for _ in 0..5 {
            counter.invoke::<Increment>().unwrap();
        }
        let counts = counter.invoke_gather::<Count>().unwrap();
        assert_eq!(controller.dump().unwrap(), vec![vec![0]; 4]);
        counter.destroy().unwrap();
        controller.end_all().unwrap();
        (counts, controller.stats())
    });

    let (counts, stats) = outcome.controller;
    assert_eq!(counts, vec![10; 4]);
    for worker in outcome.workers {
        assert_eq!(worker.unwrap().commands, stats.commands);
    }
}
