//! Reader-side guarantees: monotonic growth and prefix clamping.

use crate::common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[test]
fn test_read_past_visible_length_returns_prefix() {
    let cluster = start_cluster(1536, 512, 2);
    let expected = init_buffer(1000);
    let mut session = create(&cluster, "/vis/prefix.dat", 1536, 2);

    session.write(&expected[..600]).unwrap();
    session.hflush().unwrap();
    session.write(&expected[600..]).unwrap();

    let reader = cluster.open("/vis/prefix.dat").unwrap();
    let data = reader.read(0, 1000).unwrap();
    assert_eq!(data.len(), 600);
    check_data(&data, 0, &expected, "prefix");

    assert!(reader.read(600, 100).unwrap().is_empty());
    assert!(reader.read(5000, 10).unwrap().is_empty());

    session.close().unwrap();
}

#[test]
fn test_reader_observes_later_flushes() {
    let cluster = start_cluster(1200, 400, 2);
    let expected = init_buffer(3000);
    let mut session = create(&cluster, "/vis/later.dat", 1200, 2);

    session.write(&expected[..100]).unwrap();
    session.hflush().unwrap();

    let reader = cluster.open("/vis/later.dat").unwrap();
    assert_eq!(reader.visible_length().unwrap(), 100);

    session.write(&expected[100..]).unwrap();
    session.hflush().unwrap();

    assert_eq!(reader.visible_length().unwrap(), 3000);
    let data = reader.read(0, 3000).unwrap();
    check_data(&data, 0, &expected, "later");

    session.close().unwrap();
}

#[test]
fn test_visible_length_never_decreases() {
    let cluster = start_cluster(1536, 512, 2);
    let expected = init_buffer(FILE_SIZE);
    let mut session = create(&cluster, "/vis/monotonic.dat", 1536, 2);
    let reader = cluster.open("/vis/monotonic.dat").unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let watcher = scope.spawn(|| {
            let mut last = 0u64;
            let mut observations = 0usize;
            while !done.load(Ordering::Acquire) {
                let visible = reader.visible_length().unwrap();
                assert!(visible >= last, "visible length went from {} to {}", last, visible);
                let data = reader.read(0, visible).unwrap();
                assert!(data.len() as u64 >= last);
                check_data(&data, 0, &expected, "concurrent prefix");
                last = visible;
                observations += 1;
            }
            observations
        });

        for piece in expected.chunks(777) {
            session.write(piece).unwrap();
            session.hflush().unwrap();
        }
        done.store(true, Ordering::Release);
        assert!(watcher.join().unwrap() > 0);
    });

    session.close().unwrap();
    check_full_file(&cluster, "/vis/monotonic.dat", &expected, "monotonic");
}
