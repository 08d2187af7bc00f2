//! Sectioned writes with hflush, over several block and chunk geometries.

use crate::common::*;
use cascadefs::LocalCluster;

const SECTIONS: usize = 10;

/// Write `FILE_SIZE` bytes in ten sections, hflushing after each and
/// verifying the section through a new reader, then write the remainder,
/// close, and check the whole file.
fn do_the_job(cluster: &LocalCluster, path: &str, block_size: u64, replicas: usize) {
    let expected = init_buffer(FILE_SIZE);
    let mut session = create(cluster, path, block_size, replicas);

    let tenth = FILE_SIZE / SECTIONS;
    let rounding = FILE_SIZE - tenth * SECTIONS;

    for i in 0..SECTIONS {
        let from = tenth * i;
        session.write(&expected[from..from + tenth]).unwrap();
        let visible = session.hflush().unwrap();
        assert_eq!(visible, (from + tenth) as u64, "section {} visible length", i);

        let reader = cluster.open(path).unwrap();
        assert_eq!(reader.visible_length().unwrap(), (from + tenth) as u64);
        let section = reader.read(from as u64, tenth as u64).unwrap();
        assert_eq!(section.len(), tenth, "section {} short read", i);
        check_data(&section, from, &expected, &format!("Partial verification of section {}", i));
    }

    session
        .write(&expected[tenth * SECTIONS..tenth * SECTIONS + rounding])
        .unwrap();
    assert_eq!(session.close().unwrap(), FILE_SIZE as u64);

    let status = cluster.file_status(path).unwrap();
    assert!(status.complete);
    assert_eq!(status.length, FILE_SIZE as u64, "File size doesn't match");
    check_full_file(cluster, path, &expected, "hflush()");
}

#[test]
fn test_hflush_default_geometry() {
    let cluster = start_cluster(BLOCK_SIZE, 512, 2);
    do_the_job(&cluster, "/hflush/default.dat", BLOCK_SIZE, 2);
}

#[test]
fn test_hflush_chunk_512_block_1536() {
    let cluster = start_cluster(1536, 512, 2);
    do_the_job(&cluster, "/hflush/chunk512.dat", 1536, 2);
}

#[test]
fn test_hflush_chunk_400_block_1200() {
    let cluster = start_cluster(1200, 400, 2);
    do_the_job(&cluster, "/hflush/chunk400.dat", 1200, 2);
}

#[test]
fn test_hflush_chunk_does_not_divide_block() {
    let cluster = start_cluster(1000, 400, 2);
    do_the_job(&cluster, "/hflush/ragged.dat", 1000, 2);
}

#[test]
fn test_hflush_three_replicas() {
    let cluster = start_cluster(1536, 512, 3);
    do_the_job(&cluster, "/hflush/three.dat", 1536, 3);
}

#[test]
fn test_hflush_single_replica() {
    let cluster = start_cluster(BLOCK_SIZE, 512, 1);
    do_the_job(&cluster, "/hflush/single.dat", BLOCK_SIZE, 1);
}

#[test]
fn test_repeated_hflush_without_writes() {
    let cluster = start_cluster(1536, 512, 2);
    let expected = init_buffer(700);
    let mut session = create(&cluster, "/hflush/repeat.dat", 1536, 2);

    session.write(&expected).unwrap();
    assert_eq!(session.hflush().unwrap(), 700);
    assert_eq!(session.hflush().unwrap(), 700);
    assert_eq!(session.hflush().unwrap(), 700);

    session.close().unwrap();
    check_full_file(&cluster, "/hflush/repeat.dat", &expected, "repeat");
}

#[test]
fn test_hflush_on_block_boundary() {
    let cluster = start_cluster(1200, 400, 2);
    let expected = init_buffer(2400);
    let mut session = create(&cluster, "/hflush/boundary.dat", 1200, 2);

    session.write(&expected[..1200]).unwrap();
    assert_eq!(session.hflush().unwrap(), 1200);
    session.write(&expected[1200..]).unwrap();
    assert_eq!(session.hflush().unwrap(), 2400);

    let reader = cluster.open("/hflush/boundary.dat").unwrap();
    let data = reader.read(0, 2400).unwrap();
    check_data(&data, 0, &expected, "boundary");

    session.close().unwrap();
    let status = cluster.file_status("/hflush/boundary.dat").unwrap();
    assert_eq!(status.block_count, 2);
}
