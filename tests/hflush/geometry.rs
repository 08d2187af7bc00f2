//! Randomized geometry: arbitrary block, chunk and write sizes.

use crate::common::*;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_flushed_prefix_is_readable(
        chunk in 16u32..300,
        chunks_per_block in 1u64..6,
        writes in prop::collection::vec(1usize..900, 1..8),
        seed in any::<u64>(),
    ) {
        let block_size = chunk as u64 * chunks_per_block;
        let cluster = start_cluster(block_size, chunk, 2);
        let total: usize = writes.iter().sum();
        let expected = init_buffer_seeded(total, seed);
        let mut session = create(&cluster, "/prop/file.dat", block_size, 2);

        let mut offset = 0usize;
        for len in &writes {
            session.write(&expected[offset..offset + len]).unwrap();
            offset += len;
            prop_assert_eq!(session.hflush().unwrap(), offset as u64);

            let reader = cluster.open("/prop/file.dat").unwrap();
            let data = reader.read(0, total as u64).unwrap();
            prop_assert_eq!(&data[..], &expected[..offset]);
        }

        prop_assert_eq!(session.close().unwrap(), total as u64);
        let status = cluster.file_status("/prop/file.dat").unwrap();
        prop_assert_eq!(status.length, total as u64);
        let expected_blocks = (total as u64 + block_size - 1) / block_size;
        prop_assert_eq!(status.block_count as u64, expected_blocks);
    }
}
