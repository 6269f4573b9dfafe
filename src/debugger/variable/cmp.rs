use crate::debugger::debugee::dwarf::r#type::MAX_DIMENSIONS;
use smallvec::{smallvec, SmallVec};
use std::mem;

/// Offset-aware memory comparator.
///
/// Returns the first element-aligned byte offset where `a` and `b` differ, or
/// `None` if the spans are equal. Comparison runs over machine words first and
/// falls back to a byte-wise scan for the tail.
pub fn offmemcmp(a: &[u8], b: &[u8], element_size: usize) -> Option<usize> {
    debug_assert_eq!(a.len(), b.len());
    debug_assert!(element_size > 0);

    const WORD: usize = mem::size_of::<u64>();

    let mut first_diff = None;
    let head = a.len() - a.len() % WORD;
    for (chunk_no, (ca, cb)) in a[..head]
        .chunks_exact(WORD)
        .zip(b[..head].chunks_exact(WORD))
        .enumerate()
    {
        let wa = u64::from_le_bytes(ca.try_into().expect("chunk is word-sized"));
        let wb = u64::from_le_bytes(cb.try_into().expect("chunk is word-sized"));
        if wa != wb {
            let inner = ca
                .iter()
                .zip(cb)
                .position(|(x, y)| x != y)
                .expect("words differ");
            first_diff = Some(chunk_no * WORD + inner);
            break;
        }
    }
    if first_diff.is_none() {
        first_diff = a[head..]
            .iter()
            .zip(&b[head..])
            .position(|(x, y)| x != y)
            .map(|pos| head + pos);
    }

    let diff_at = first_diff?;
    Some(diff_at - diff_at % element_size)
}

/// Reconstruct a row-major (last index fastest) N-dimensional index from a byte
/// offset inside an array.
pub fn offset_to_indices(
    offset: usize,
    element_size: u64,
    extents: &[u64],
) -> SmallVec<[u64; MAX_DIMENSIONS]> {
    let mut linear = offset as u64 / element_size;
    let mut indices: SmallVec<[u64; MAX_DIMENSIONS]> = smallvec![0; extents.len()];
    for dim in (0..extents.len()).rev() {
        indices[dim] = linear % extents[dim];
        linear /= extents[dim];
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offmemcmp_equal() {
        let a = [0u8; 40];
        let b = [0u8; 40];
        assert_eq!(offmemcmp(&a, &b, 4), None);

        let a: Vec<u8> = (0..=255).collect();
        let b = a.clone();
        assert_eq!(offmemcmp(&a, &b, 8), None);
    }

    #[test]
    fn test_offmemcmp_first_diff_is_element_aligned() {
        let a = [0u8; 32];
        for diff_at in 0..32 {
            let mut b = [0u8; 32];
            b[diff_at] = 1;
            for element_size in [1usize, 2, 4, 8] {
                let found = offmemcmp(&a, &b, element_size).expect("spans differ");
                assert_eq!(found, diff_at - diff_at % element_size);
                assert_eq!(found % element_size, 0);
                assert_eq!(a[..found], b[..found]);
            }
        }
    }

    #[test]
    fn test_offmemcmp_tail_is_covered() {
        // 13 bytes: one word plus a 5-byte tail
        let a = [7u8; 13];
        let mut b = [7u8; 13];
        b[12] = 8;
        assert_eq!(offmemcmp(&a, &b, 1), Some(12));
    }

    #[test]
    fn test_offmemcmp_reports_earliest_difference() {
        let a = [0u8; 24];
        let mut b = [0u8; 24];
        b[9] = 1;
        b[17] = 1;
        assert_eq!(offmemcmp(&a, &b, 4), Some(8));
    }

    #[test]
    fn test_index_reconstruction() {
        // int arr[10][10][10], arr[5][7][6] at byte offset ((5*10 + 7)*10 + 6)*4
        let extents = [10u64, 10, 10];
        let offset = ((5 * 10 + 7) * 10 + 6) * 4;
        let indices = offset_to_indices(offset, 4, &extents);
        assert_eq!(indices.as_slice(), &[5, 7, 6]);
    }

    #[test]
    fn test_index_reconstruction_round_trip() {
        let extents = [3u64, 4, 5];
        let element_size = 8u64;
        for i in 0..3u64 {
            for j in 0..4u64 {
                for k in 0..5u64 {
                    let linear = (i * 4 + j) * 5 + k;
                    let offset = (linear * element_size) as usize;
                    let indices = offset_to_indices(offset, element_size, &extents);
                    assert_eq!(indices.as_slice(), &[i, j, k]);
                }
            }
        }
    }

    #[test]
    fn test_one_dimension() {
        let indices = offset_to_indices(6 * 4, 4, &[10]);
        assert_eq!(indices.as_slice(), &[6]);
    }
}
