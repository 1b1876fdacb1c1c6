//! Point-to-point and collective exchange of records between workers.
//!
//! Every function here is a blocking collective: all ranks of the
//! communicator must reach the matching call. Cell records travel as
//! structured MPI datatypes derived from their layout.

use mpi::collective::SystemOperation;
use mpi::datatype::{Partition, PartitionMut};
use mpi::traits::{CommunicatorCollectives, Equivalence};
use num::traits::Zero;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Gather an array to all processes.
pub fn gather_to_all<T: Equivalence, C: CommunicatorCollectives>(arr: &[T], comm: &C) -> Vec<T> {
    let size = comm.size();

    // First share the individual sizes of each local contribution.
    let local_len = arr.len() as i32;
    let mut sizes = vec![0; size as usize];
    comm.all_gather_into(&local_len, &mut sizes);

    let recv_len = sizes.iter().sum::<i32>() as usize;

    let mut recvbuffer = Vec::<T>::with_capacity(recv_len);
    let buf: &mut [T] = unsafe { std::mem::transmute(recvbuffer.spare_capacity_mut()) };

    let recv_displs = displacements(&sizes);
    let mut recv_partition = PartitionMut::new(buf, sizes, &recv_displs[..]);
    comm.all_gather_varcount_into(arr, &mut recv_partition);

    unsafe { recvbuffer.set_len(recv_len) };

    recvbuffer
}

/// Get the global size of a distributed array.
pub fn global_size<T, C: CommunicatorCollectives>(arr: &[T], comm: &C) -> usize {
    let local_size = arr.len();
    let mut global_size = 0;
    comm.all_reduce_into(&local_size, &mut global_size, SystemOperation::sum());
    global_size
}

/// The exclusive prefix sum of a value over the ranks.
///
/// Rank 0 receives zero.
pub fn global_exclusive_sum<T: Equivalence + Zero + Copy, C: CommunicatorCollectives>(
    value: T,
    comm: &C,
) -> T {
    let mut result = T::zero();
    comm.exclusive_scan_into(&value, &mut result, SystemOperation::sum());
    result
}

/// Redistribute an array via an all-to-all varcount operation.
///
/// `counts[r]` is the number of leading unconsumed elements of `arr`
/// destined for rank `r`; the elements must already be grouped by
/// destination rank in rank order.
pub fn redistribute<T: Equivalence, C: CommunicatorCollectives>(
    arr: &[T],
    counts: &[i32],
    comm: &C,
) -> Vec<T> {
    redistribute_with_counts(arr, counts, comm).0
}

/// Like [redistribute], additionally returning how many elements arrived
/// from each rank.
///
/// The receive counts are what a later [redistribute] call needs to route
/// per-element answers back to the ranks that asked, in the order they
/// asked (the lookup/return round trip).
pub fn redistribute_with_counts<T: Equivalence, C: CommunicatorCollectives>(
    arr: &[T],
    counts: &[i32],
    comm: &C,
) -> (Vec<T>, Vec<i32>) {
    assert_eq!(counts.len(), comm.size() as usize);

    // First send the counts around via an alltoall operation.
    let mut recv_counts = vec![0; counts.len()];
    comm.all_to_all_into(counts, &mut recv_counts);

    // We have the recv counts. Allocate space and set up the partitions.
    let nelems = recv_counts.iter().sum::<i32>() as usize;

    let mut output = Vec::<T>::with_capacity(nelems);
    let out_buf: &mut [T] = unsafe { std::mem::transmute(output.spare_capacity_mut()) };

    let send_partition = Partition::new(arr, counts, displacements(counts));
    let mut recv_partition =
        PartitionMut::new(out_buf, &recv_counts[..], displacements(&recv_counts));

    comm.all_to_all_varcount_into(&send_partition, &mut recv_partition);

    unsafe { output.set_len(nelems) };

    (output, recv_counts)
}

/// Get a seeded rng.
pub fn seeded_rng(seed: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed as u64)
}

/// Compute displacements from a vector of counts.
///
/// For counts `[3, 4, 5]` the displacements are `[0, 3, 7]`.
pub fn displacements(counts: &[i32]) -> Vec<i32> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::displacements;

    #[test]
    fn test_displacements() {
        assert_eq!(displacements(&[3, 4, 5]), vec![0, 3, 7]);
        assert_eq!(displacements(&[0, 2, 0, 1]), vec![0, 0, 2, 2]);
        assert!(displacements(&[]).is_empty());
    }
}
