// LocalCommunicator — collectives between threads over crossbeam channels
//
// `create_world(n)` wires a full mesh of point-to-point channels: rank r
// owns the sending end of (r -> d) for every d and the receiving end of
// (s -> r) for every s. Channels are unbounded, so a send never blocks and
// only receives can stall; every receive is bounded by the timeout.
//
// ALL-REDUCE (ring):
//
//   The buffer is cut into `world` chunks of ceil(len / world) elements.
//   Reduce-scatter: in step s, rank r sends chunk (r - s) to r + 1 and folds
//   chunk (r - s - 1) received from r - 1 into its own copy. After
//   world - 1 steps rank r holds the full reduction of chunk (r + 1).
//   All-gather: the reduced chunks travel once more around the ring and
//   overwrite the stale copies.
//
// Sub-groups reuse the world channels. Messages carry the collective's
// name so that ranks issuing collectives out of order fail loudly instead
// of mixing buffers.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use marten_core::{Error, Result};

use super::{Collective, CommGroup, ReduceKind};

#[derive(Debug)]
struct Message {
    op: &'static str,
    data: Vec<f64>,
}

#[derive(Debug)]
struct Endpoint {
    world_rank: usize,
    /// Indexed by destination world rank.
    senders: Vec<Sender<Message>>,
    /// Indexed by source world rank.
    receivers: Vec<Receiver<Message>>,
}

/// One rank of a group of threads in this process.
#[derive(Debug, Clone)]
pub struct LocalCommunicator {
    endpoint: Arc<Endpoint>,
    group: CommGroup,
    rank: usize,
    timeout: Duration,
}

impl LocalCommunicator {
    /// One communicator per rank of a new world of `n` ranks. Hand each to
    /// its own thread.
    pub fn create_world(n: usize, timeout: Duration) -> Result<Vec<LocalCommunicator>> {
        if n == 0 {
            return Err(Error::msg("a communication world needs at least one rank"));
        }
        let mut senders: Vec<Vec<Sender<Message>>> = vec![Vec::with_capacity(n); n];
        let mut receivers: Vec<Vec<Receiver<Message>>> = vec![Vec::with_capacity(n); n];
        for src in 0..n {
            for dst_receivers in receivers.iter_mut() {
                let (tx, rx) = unbounded();
                senders[src].push(tx);
                dst_receivers.push(rx);
            }
        }
        let group = CommGroup::world(n);
        let comms = senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| LocalCommunicator {
                endpoint: Arc::new(Endpoint {
                    world_rank: rank,
                    senders,
                    receivers,
                }),
                group: group.clone(),
                rank,
                timeout,
            })
            .collect();
        tracing::debug!(world_size = n, timeout_ms = timeout.as_millis() as u64, "communication world created");
        Ok(comms)
    }

    pub fn world_rank(&self) -> usize {
        self.endpoint.world_rank
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A communicator over a subset of this group. `ranks` are ranks of this
    /// group, listed in the order that numbers the new group; this rank must
    /// be one of them.
    pub fn sub_group(&self, name: &str, ranks: &[usize]) -> Result<LocalCommunicator> {
        let mut world_ranks = Vec::with_capacity(ranks.len());
        for &r in ranks {
            let world = *self.group.ranks.get(r).ok_or_else(|| {
                Error::msg(format!(
                    "rank {r} is not in group '{}' of size {}",
                    self.group.name,
                    self.group.size()
                ))
            })?;
            if world_ranks.contains(&world) {
                return Err(Error::msg(format!("rank {r} listed twice for group '{name}'")));
            }
            world_ranks.push(world);
        }
        let group = CommGroup::new(name, world_ranks);
        let rank = group.group_rank(self.world_rank()).ok_or_else(|| {
            Error::msg(format!(
                "world rank {} is not a member of group '{name}'",
                self.world_rank()
            ))
        })?;
        Ok(LocalCommunicator {
            endpoint: Arc::clone(&self.endpoint),
            group,
            rank,
            timeout: self.timeout,
        })
    }

    fn send(&self, to: usize, op: &'static str, data: Vec<f64>) -> Result<()> {
        let world = self.group.ranks[to];
        self.endpoint.senders[world]
            .send(Message { op, data })
            .map_err(|_| Error::msg(format!("{op}: rank {world} has left the group")))
    }

    fn recv(&self, from: usize, op: &'static str) -> Result<Vec<f64>> {
        let world = self.group.ranks[from];
        match self.endpoint.receivers[world].recv_timeout(self.timeout) {
            Ok(msg) if msg.op == op => Ok(msg.data),
            Ok(msg) => Err(Error::msg(format!(
                "collective mismatch on rank {}: expected {op} from rank {world}, got {}",
                self.world_rank(),
                msg.op
            ))),
            Err(RecvTimeoutError::Timeout) => Err(Error::CollectiveTimeout {
                op: op.to_string(),
                rank: self.world_rank(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::msg(format!("{op}: rank {world} has left the group")))
            }
        }
    }

    fn exchange_all(&self, op: &'static str, data: &[f64]) -> Result<Vec<Vec<f64>>> {
        let n = self.world_size();
        for peer in (0..n).filter(|&p| p != self.rank) {
            self.send(peer, op, data.to_vec())?;
        }
        (0..n)
            .map(|peer| {
                if peer == self.rank {
                    Ok(data.to_vec())
                } else {
                    self.recv(peer, op)
                }
            })
            .collect()
    }
}

fn chunk_bounds(index: usize, chunk: usize, len: usize) -> (usize, usize) {
    let start = (index * chunk).min(len);
    (start, (start + chunk).min(len))
}

impl Collective for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.size()
    }

    fn group(&self) -> &CommGroup {
        &self.group
    }

    fn all_reduce(&self, data: &mut [f64], op: ReduceKind) -> Result<()> {
        const OP: &str = "all_reduce";
        let n = self.world_size();
        if n == 1 {
            return Ok(());
        }
        let len = data.len();
        let chunk = len.div_ceil(n);
        let right = (self.rank + 1) % n;
        let left = (self.rank + n - 1) % n;

        for step in 0..n - 1 {
            let send_idx = (self.rank + n - step) % n;
            let recv_idx = (self.rank + 2 * n - step - 1) % n;
            let (s0, s1) = chunk_bounds(send_idx, chunk, len);
            self.send(right, OP, data[s0..s1].to_vec())?;
            let incoming = self.recv(left, OP)?;
            let (r0, r1) = chunk_bounds(recv_idx, chunk, len);
            if incoming.len() != r1 - r0 {
                return Err(Error::msg(format!(
                    "{OP}: rank {left} sent {} elements, expected {}",
                    incoming.len(),
                    r1 - r0
                )));
            }
            for (dst, v) in data[r0..r1].iter_mut().zip(incoming) {
                *dst = op.combine(*dst, v);
            }
        }

        for step in 0..n - 1 {
            let send_idx = (self.rank + 1 + n - step) % n;
            let recv_idx = (self.rank + n - step) % n;
            let (s0, s1) = chunk_bounds(send_idx, chunk, len);
            self.send(right, OP, data[s0..s1].to_vec())?;
            let incoming = self.recv(left, OP)?;
            let (r0, r1) = chunk_bounds(recv_idx, chunk, len);
            if incoming.len() != r1 - r0 {
                return Err(Error::msg(format!(
                    "{OP}: rank {left} sent {} elements, expected {}",
                    incoming.len(),
                    r1 - r0
                )));
            }
            data[r0..r1].copy_from_slice(&incoming);
        }
        Ok(())
    }

    fn all_gather(&self, data: &[f64]) -> Result<Vec<f64>> {
        let parts = self.exchange_all("all_gather", data)?;
        if let Some((r, p)) = parts.iter().enumerate().find(|(_, p)| p.len() != data.len()) {
            return Err(Error::msg(format!(
                "all_gather: rank {r} contributed {} elements, expected {}",
                p.len(),
                data.len()
            )));
        }
        Ok(parts.concat())
    }

    fn reduce_scatter(&self, data: &[f64], op: ReduceKind) -> Result<Vec<f64>> {
        const OP: &str = "reduce_scatter";
        let n = self.world_size();
        if data.len() % n != 0 {
            return Err(Error::msg(format!(
                "{OP}: {} elements cannot be split evenly across {n} ranks",
                data.len()
            )));
        }
        let chunk = data.len() / n;
        for peer in (0..n).filter(|&p| p != self.rank) {
            self.send(peer, OP, data[peer * chunk..(peer + 1) * chunk].to_vec())?;
        }
        let own = &data[self.rank * chunk..(self.rank + 1) * chunk];
        let mut acc: Option<Vec<f64>> = None;
        for peer in 0..n {
            let piece = if peer == self.rank {
                own.to_vec()
            } else {
                self.recv(peer, OP)?
            };
            if piece.len() != chunk {
                return Err(Error::msg(format!(
                    "{OP}: rank {peer} sent {} elements, expected {chunk}",
                    piece.len()
                )));
            }
            acc = Some(match acc {
                None => piece,
                Some(mut a) => {
                    for (x, v) in a.iter_mut().zip(piece) {
                        *x = op.combine(*x, v);
                    }
                    a
                }
            });
        }
        Ok(acc.unwrap_or_default())
    }

    fn broadcast(&self, data: &mut Vec<f64>, root: usize) -> Result<()> {
        const OP: &str = "broadcast";
        let n = self.world_size();
        if root >= n {
            return Err(Error::msg(format!("{OP}: root {root} out of range for {n} ranks")));
        }
        if self.rank == root {
            for peer in (0..n).filter(|&p| p != root) {
                self.send(peer, OP, data.clone())?;
            }
        } else {
            *data = self.recv(root, OP)?;
        }
        Ok(())
    }

    fn all_to_all(&self, chunks: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>> {
        const OP: &str = "all_to_all";
        let n = self.world_size();
        if chunks.len() != n {
            return Err(Error::msg(format!(
                "{OP}: got {} chunks for {n} ranks",
                chunks.len()
            )));
        }
        let mut own = Vec::new();
        for (peer, chunk) in chunks.into_iter().enumerate() {
            if peer == self.rank {
                own = chunk;
            } else {
                self.send(peer, OP, chunk)?;
            }
        }
        let mut out = Vec::with_capacity(n);
        for peer in 0..n {
            if peer == self.rank {
                out.push(std::mem::take(&mut own));
            } else {
                out.push(self.recv(peer, OP)?);
            }
        }
        Ok(out)
    }

    fn barrier(&self) -> Result<()> {
        self.exchange_all("barrier", &[]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn run_world<T, F>(n: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(LocalCommunicator) -> T + Sync,
    {
        let comms = LocalCommunicator::create_world(n, TIMEOUT).unwrap();
        thread::scope(|s| {
            let handles: Vec<_> = comms.into_iter().map(|c| s.spawn(|| f(c))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_ring_all_reduce_uneven_chunks() {
        let results = run_world(3, |c| {
            let r = c.rank() as f64;
            let mut data: Vec<f64> = (0..5).map(|i| r * 10.0 + i as f64).collect();
            c.all_reduce(&mut data, ReduceKind::Sum).unwrap();
            data
        });
        for data in &results {
            assert_eq!(data, &vec![30.0, 33.0, 36.0, 39.0, 42.0]);
        }
    }

    #[test]
    fn test_all_reduce_max_and_single_rank() {
        let results = run_world(4, |c| {
            let mut data = vec![c.rank() as f64, -(c.rank() as f64)];
            c.all_reduce(&mut data, ReduceKind::Max).unwrap();
            data
        });
        assert!(results.iter().all(|d| d == &vec![3.0, 0.0]));

        let solo = LocalCommunicator::create_world(1, TIMEOUT).unwrap();
        let mut data = vec![1.5];
        solo[0].all_reduce(&mut data, ReduceKind::Sum).unwrap();
        assert_eq!(data, vec![1.5]);
    }

    #[test]
    fn test_gather_scatter_broadcast_all_to_all() {
        let results = run_world(2, |c| {
            let r = c.rank() as f64;
            let gathered = c.all_gather(&[r, r + 0.5]).unwrap();
            let scattered = c.reduce_scatter(&[1.0 + r, 2.0 + r, 3.0 + r, 4.0 + r], ReduceKind::Sum).unwrap();
            let mut b = if c.rank() == 1 { vec![7.0, 8.0] } else { vec![] };
            c.broadcast(&mut b, 1).unwrap();
            let swapped = c.all_to_all(vec![vec![r * 10.0], vec![r * 10.0 + 1.0]]).unwrap();
            c.barrier().unwrap();
            (gathered, scattered, b, swapped)
        });
        for (rank, (gathered, scattered, b, swapped)) in results.into_iter().enumerate() {
            assert_eq!(gathered, vec![0.0, 0.5, 1.0, 1.5]);
            let expected = if rank == 0 { vec![3.0, 5.0] } else { vec![7.0, 9.0] };
            assert_eq!(scattered, expected);
            assert_eq!(b, vec![7.0, 8.0]);
            assert_eq!(swapped, vec![vec![rank as f64], vec![10.0 + rank as f64]]);
        }
    }

    #[test]
    fn test_missing_peer_times_out() {
        let comms = LocalCommunicator::create_world(2, Duration::from_millis(50)).unwrap();
        let mut data = vec![1.0, 2.0];
        let err = comms[0].all_reduce(&mut data, ReduceKind::Sum).unwrap_err();
        match err {
            Error::CollectiveTimeout { op, rank, timeout_ms } => {
                assert_eq!(op, "all_reduce");
                assert_eq!(rank, 0);
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_sub_groups_renumber_ranks() {
        let results = run_world(4, |c| {
            let members: Vec<usize> = if c.rank() % 2 == 0 { vec![0, 2] } else { vec![1, 3] };
            let sub = c.sub_group("even_odd", &members).unwrap();
            let mut data = vec![c.rank() as f64];
            sub.all_reduce(&mut data, ReduceKind::Sum).unwrap();
            (sub.rank(), sub.world_size(), data[0])
        });
        assert_eq!(results, vec![(0, 2, 2.0), (0, 2, 4.0), (1, 2, 2.0), (1, 2, 4.0)]);

        let comms = LocalCommunicator::create_world(2, TIMEOUT).unwrap();
        assert!(comms[0].sub_group("g", &[1]).is_err());
        assert!(comms[0].sub_group("g", &[0, 5]).is_err());
        assert_eq!(comms[0].group().name, "marten_world_group");
    }
}
