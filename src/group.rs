//! Process groups: who we are, how many of us there are, and the few collectives the planner
//! and the map reduction need.
//!
//! The collectives block. A failure in any of them is reported as [`DecompError::Collective`]
//! and is not recoverable; there are no retries or timeouts.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier};

use log::info;
use ndarray::{ArrayD, ArrayViewD, Zip};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DecompError, Result};

/// The rank that computes shared tables and receives reductions.
pub const ROOT: usize = 0;

pub trait ProcessGroup {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Send `bytes` from `root` to every rank. Only `root` supplies a value.
    fn broadcast_bytes(&self, bytes: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>>;

    fn barrier(&self) -> Result<()>;

    /// Elementwise sum of every rank's `local` array, delivered to `root` only.
    fn reduce_sum(&self, local: ArrayViewD<'_, f64>, root: usize) -> Result<Option<ArrayD<f64>>>;
}

/// Broadcast a serializable value from `root`, encoded as MessagePack on the wire.
pub fn broadcast<T, G>(group: &G, value: Option<&T>, root: usize) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    G: ProcessGroup + ?Sized,
{
    let bytes = if group.rank() == root {
        let value = value.ok_or_else(|| {
            DecompError::Collective(format!("root {} has nothing to broadcast", root))
        })?;
        Some(rmp_serde::to_vec(value)?)
    } else {
        None
    };
    let bytes = group.broadcast_bytes(bytes, root)?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

fn check_root(root: usize, size: usize) -> Result<()> {
    if root >= size {
        return Err(DecompError::Collective(format!(
            "root {} is outside a group of {}",
            root, size
        )));
    }
    Ok(())
}

/// A group with exactly one member; every collective is local.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast_bytes(&self, bytes: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>> {
        check_root(root, 1)?;
        bytes.ok_or_else(|| DecompError::Collective("root has nothing to broadcast".into()))
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn reduce_sum(&self, local: ArrayViewD<'_, f64>, root: usize) -> Result<Option<ArrayD<f64>>> {
        check_root(root, 1)?;
        Ok(Some(local.to_owned()))
    }
}

enum Message {
    Bytes(Vec<u8>),
    Array(ArrayD<f64>),
}

struct Envelope {
    from: usize,
    message: Message,
}

/// One member of a group of ranks living in the same process, typically one per thread.
///
/// Members talk over point-to-point channels. Messages from the same sender arrive in the order
/// they were sent; messages that arrive ahead of the one we are waiting for are parked per sender.
pub struct ChannelGroup {
    rank: usize,
    size: usize,
    outboxes: Vec<Option<Sender<Envelope>>>,
    inbox: Receiver<Envelope>,
    parked: RefCell<Vec<VecDeque<Message>>>,
    barrier: Arc<Barrier>,
}

impl ChannelGroup {
    /// Create all `size` members of a new group. Member `i` has rank `i`.
    pub fn create(size: usize) -> Vec<ChannelGroup> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| channel()).unzip();
        let barrier = Arc::new(Barrier::new(size));

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelGroup {
                rank,
                size,
                // No sender to ourselves, so the inbox disconnects once every peer is gone.
                outboxes: senders
                    .iter()
                    .enumerate()
                    .map(|(i, s)| (i != rank).then(|| s.clone()))
                    .collect(),
                inbox,
                parked: RefCell::new((0..size).map(|_| VecDeque::new()).collect()),
                barrier: barrier.clone(),
            })
            .collect()
    }

    fn send(&self, to: usize, message: Message) -> Result<()> {
        let outbox = self.outboxes[to].as_ref().ok_or_else(|| {
            DecompError::Collective(format!("rank {} cannot message itself", to))
        })?;
        outbox
            .send(Envelope {
                from: self.rank,
                message,
            })
            .map_err(|_| DecompError::Collective(format!("rank {} has left the group", to)))
    }

    fn recv_from(&self, from: usize) -> Result<Message> {
        if let Some(message) = self.parked.borrow_mut()[from].pop_front() {
            return Ok(message);
        }
        loop {
            let envelope = self.inbox.recv().map_err(|_| {
                DecompError::Collective(format!(
                    "rank {} lost its peers while waiting for rank {}",
                    self.rank, from
                ))
            })?;
            if envelope.from == from {
                return Ok(envelope.message);
            }
            self.parked.borrow_mut()[envelope.from].push_back(envelope.message);
        }
    }
}

impl ProcessGroup for ChannelGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_bytes(&self, bytes: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>> {
        check_root(root, self.size)?;

        if self.rank == root {
            let bytes = bytes
                .ok_or_else(|| DecompError::Collective("root has nothing to broadcast".into()))?;
            for to in (0..self.size).filter(|&r| r != root) {
                self.send(to, Message::Bytes(bytes.clone()))?;
            }
            return Ok(bytes);
        }

        match self.recv_from(root)? {
            Message::Bytes(bytes) => Ok(bytes),
            Message::Array(_) => Err(DecompError::Collective(format!(
                "rank {} expected a broadcast from {} but got an array",
                self.rank, root
            ))),
        }
    }

    fn barrier(&self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }

    fn reduce_sum(&self, local: ArrayViewD<'_, f64>, root: usize) -> Result<Option<ArrayD<f64>>> {
        check_root(root, self.size)?;

        if self.rank != root {
            self.send(root, Message::Array(local.to_owned()))?;
            return Ok(None);
        }

        // Always accumulate in rank order so the floating point result is reproducible.
        let mut total = local.to_owned();
        for from in (0..self.size).filter(|&r| r != root) {
            let part = match self.recv_from(from)? {
                Message::Array(part) => part,
                Message::Bytes(_) => {
                    return Err(DecompError::Collective(format!(
                        "root expected an array from rank {} but got bytes",
                        from
                    )))
                }
            };
            if part.shape() != total.shape() {
                return Err(DecompError::Collective(format!(
                    "rank {} sent shape {:?}, expected {:?}",
                    from,
                    part.shape(),
                    total.shape()
                )));
            }
            Zip::from(&mut total)
                .and(&part)
                .par_for_each(|t, &p| *t += p);
        }
        Ok(Some(total))
    }
}

/// `MPI_COMM_WORLD`. Finalizes MPI when dropped.
#[cfg(feature = "mpi")]
pub struct MpiGroup {
    _universe: mpi::environment::Universe,
    world: mpi::topology::SimpleCommunicator,
}

#[cfg(feature = "mpi")]
impl MpiGroup {
    pub fn init() -> Result<Self> {
        let universe = mpi::initialize()
            .ok_or_else(|| DecompError::Collective("MPI has already been initialized".into()))?;
        let world = universe.world();
        Ok(Self {
            _universe: universe,
            world,
        })
    }
}

#[cfg(feature = "mpi")]
impl ProcessGroup for MpiGroup {
    fn rank(&self) -> usize {
        use mpi::traits::Communicator;
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        use mpi::traits::Communicator;
        self.world.size() as usize
    }

    fn broadcast_bytes(&self, bytes: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>> {
        use mpi::traits::{Communicator, Root};
        check_root(root, self.size())?;

        let root_process = self.world.process_at_rank(root as i32);
        let mut buf = if self.rank() == root {
            bytes.ok_or_else(|| DecompError::Collective("root has nothing to broadcast".into()))?
        } else {
            Vec::new()
        };

        let mut len = buf.len() as u64;
        root_process.broadcast_into(&mut len);
        buf.resize(len as usize, 0);
        root_process.broadcast_into(&mut buf[..]);
        Ok(buf)
    }

    fn barrier(&self) -> Result<()> {
        use mpi::traits::Communicator;
        self.world.barrier();
        Ok(())
    }

    fn reduce_sum(&self, local: ArrayViewD<'_, f64>, root: usize) -> Result<Option<ArrayD<f64>>> {
        use mpi::collective::SystemOperation;
        use mpi::traits::{Communicator, Root};
        check_root(root, self.size())?;

        // Logical (row-major) order, whatever the memory layout of `local`.
        let send: Vec<f64> = local.iter().copied().collect();
        let root_process = self.world.process_at_rank(root as i32);

        if self.rank() == root {
            let mut recv = vec![0.0; send.len()];
            root_process.reduce_into_root(&send[..], &mut recv[..], SystemOperation::sum());
            let total = ArrayD::from_shape_vec(local.raw_dim(), recv)
                .map_err(|e| DecompError::Collective(e.to_string()))?;
            Ok(Some(total))
        } else {
            root_process.reduce_into(&send[..], SystemOperation::sum());
            Ok(None)
        }
    }
}

/// Join the job's process group, falling back to [`SingleProcess`] when multi-process support
/// is disabled or was not compiled in.
pub fn connect(force_single: bool) -> Box<dyn ProcessGroup> {
    if force_single {
        info!("multi-process support disabled, running as a serial task");
        return Box::new(SingleProcess);
    }

    #[cfg(feature = "mpi")]
    match MpiGroup::init() {
        Ok(group) => return Box::new(group),
        Err(e) => info!("{}, falling back to a serial task", e),
    }

    #[cfg(not(feature = "mpi"))]
    info!("built without MPI support, falling back to a serial task");

    Box::new(SingleProcess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, ArrayD, IxDyn};

    /// Run `f` once per member of a fresh [`ChannelGroup`] and collect the results by rank.
    fn run_ranks<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(ChannelGroup) -> T + Sync,
    {
        let f = &f;
        std::thread::scope(|s| {
            let handles: Vec<_> = ChannelGroup::create(size)
                .into_iter()
                .map(|g| s.spawn(move || f(g)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_single_process() {
        let g = SingleProcess;
        assert_eq!(g.rank(), 0);
        assert_eq!(g.size(), 1);
        assert_eq!(broadcast(&g, Some(&vec![1u32, 2, 3]), 0).unwrap(), vec![1, 2, 3]);
        assert!(broadcast::<u32, _>(&g, None, 0).is_err());
        assert!(g.broadcast_bytes(Some(vec![1]), 1).is_err());

        let local = arr1(&[1.0, 2.0]).into_dyn();
        let out = g.reduce_sum(local.view(), 0).unwrap().unwrap();
        assert_eq!(out, local);
    }

    #[test]
    fn test_channel_broadcast() {
        let got = run_ranks(4, |g| {
            let value = (g.rank() == 2).then(|| vec![34usize, 33, 33]);
            broadcast(&g, value.as_ref(), 2).unwrap()
        });
        for v in got {
            assert_eq!(v, vec![34, 33, 33]);
        }
    }

    #[test]
    fn test_channel_reduce() {
        let got = run_ranks(3, |g| {
            let local = ArrayD::from_elem(IxDyn(&[2, 3]), (g.rank() + 1) as f64);
            g.reduce_sum(local.view(), 0).unwrap()
        });
        assert_eq!(got[0], Some(ArrayD::from_elem(IxDyn(&[2, 3]), 6.0)));
        assert_eq!(got[1], None);
        assert_eq!(got[2], None);
    }

    #[test]
    fn test_channel_interleaved_collectives() {
        // Non-root ranks race ahead into the second reduce before root drains the first.
        let got = run_ranks(3, |g| {
            let one = ArrayD::from_elem(IxDyn(&[4]), 1.0);
            let two = ArrayD::from_elem(IxDyn(&[4]), 2.0);
            let a = g.reduce_sum(one.view(), 0).unwrap();
            let b = g.reduce_sum(two.view(), 0).unwrap();
            let c: String = broadcast(&g, Some(&"done".to_string()), 0).unwrap();
            g.barrier().unwrap();
            (a, b, c)
        });
        assert_eq!(got[0].0, Some(ArrayD::from_elem(IxDyn(&[4]), 3.0)));
        assert_eq!(got[0].1, Some(ArrayD::from_elem(IxDyn(&[4]), 6.0)));
        for (_, _, c) in got {
            assert_eq!(c, "done");
        }
    }

    #[test]
    fn test_channel_reduce_shape_mismatch() {
        let got = run_ranks(2, |g| {
            let local = ArrayD::zeros(IxDyn(&[g.rank() + 1]));
            g.reduce_sum(local.view(), 0)
        });
        assert!(matches!(got[0], Err(DecompError::Collective(_))));
        assert!(matches!(got[1], Ok(None)));
    }

    #[test]
    fn test_connect_forced_single() {
        let g = connect(true);
        assert_eq!(g.rank(), 0);
        assert_eq!(g.size(), 1);
    }
}
