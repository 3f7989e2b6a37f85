//! Cross-worker collectives and gradient reduction.
//!
//! `LocalGroup` runs data-parallel workers as threads of one process and
//! routes every collective through rank 0 over bounded channels.
use super::config::ReduceOp;
use crate::model::{Parameterized, Tensor};
use crate::stats::Statistics;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Barrier};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CollectiveError {
    #[error("rank {rank} timed out after {timeout:?} waiting for peers")]
    Timeout { rank: usize, timeout: Duration },
    #[error("channel to rank {0} disconnected")]
    Disconnected(usize),
    #[error("protocol mismatch: {0}")]
    Protocol(String),
    #[error("payload encoding failed: {0}")]
    Encoding(String),
}

/// Collective operations over a data-parallel group.
///
/// Every worker must reach the same sequence of calls; a worker blocks until
/// all peers arrive. Errors are not recoverable locally.
pub trait Collectives: Send + Sync {
    fn world_size(&self) -> usize;

    fn rank(&self) -> usize;

    fn is_master(&self) -> bool {
        self.rank() == 0
    }

    /// Gather one opaque payload from every worker, in rank order.
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, CollectiveError>;

    /// Combine `tensors` elementwise across workers, in place.
    fn all_reduce(&self, tensors: &mut [&mut Tensor], op: ReduceOp) -> Result<(), CollectiveError>;

    fn barrier(&self);
}

/// Gather `value` from every worker.
pub fn all_gather_list<T: Serialize + DeserializeOwned>(
    collectives: &dyn Collectives,
    value: &T,
) -> crate::Result<Vec<T>> {
    let payload =
        bincode::serialize(value).map_err(|e| CollectiveError::Encoding(e.to_string()))?;
    let gathered = collectives.all_gather_bytes(payload)?;
    gathered
        .iter()
        .map(|bytes| {
            bincode::deserialize(bytes)
                .map_err(|e| CollectiveError::Encoding(e.to_string()).into())
        })
        .collect()
}

enum Message {
    Gather(Vec<u8>),
    Gathered(Vec<Vec<u8>>),
    Reduce(Vec<Tensor>),
    Reduced(Vec<Tensor>),
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::Gather(_) => "gather",
            Message::Gathered(_) => "gathered",
            Message::Reduce(_) => "reduce",
            Message::Reduced(_) => "reduced",
        }
    }
}

/// A synchronization group for thread-local data-parallel training
pub struct LocalGroup {
    barrier: Barrier,
    // Worker -> rank 0
    up_senders: Vec<Sender<Message>>,
    up_receivers: Vec<Receiver<Message>>,
    // Rank 0 -> worker
    down_senders: Vec<Sender<Message>>,
    down_receivers: Vec<Receiver<Message>>,
}

impl LocalGroup {
    pub fn new(world_size: usize) -> Arc<Self> {
        let mut up_senders = Vec::with_capacity(world_size);
        let mut up_receivers = Vec::with_capacity(world_size);
        let mut down_senders = Vec::with_capacity(world_size);
        let mut down_receivers = Vec::with_capacity(world_size);

        for _ in 0..world_size {
            let (us, ur) = bounded(1);
            let (ds, dr) = bounded(1);
            up_senders.push(us);
            up_receivers.push(ur);
            down_senders.push(ds);
            down_receivers.push(dr);
        }

        Arc::new(Self {
            barrier: Barrier::new(world_size),
            up_senders,
            up_receivers,
            down_senders,
            down_receivers,
        })
    }

    /// One handle per rank, in rank order.
    pub fn handles(world_size: usize, timeout: Duration) -> Vec<ThreadCollectives> {
        let group = Self::new(world_size);
        (0..world_size)
            .map(|rank| ThreadCollectives {
                world_size,
                rank,
                timeout,
                group: Arc::clone(&group),
            })
            .collect()
    }
}

/// Per-rank handle onto a [`LocalGroup`].
#[derive(Clone)]
pub struct ThreadCollectives {
    world_size: usize,
    rank: usize,
    timeout: Duration,
    group: Arc<LocalGroup>,
}

impl ThreadCollectives {
    fn send(&self, tx: &Sender<Message>, peer: usize, msg: Message) -> Result<(), CollectiveError> {
        tx.send_timeout(msg, self.timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(_) => CollectiveError::Timeout {
                rank: self.rank,
                timeout: self.timeout,
            },
            SendTimeoutError::Disconnected(_) => CollectiveError::Disconnected(peer),
        })
    }

    fn recv(&self, rx: &Receiver<Message>, peer: usize) -> Result<Message, CollectiveError> {
        rx.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => CollectiveError::Timeout {
                rank: self.rank,
                timeout: self.timeout,
            },
            RecvTimeoutError::Disconnected => CollectiveError::Disconnected(peer),
        })
    }

    fn check_shapes(
        &self,
        ours: &[Tensor],
        theirs: &[Tensor],
        peer: usize,
    ) -> Result<(), CollectiveError> {
        if ours.len() != theirs.len() {
            return Err(CollectiveError::Protocol(format!(
                "rank {} sent {} tensors, rank {} has {}",
                peer,
                theirs.len(),
                self.rank,
                ours.len()
            )));
        }
        for (i, (a, b)) in ours.iter().zip(theirs).enumerate() {
            if a.shape() != b.shape() {
                return Err(CollectiveError::Protocol(format!(
                    "tensor {} from rank {} has shape {:?}, expected {:?}",
                    i,
                    peer,
                    b.shape(),
                    a.shape()
                )));
            }
        }
        Ok(())
    }
}

fn unexpected(expected: &str, got: &Message, peer: usize) -> CollectiveError {
    CollectiveError::Protocol(format!(
        "expected {} from rank {}, got {}",
        expected,
        peer,
        got.kind()
    ))
}

impl Collectives for ThreadCollectives {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, CollectiveError> {
        if self.world_size <= 1 {
            return Ok(vec![payload]);
        }

        let group = &self.group;
        if self.rank == 0 {
            let mut all = Vec::with_capacity(self.world_size);
            all.push(payload);
            for i in 1..self.world_size {
                match self.recv(&group.up_receivers[i], i)? {
                    Message::Gather(bytes) => all.push(bytes),
                    other => return Err(unexpected("gather", &other, i)),
                }
            }
            for i in 1..self.world_size {
                self.send(&group.down_senders[i], i, Message::Gathered(all.clone()))?;
            }
            Ok(all)
        } else {
            self.send(&group.up_senders[self.rank], 0, Message::Gather(payload))?;
            match self.recv(&group.down_receivers[self.rank], 0)? {
                Message::Gathered(all) => Ok(all),
                other => Err(unexpected("gathered", &other, 0)),
            }
        }
    }

    fn all_reduce(&self, tensors: &mut [&mut Tensor], op: ReduceOp) -> Result<(), CollectiveError> {
        if self.world_size <= 1 {
            return Ok(());
        }

        let group = &self.group;
        let local: Vec<Tensor> = tensors.iter().map(|t| (**t).clone()).collect();

        let reduced = if self.rank == 0 {
            let mut sum = local;
            for i in 1..self.world_size {
                let theirs = match self.recv(&group.up_receivers[i], i)? {
                    Message::Reduce(theirs) => theirs,
                    other => return Err(unexpected("reduce", &other, i)),
                };
                self.check_shapes(&sum, &theirs, i)?;
                for (acc, t) in sum.iter_mut().zip(&theirs) {
                    *acc += t;
                }
            }
            if op == ReduceOp::Average {
                let scale = 1.0 / self.world_size as f32;
                for acc in sum.iter_mut() {
                    acc.mapv_inplace(|v| v * scale);
                }
            }
            for i in 1..self.world_size {
                self.send(&group.down_senders[i], i, Message::Reduced(sum.clone()))?;
            }
            sum
        } else {
            self.send(&group.up_senders[self.rank], 0, Message::Reduce(local.clone()))?;
            let reduced = match self.recv(&group.down_receivers[self.rank], 0)? {
                Message::Reduced(reduced) => reduced,
                other => return Err(unexpected("reduced", &other, 0)),
            };
            self.check_shapes(&local, &reduced, 0)?;
            reduced
        };

        for (dst, src) in tensors.iter_mut().zip(reduced) {
            **dst = src;
        }
        Ok(())
    }

    fn barrier(&self) {
        self.group.barrier.wait();
    }
}

/// Normalization and gradient synchronization strategy.
///
/// Chosen once when the trainer is built: [`NoReduce`] for a single worker,
/// [`CollectiveReducer`] otherwise.
pub trait GradientReducer: Send {
    fn world_size(&self) -> usize;

    /// Whether every worker still has an accumulation group to run.
    fn sync_continue(&self, has_group: bool) -> crate::Result<bool>;

    /// Global normalization from the local one.
    fn sync_normalization(&self, local: usize) -> crate::Result<usize>;

    /// Reduce the gradients of every parameter that has one.
    fn reduce_gradients(&self, model: &mut dyn Parameterized) -> crate::Result<()>;

    /// Sum statistics across workers.
    fn gather_stats(&self, stats: Statistics) -> crate::Result<Statistics>;
}

/// Single-worker pass-through.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReduce;

impl GradientReducer for NoReduce {
    fn world_size(&self) -> usize {
        1
    }

    fn sync_continue(&self, has_group: bool) -> crate::Result<bool> {
        Ok(has_group)
    }

    fn sync_normalization(&self, local: usize) -> crate::Result<usize> {
        Ok(local)
    }

    fn reduce_gradients(&self, _model: &mut dyn Parameterized) -> crate::Result<()> {
        Ok(())
    }

    fn gather_stats(&self, stats: Statistics) -> crate::Result<Statistics> {
        Ok(stats)
    }
}

/// Multi-worker reducer backed by a [`Collectives`] implementation.
pub struct CollectiveReducer {
    collectives: Arc<dyn Collectives>,
    op: ReduceOp,
}

impl CollectiveReducer {
    pub fn new(collectives: Arc<dyn Collectives>, op: ReduceOp) -> Self {
        Self { collectives, op }
    }

    pub fn collectives(&self) -> &Arc<dyn Collectives> {
        &self.collectives
    }
}

impl GradientReducer for CollectiveReducer {
    fn world_size(&self) -> usize {
        self.collectives.world_size()
    }

    fn sync_continue(&self, has_group: bool) -> crate::Result<bool> {
        let all: Vec<bool> = all_gather_list(self.collectives.as_ref(), &has_group)?;
        Ok(all.into_iter().all(|more| more))
    }

    fn sync_normalization(&self, local: usize) -> crate::Result<usize> {
        let all: Vec<usize> = all_gather_list(self.collectives.as_ref(), &local)?;
        Ok(all.into_iter().sum())
    }

    fn reduce_gradients(&self, model: &mut dyn Parameterized) -> crate::Result<()> {
        let mut params = model.parameters_mut();
        let mut grads: Vec<&mut Tensor> = params
            .iter_mut()
            .filter(|p| p.requires_grad)
            .filter_map(|p| p.grad.as_mut())
            .collect();
        self.collectives.all_reduce(&mut grads, self.op)?;
        Ok(())
    }

    fn gather_stats(&self, stats: Statistics) -> crate::Result<Statistics> {
        stats.all_gather(self.collectives.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Parameter;
    use ndarray::IxDyn;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn run_group<T, F>(world_size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(ThreadCollectives) -> T + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = LocalGroup::handles(world_size, TIMEOUT)
            .into_iter()
            .map(|c| {
                let f = f.clone();
                thread::spawn(move || f(c))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_all_gather_list_in_rank_order() {
        let results = run_group(3, |c| {
            let value = (c.rank() as u64 + 1) * 10;
            all_gather_list(&c, &value).unwrap()
        });
        for gathered in results {
            assert_eq!(gathered, vec![10, 20, 30]);
        }
    }

    #[test]
    fn test_all_reduce_average_and_sum() {
        let results = run_group(2, |c| {
            let mut a = Tensor::from_elem(IxDyn(&[2]), c.rank() as f32 + 1.0);
            let mut b = Tensor::from_elem(IxDyn(&[1]), 4.0);
            c.all_reduce(&mut [&mut a, &mut b], ReduceOp::Average).unwrap();
            let mut s = Tensor::from_elem(IxDyn(&[1]), 1.0);
            c.all_reduce(&mut [&mut s], ReduceOp::Sum).unwrap();
            (a, b, s)
        });
        for (a, b, s) in results {
            assert_eq!(a, Tensor::from_elem(IxDyn(&[2]), 1.5));
            assert_eq!(b, Tensor::from_elem(IxDyn(&[1]), 4.0));
            assert_eq!(s, Tensor::from_elem(IxDyn(&[1]), 2.0));
        }
    }

    #[test]
    fn test_reducer_syncs_normalization_and_grads() {
        let results = run_group(2, |c| {
            let reducer = CollectiveReducer::new(Arc::new(c.clone()), ReduceOp::Average);
            let norm = reducer.sync_normalization(3 + c.rank() * 4).unwrap();

            let mut params = vec![
                Parameter::new("w", Tensor::zeros(IxDyn(&[2]))),
                Parameter::new("frozen", Tensor::zeros(IxDyn(&[1]))).frozen(),
            ];
            params[0].grad = Some(Tensor::from_elem(IxDyn(&[2]), 2.0 * c.rank() as f32));
            params[1].grad = Some(Tensor::from_elem(IxDyn(&[1]), 7.0 + c.rank() as f32));
            let mut model = TestParams(params);
            reducer.reduce_gradients(&mut model).unwrap();
            (norm, model.0)
        });
        for (norm, params) in results {
            assert_eq!(norm, 10);
            assert_eq!(params[0].grad.clone().unwrap(), Tensor::from_elem(IxDyn(&[2]), 1.0));
            // frozen parameters are left alone
            assert!(params[1].grad.as_ref().unwrap()[[0]] >= 7.0);
        }
    }

    #[test]
    fn test_sync_continue_stops_when_any_worker_is_done() {
        let results = run_group(3, |c| {
            let reducer = CollectiveReducer::new(Arc::new(c.clone()), ReduceOp::Sum);
            let all_have = reducer.sync_continue(true).unwrap();
            let one_done = reducer.sync_continue(c.rank() != 2).unwrap();
            (all_have, one_done)
        });
        assert_eq!(results, vec![(true, false); 3]);
        assert!(NoReduce.sync_continue(true).unwrap());
        assert!(!NoReduce.sync_continue(false).unwrap());
    }

    #[test]
    fn test_gather_stats_sums_workers() {
        let results = run_group(3, |c| {
            let reducer = CollectiveReducer::new(Arc::new(c.clone()), ReduceOp::Average);
            let stats = Statistics::with_counts(1.0, c.rank() as u64, 1);
            reducer.gather_stats(stats).unwrap()
        });
        for stats in results {
            assert_eq!(stats.n_words, 3);
            assert_eq!(stats.n_correct, 3);
            assert_eq!(stats.loss, 3.0);
        }
    }

    #[test]
    fn test_missing_peer_times_out() {
        let mut handles = LocalGroup::handles(2, Duration::from_millis(50));
        let worker = handles.pop().unwrap();
        let err = worker.all_gather_bytes(vec![1]).unwrap_err();
        // rank 1 fills its channel, then waits on rank 0 which never answers
        assert!(matches!(err, CollectiveError::Timeout { rank: 1, .. }));
    }

    #[test]
    fn test_single_worker_is_passthrough() {
        let c = LocalGroup::handles(1, TIMEOUT).pop().unwrap();
        assert_eq!(c.all_gather_bytes(vec![9]).unwrap(), vec![vec![9]]);
        let mut t = Tensor::from_elem(IxDyn(&[1]), 3.0);
        c.all_reduce(&mut [&mut t], ReduceOp::Average).unwrap();
        assert_eq!(t[[0]], 3.0);
        assert_eq!(NoReduce.sync_normalization(5).unwrap(), 5);
    }

    struct TestParams(Vec<Parameter>);

    impl Parameterized for TestParams {
        fn parameters(&self) -> Vec<&Parameter> {
            self.0.iter().collect()
        }
        fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
            self.0.iter_mut().collect()
        }
    }
}
