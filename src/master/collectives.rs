//! Per-block all-reduce requests resolved during `exchange`.
//!
//! During a `foreach`, each block may post scalar contributions through
//! [`Proxy::all_reduce`](crate::master::proxy::Proxy::all_reduce). Requests
//! are matched by position: the i-th request of every block (on every rank)
//! forms one reduction. Results become visible through
//! [`Proxy::collective`](crate::master::proxy::Proxy::collective) in the
//! callbacks that follow the exchange.

use crate::algs::communicator::Communicator;
use crate::block_error::BlockError;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CollectiveValue {
    I64(i64),
    U64(u64),
    F64(f64),
}

impl From<i64> for CollectiveValue {
    fn from(v: i64) -> Self {
        CollectiveValue::I64(v)
    }
}
impl From<u64> for CollectiveValue {
    fn from(v: u64) -> Self {
        CollectiveValue::U64(v)
    }
}
impl From<f64> for CollectiveValue {
    fn from(v: f64) -> Self {
        CollectiveValue::F64(v)
    }
}

impl CollectiveValue {
    pub fn as_i64(self) -> Option<i64> {
        match self {
            CollectiveValue::I64(v) => Some(v),
            _ => None,
        }
    }
    pub fn as_u64(self) -> Option<u64> {
        match self {
            CollectiveValue::U64(v) => Some(v),
            _ => None,
        }
    }
    pub fn as_f64(self) -> Option<f64> {
        match self {
            CollectiveValue::F64(v) => Some(v),
            _ => None,
        }
    }

    fn combine(self, other: Self, op: ReduceOp) -> Result<Self, BlockError> {
        use CollectiveValue::*;
        Ok(match (self, other) {
            (I64(a), I64(b)) => I64(match op {
                ReduceOp::Sum => a.wrapping_add(b),
                ReduceOp::Min => a.min(b),
                ReduceOp::Max => a.max(b),
            }),
            (U64(a), U64(b)) => U64(match op {
                ReduceOp::Sum => a.wrapping_add(b),
                ReduceOp::Min => a.min(b),
                ReduceOp::Max => a.max(b),
            }),
            (F64(a), F64(b)) => F64(match op {
                ReduceOp::Sum => a + b,
                ReduceOp::Min => a.min(b),
                ReduceOp::Max => a.max(b),
            }),
            (a, b) => {
                return Err(BlockError::Configuration(format!(
                    "collective mixes value types: {a:?} and {b:?}"
                )));
            }
        })
    }
}

/// Pending requests and last results of one block.
#[derive(Debug, Default)]
pub struct BlockCollectives {
    pending: Vec<(ReduceOp, CollectiveValue)>,
    results: Vec<CollectiveValue>,
}

impl BlockCollectives {
    pub fn post(&mut self, op: ReduceOp, value: CollectiveValue) {
        self.pending.push((op, value));
    }

    pub fn result(&self, i: usize) -> Option<CollectiveValue> {
        self.results.get(i).copied()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn clear_results(&mut self) {
        self.results.clear();
    }
}

type Partial = Option<(ReduceOp, CollectiveValue)>;

fn fold(acc: &mut Partial, op: ReduceOp, value: CollectiveValue) -> Result<(), BlockError> {
    *acc = Some(match acc.take() {
        None => (op, value),
        Some((prev_op, prev)) => {
            if prev_op != op {
                return Err(BlockError::Configuration(format!(
                    "collective mixes operations {prev_op:?} and {op:?}"
                )));
            }
            (op, prev.combine(value, op)?)
        }
    });
    Ok(())
}

/// Reduce `count` positional collectives over all blocks and ranks, then hand
/// every block the results. Collective over `comm`: every rank must call it
/// with the same `count`.
pub(crate) fn resolve<'a, C, I>(comm: &C, count: usize, blocks: I) -> Result<(), BlockError>
where
    C: Communicator,
    I: IntoIterator<Item = &'a mut BlockCollectives>,
{
    let mut blocks: Vec<&mut BlockCollectives> = blocks.into_iter().collect();
    let mut local: Vec<Partial> = vec![None; count];
    for b in blocks.iter() {
        for (i, &(op, v)) in b.pending.iter().enumerate() {
            fold(&mut local[i], op, v)?;
        }
    }
    let gathered = comm.allgather(&bincode::serialize(&local)?)?;
    let mut global: Vec<Partial> = vec![None; count];
    for (peer, buf) in gathered.iter().enumerate() {
        let theirs: Vec<Partial> = bincode::deserialize(buf)
            .map_err(|e| BlockError::comm(peer, format!("collective payload: {e}")))?;
        for (i, p) in theirs.into_iter().enumerate().take(count) {
            if let Some((op, v)) = p {
                fold(&mut global[i], op, v)?;
            }
        }
    }
    let results: Vec<CollectiveValue> = global
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            p.map(|(_, v)| v).ok_or_else(|| {
                BlockError::Configuration(format!("collective {i} has no contribution"))
            })
        })
        .collect::<Result<_, _>>()?;
    for b in blocks.iter_mut() {
        b.pending.clear();
        b.results = results.clone();
    }
    log::debug!("resolved {count} collectives");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    #[test]
    fn positional_sum_and_max() {
        let mut a = BlockCollectives::default();
        let mut b = BlockCollectives::default();
        a.post(ReduceOp::Sum, 2u64.into());
        a.post(ReduceOp::Max, 1.5f64.into());
        b.post(ReduceOp::Sum, 5u64.into());
        b.post(ReduceOp::Max, (-3.0f64).into());
        resolve(&NoComm, 2, [&mut a, &mut b]).unwrap();
        assert_eq!(a.result(0), Some(CollectiveValue::U64(7)));
        assert_eq!(b.result(1).and_then(CollectiveValue::as_f64), Some(1.5));
        assert_eq!(a.pending_len(), 0);
    }

    #[test]
    fn mixed_types_are_rejected() {
        let mut a = BlockCollectives::default();
        let mut b = BlockCollectives::default();
        a.post(ReduceOp::Sum, 1i64.into());
        b.post(ReduceOp::Sum, 1u64.into());
        assert!(resolve(&NoComm, 1, [&mut a, &mut b]).is_err());
    }
}
