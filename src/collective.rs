//! Collective Operations
//!
//! Barrier, all-reduce, all-gather and reduce-scatter over the process grid, built only from
//! mailbox posts and filtered blocking receives.
//!
//! Every message is tagged with the sender's round. A worker only consumes messages of the kind and
//! round it currently expects, so messages of the next round that arrive early simply stay queued.
//! A worker cannot get more than one round ahead of any peer, since it has to pass a barrier that
//! needs every peer's `Done` first.
//!

use super::error::*;
use super::mailbox::*;
use super::matrix::*;
use super::util::*;
use crate::derivative::Derivative;
use ndarray::{s, Axis};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// which workers take part in a collective together with the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveScope {
    /// every worker in the grid
    All,
    /// the workers in the caller's grid row, ordered by grid column
    Row,
    /// the workers in the caller's grid column, ordered by grid row
    Column,
}

/// one worker's endpoint; owns the round counter of that worker
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Communicator {
    node: NodeIndex,
    grid: ProcessGrid,
    round: Round,
    #[derivative(Debug = "ignore")]
    post_office: Arc<PostOffice>,
    /// bound on each single wait for peers; `None` waits forever
    timeout: Option<Duration>,
}

impl Communicator {
    pub fn new(node: NodeIndex, grid: ProcessGrid, post_office: Arc<PostOffice>, timeout: Option<Duration>) -> Self {
        assert_eq!(post_office.node_num(), grid.node_num(), "one mailbox per worker");
        assert!(node < grid.node_num(), "worker {} outside the grid", node);
        Self {
            node,
            grid,
            round: 0,
            post_office,
            timeout,
        }
    }

    /// endpoints of every worker in `grid`, sharing one set of mailboxes
    pub fn new_group(grid: ProcessGrid, timeout: Option<Duration>, event_log: Option<Arc<EventLog>>) -> Vec<Self> {
        let post_office = Arc::new(PostOffice::new(grid.node_num(), event_log));
        grid.all_nodes()
            .into_iter()
            .map(|node| Self::new(node, grid, Arc::clone(&post_office), timeout))
            .collect()
    }

    pub fn node(&self) -> NodeIndex {
        self.node
    }

    pub fn grid(&self) -> &ProcessGrid {
        &self.grid
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn partners(&self, scope: CollectiveScope) -> Vec<NodeIndex> {
        match scope {
            CollectiveScope::All => self.grid.all_nodes(),
            CollectiveScope::Row => self.grid.row_partners(self.node),
            CollectiveScope::Column => self.grid.column_partners(self.node),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| Instant::now() + timeout)
    }

    /// wait until every worker has reached the barrier of the current round, then advance the round
    pub fn barrier(&mut self) -> Result<(), NmfError> {
        self.barrier_for("barrier", &[])
    }

    /// `partners` are the workers whose data of this round was just collected
    fn barrier_for(&mut self, op: &'static str, partners: &[NodeIndex]) -> Result<(), NmfError> {
        let round = self.round;
        for peer in self.grid.all_nodes() {
            if peer != self.node {
                self.post_office.send(peer, Message::signal(self.node, MessageKind::Done, round));
            }
        }
        let mut arrived = vec![false; self.grid.node_num()];
        arrived[self.node] = true;
        let deadline = self.deadline();
        while arrived.iter().any(|&done| !done) {
            let message = self.receive_tagged(op, MessageKind::Done, deadline, |node| !arrived[node])?;
            if arrived[message.sender] {
                return Err(self.duplicate(op, &message));
            }
            arrived[message.sender] = true;
        }
        self.drain_round(op, partners)?;
        self.post_office.record(Event::BarrierPassed { node: self.node, round });
        self.round += 1;
        Ok(())
    }

    /// elementwise sum of every worker's block, identical on every worker
    pub fn all_reduce(&mut self, block: Matrix) -> Result<Matrix, NmfError> {
        let op = "all_reduce";
        let partners = self.grid.all_nodes();
        let blocks = self.exchange(op, MessageKind::Gather, CollectiveScope::All, block)?;
        let sum = sum_in_order(blocks);
        self.barrier_for(op, &partners)?;
        Ok(sum)
    }

    /// stack the W-like blocks of the grid row on top of each other, in ascending grid column
    pub fn all_gather_row(&mut self, block: Matrix) -> Result<Matrix, NmfError> {
        self.all_gather(CollectiveScope::Row, Axis(0), block)
    }

    /// place the H-like blocks of the grid column side by side, in ascending grid row
    pub fn all_gather_column(&mut self, block: Matrix) -> Result<Matrix, NmfError> {
        self.all_gather(CollectiveScope::Column, Axis(1), block)
    }

    /// concatenate the blocks of all partners along `axis`, in partner order
    pub fn all_gather(&mut self, scope: CollectiveScope, axis: Axis, block: Matrix) -> Result<Matrix, NmfError> {
        let (op, kind) = match scope {
            CollectiveScope::Column => ("all_gather_column", MessageKind::ColGather),
            _ => ("all_gather_row", MessageKind::RowGather),
        };
        let round = self.round;
        let partners = self.partners(scope);
        let blocks = self.exchange(op, kind, scope, block)?;
        let gathered = if axis == Axis(0) {
            concatenate_rows(op, round, &blocks)?
        } else {
            concatenate_columns(op, round, &blocks)?
        };
        self.barrier_for(op, &partners)?;
        Ok(gathered)
    }

    /// sum the (m/p_r) x k blocks of the grid row and keep this worker's (m/p) x k slice
    pub fn reduce_scatter_row(&mut self, block: Matrix) -> Result<Matrix, NmfError> {
        self.reduce_scatter(CollectiveScope::Row, Axis(0), block)
    }

    /// sum the k x (n/p_c) blocks of the grid column and keep this worker's k x (n/p) slice
    pub fn reduce_scatter_column(&mut self, block: Matrix) -> Result<Matrix, NmfError> {
        self.reduce_scatter(CollectiveScope::Column, Axis(1), block)
    }

    /// sum the blocks of all partners, then cut the sum into equal slices along `axis` and keep the slice
    /// at this worker's position among its partners
    pub fn reduce_scatter(&mut self, scope: CollectiveScope, axis: Axis, block: Matrix) -> Result<Matrix, NmfError> {
        let op = match scope {
            CollectiveScope::Column => "reduce_scatter_column",
            CollectiveScope::Row => "reduce_scatter_row",
            CollectiveScope::All => "reduce_scatter",
        };
        let round = self.round;
        let partners = self.partners(scope);
        let position = self.position_in(&partners);
        let total = block.len_of(axis);
        if total % partners.len() != 0 {
            let mut expected = block.dim();
            match axis.index() {
                0 => expected.0 = total - total % partners.len(),
                _ => expected.1 = total - total % partners.len(),
            }
            return Err(NmfError::DimensionMismatch {
                op,
                round,
                peer: None,
                expected,
                found: block.dim(),
            });
        }
        let blocks = self.exchange(op, MessageKind::Scatter, scope, block)?;
        let sum = sum_in_order(blocks);
        self.barrier_for(op, &partners)?;
        let slice_len = total / partners.len();
        let start = position * slice_len;
        let slice = match axis.index() {
            0 => sum.slice(s![start..start + slice_len, ..]).to_owned(),
            _ => sum.slice(s![.., start..start + slice_len]).to_owned(),
        };
        self.barrier_for(op, &[])?;
        Ok(slice)
    }

    /// tell every peer this worker is gone; peers waiting on it fail instead of stalling
    pub fn abort(&self) {
        warn!(node = self.node, round = self.round, "aborting");
        self.post_office.broadcast_abort(self.node, self.round);
    }

    pub fn post_office(&self) -> &Arc<PostOffice> {
        &self.post_office
    }

    fn position_in(&self, partners: &[NodeIndex]) -> usize {
        partners
            .iter()
            .position(|&node| node == self.node)
            .expect("a worker is always one of its own partners")
    }

    /// send `block` to every partner and collect one block of the current round from each, indexed by partner position;
    /// a second block from a partner that shows up after its slot is filled is caught by the following barrier
    fn exchange(
        &mut self,
        op: &'static str,
        kind: MessageKind,
        scope: CollectiveScope,
        block: Matrix,
    ) -> Result<Vec<Matrix>, NmfError> {
        let round = self.round;
        let partners = self.partners(scope);
        let position = self.position_in(&partners);
        let expected = block.dim();
        debug!(node = self.node, round, op, partners = ?partners, "exchange");
        for &peer in partners.iter() {
            if peer != self.node {
                self.post_office.send(peer, Message::new(self.node, kind, round, block.clone()));
            }
        }
        let mut slots: Vec<Option<Matrix>> = partners.iter().map(|_| None).collect();
        slots[position] = Some(block);
        let mut is_partner = vec![false; self.grid.node_num()];
        for &peer in partners.iter() {
            is_partner[peer] = true;
        }
        let deadline = self.deadline();
        while slots.iter().any(Option::is_none) {
            let message = self.receive_tagged(op, kind, deadline, |node| {
                partners
                    .iter()
                    .zip(slots.iter())
                    .any(|(&peer, slot)| peer == node && slot.is_none())
            });
            let message = message?;
            if !is_partner[message.sender] {
                warn!(
                    node = self.node,
                    round,
                    op,
                    sender = message.sender,
                    "discarding a block from outside the partner set"
                );
                continue;
            }
            let index = partners
                .iter()
                .position(|&peer| peer == message.sender)
                .expect("checked to be a partner");
            if slots[index].is_some() {
                return Err(self.duplicate(op, &message));
            }
            ensure_shape(op, round, Some(message.sender), &message.payload, expected)?;
            slots[index] = Some(message.payload);
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// take the next message of `kind` tagged with the current round; `is_missing` only names the peers
    /// in a timeout error. Aborts and messages from an earlier round are reported, never skipped.
    fn receive_tagged<F>(
        &self,
        op: &'static str,
        kind: MessageKind,
        deadline: Option<Instant>,
        is_missing: F,
    ) -> Result<Message, NmfError>
    where
        F: Fn(NodeIndex) -> bool,
    {
        let round = self.round;
        let message = self.post_office.mailbox(self.node).receive(
            |message| {
                (message.kind == kind && message.round == round)
                    || message.kind == MessageKind::Abort
                    || message.round < round
            },
            deadline,
        );
        let message = message.ok_or_else(|| NmfError::Timeout {
            op,
            round,
            node: self.node,
            missing: self.grid.all_nodes().into_iter().filter(|&node| node != self.node && is_missing(node)).collect(),
        })?;
        if message.kind == MessageKind::Abort {
            return Err(NmfError::PeerAborted {
                op,
                round,
                node: self.node,
                peer: message.sender,
            });
        }
        if message.round < round {
            return Err(NmfError::ProtocolViolation {
                op,
                round,
                node: self.node,
                peer: message.sender,
                detail: format!("a stale {:?} message of round {}", message.kind, message.round),
            });
        }
        Ok(message)
    }

    /// every peer posts its data of a round before its `Done`, so once all `Done`s of the round are in,
    /// anything else still tagged with the round is extra
    fn drain_round(&self, op: &'static str, partners: &[NodeIndex]) -> Result<(), NmfError> {
        let round = self.round;
        let mailbox = self.post_office.mailbox(self.node);
        let leftover = |message: &Message| message.round == round && message.kind != MessageKind::Abort;
        while let Some(message) = mailbox.receive(leftover, Some(Instant::now())) {
            if message.kind == MessageKind::Done || partners.contains(&message.sender) {
                return Err(self.duplicate(op, &message));
            }
            warn!(
                node = self.node,
                round,
                op,
                sender = message.sender,
                "discarding a block from outside the partner set"
            );
        }
        Ok(())
    }

    fn duplicate(&self, op: &'static str, message: &Message) -> NmfError {
        NmfError::ProtocolViolation {
            op,
            round: self.round,
            node: self.node,
            peer: message.sender,
            detail: format!("a second {:?} message", message.kind),
        }
    }
}

/// sum in slice order, so every worker holding the same blocks gets bit-identical results
fn sum_in_order(blocks: Vec<Matrix>) -> Matrix {
    let mut blocks = blocks.into_iter();
    let mut sum = blocks.next().expect("a collective always includes the caller");
    for block in blocks {
        sum += &block;
    }
    sum
}
