//! Mailbox
//!
//! Every worker owns one inbound queue; any worker may post into any other worker's queue.
//! Posting never blocks. Receiving blocks until a message matching the caller's filter shows up,
//! leaving everything else queued in arrival order for later calls.
//!

use super::matrix::*;
use super::util::*;
use crate::derivative::Derivative;
use crate::parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// barrier signal, carries no data
    Done,
    /// all-reduce contribution
    Gather,
    /// all-gather contribution within a grid row
    RowGather,
    /// all-gather contribution within a grid column
    ColGather,
    /// reduce-scatter contribution
    Scatter,
    /// the sender failed and will not take part in any further round
    Abort,
}

/// a tagged block; the payload is always an owned copy, never shared with the sender
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Message {
    pub sender: NodeIndex,
    pub kind: MessageKind,
    pub round: Round,
    #[derivative(Debug = "ignore")]
    pub payload: Matrix,
}

impl Message {
    pub fn new(sender: NodeIndex, kind: MessageKind, round: Round, payload: Matrix) -> Self {
        Self {
            sender,
            kind,
            round,
            payload,
        }
    }

    /// a message whose only content is its tag
    pub fn signal(sender: NodeIndex, kind: MessageKind, round: Round) -> Self {
        Self::new(sender, kind, round, Matrix::zeros((0, 0)))
    }
}

/// FIFO queue with many producers and a single consumer (the owner)
#[derive(Default)]
pub struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    arrived: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, message: Message) {
        let mut queue = self.queue.lock();
        queue.push_back(message);
        // only the owner ever waits on this mailbox
        self.arrived.notify_one();
    }

    /// take the oldest message accepted by `filter`, waiting until `deadline` if there is none yet;
    /// returns `None` on timeout
    pub fn receive<F>(&self, mut filter: F, deadline: Option<Instant>) -> Option<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let mut queue = self.queue.lock();
        loop {
            if let Some(position) = queue.iter().position(&mut filter) {
                return queue.remove(position);
            }
            match deadline {
                Some(deadline) => {
                    if self.arrived.wait_until(&mut queue, deadline).timed_out() {
                        // one last look: a message may have landed right at the deadline
                        return queue.iter().position(&mut filter).and_then(|position| queue.remove(position));
                    }
                }
                None => self.arrived.wait(&mut queue),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// what happened, in one global order, for replaying a run after the fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Sent {
        from: NodeIndex,
        to: NodeIndex,
        kind: MessageKind,
        round: Round,
    },
    BarrierPassed {
        node: NodeIndex,
        round: Round,
    },
}

#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// check that no worker passed the barrier of round r before every peer had signalled round r,
    /// and that every worker passed its barriers in consecutive rounds starting from 0
    pub fn check_barrier_order(&self, node_num: usize) -> Result<(), String> {
        let events = self.events.lock();
        // signalled[r][q]: worker q has sent `Done` for round r
        let mut signalled: Vec<Vec<bool>> = vec![];
        let mut next_round = vec![0; node_num];
        for (sequence, event) in events.iter().enumerate() {
            match *event {
                Event::Sent {
                    from,
                    kind: MessageKind::Done,
                    round,
                    ..
                } => {
                    while signalled.len() <= round {
                        signalled.push(vec![false; node_num]);
                    }
                    signalled[round][from] = true;
                }
                Event::BarrierPassed { node, round } => {
                    if round != next_round[node] {
                        return Err(format!(
                            "event {sequence}: worker {node} passed round {round}, expected round {}",
                            next_round[node]
                        ));
                    }
                    next_round[node] += 1;
                    for peer in 0..node_num {
                        let ready = peer == node || signalled.get(round).map(|row| row[peer]).unwrap_or(false);
                        if !ready {
                            return Err(format!(
                                "event {sequence}: worker {node} passed round {round} before worker {peer} signalled"
                            ));
                        }
                    }
                }
                Event::Sent { .. } => {}
            }
        }
        Ok(())
    }
}

/// all mailboxes of one run, shared by every worker
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PostOffice {
    #[derivative(Debug = "ignore")]
    mailboxes: Vec<Mailbox>,
    event_log: Option<Arc<EventLog>>,
}

impl PostOffice {
    pub fn new(node_num: usize, event_log: Option<Arc<EventLog>>) -> Self {
        Self {
            mailboxes: (0..node_num).map(|_| Mailbox::new()).collect(),
            event_log,
        }
    }

    pub fn node_num(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn send(&self, target: NodeIndex, message: Message) {
        if let Some(event_log) = self.event_log.as_ref() {
            event_log.record(Event::Sent {
                from: message.sender,
                to: target,
                kind: message.kind,
                round: message.round,
            });
        }
        self.mailboxes[target].post(message);
    }

    pub fn mailbox(&self, node: NodeIndex) -> &Mailbox {
        &self.mailboxes[node]
    }

    pub fn record(&self, event: Event) {
        if let Some(event_log) = self.event_log.as_ref() {
            event_log.record(event);
        }
    }

    /// tell every other worker that `sender` will not take part in anything anymore
    pub fn broadcast_abort(&self, sender: NodeIndex, round: Round) {
        for target in 0..self.node_num() {
            if target != sender {
                self.send(target, Message::signal(sender, MessageKind::Abort, round));
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn mailbox_keeps_unmatched_messages() {
        // cargo test mailbox_keeps_unmatched_messages -- --nocapture
        let mailbox = Mailbox::new();
        mailbox.post(Message::signal(1, MessageKind::Done, 3));
        mailbox.post(Message::signal(2, MessageKind::Gather, 2));
        mailbox.post(Message::signal(1, MessageKind::Done, 2));
        let message = mailbox
            .receive(|message| message.kind == MessageKind::Done && message.round == 2, None)
            .unwrap();
        assert_eq!((message.sender, message.round), (1, 2));
        assert_eq!(mailbox.len(), 2);
        // the future-round message is still there, in arrival order
        let message = mailbox.receive(|message| message.kind == MessageKind::Done, None).unwrap();
        assert_eq!(message.round, 3);
    }

    #[test]
    fn mailbox_receive_timeout() {
        // cargo test mailbox_receive_timeout -- --nocapture
        let mailbox = Mailbox::new();
        mailbox.post(Message::signal(1, MessageKind::Gather, 0));
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(mailbox.receive(|message| message.kind == MessageKind::Done, Some(deadline)).is_none());
        assert_eq!(mailbox.len(), 1);
    }

    #[test]
    fn mailbox_blocking_receive_wakes_up() {
        // cargo test mailbox_blocking_receive_wakes_up -- --nocapture
        let post_office = Arc::new(PostOffice::new(2, None));
        let sender = {
            let post_office = Arc::clone(&post_office);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                post_office.send(0, Message::new(1, MessageKind::Scatter, 5, Matrix::ones((2, 2))));
            })
        };
        let message = post_office
            .mailbox(0)
            .receive(|message| message.kind == MessageKind::Scatter, None)
            .unwrap();
        sender.join().unwrap();
        assert_eq!(message.payload, Matrix::ones((2, 2)));
        assert!(post_office.mailbox(0).is_empty());
    }

    #[test]
    fn mailbox_event_log_detects_early_pass() {
        // cargo test mailbox_event_log_detects_early_pass -- --nocapture
        let event_log = EventLog::new();
        event_log.record(Event::Sent {
            from: 0,
            to: 1,
            kind: MessageKind::Done,
            round: 0,
        });
        event_log.record(Event::BarrierPassed { node: 1, round: 0 });
        assert!(event_log.check_barrier_order(2).is_ok());
        event_log.record(Event::BarrierPassed { node: 0, round: 0 });
        assert!(event_log.check_barrier_order(2).is_err(), "worker 1 never signalled round 0");
    }
}
