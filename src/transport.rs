//! In-process transport fabric: one tagged-message mailbox per endpoint.
//!
//! Semantics follow the point-to-point messaging contract the ring protocol
//! is written against:
//!   - `send` is order-preserving per (source, destination) pair;
//!   - `probe` blocks until some message is pending and reveals its sender
//!     and tag without consuming it;
//!   - `recv_from` blocks until a message matching the given source and tag
//!     filters arrives; non-matching messages stay queued in arrival order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::node::EndpointId;
use crate::utils::DhtError;

use tokio::sync::mpsc;

/// Messages carried by the transport expose a tag used for selective
/// receiving.
pub trait TaggedMsg: fmt::Debug + Send + 'static {
    type Tag: fmt::Debug + Copy + Eq + Send;

    fn tag(&self) -> Self::Tag;
}

/// Envelope type put onto the channels: `(source, msg)`.
type Envelope<Msg> = (EndpointId, Msg);

/// Transport fabric holding the not-yet-claimed mailboxes of all endpoints.
pub struct TransportHub<Msg: TaggedMsg> {
    /// Total number of endpoints.
    population: EndpointId,

    /// Mailboxes indexed by endpoint ID, taken out once by their owners.
    mailboxes: Vec<Option<Mailbox<Msg>>>,
}

impl<Msg: TaggedMsg> TransportHub<Msg> {
    /// Creates the channels of a fully connected group of `population`
    /// endpoints, each recv channel holding at most `chan_recv_cap`
    /// in-flight messages.
    pub fn new_and_setup(
        population: EndpointId,
        chan_recv_cap: usize,
    ) -> Result<Self, DhtError> {
        if population == 0 {
            return logged_err!("invalid population {}", population);
        }
        if chan_recv_cap == 0 {
            return logged_err!("invalid chan_recv_cap {}", chan_recv_cap);
        }

        let mut tx_sends = Vec::with_capacity(population as usize);
        let mut rx_recvs = Vec::with_capacity(population as usize);
        for _ in 0..population {
            let (tx_send, rx_recv) = mpsc::channel(chan_recv_cap);
            tx_sends.push(tx_send);
            rx_recvs.push(rx_recv);
        }
        let tx_sends = Arc::new(tx_sends);

        let mailboxes = rx_recvs
            .into_iter()
            .enumerate()
            .map(|(me, rx_recv)| {
                Some(Mailbox {
                    me: me as EndpointId,
                    tx_sends: tx_sends.clone(),
                    rx_recv,
                    pending: VecDeque::new(),
                })
            })
            .collect();

        Ok(TransportHub {
            population,
            mailboxes,
        })
    }

    #[inline]
    pub fn population(&self) -> EndpointId {
        self.population
    }

    /// Hands out the mailbox of given endpoint. Each mailbox can be taken
    /// only once.
    pub fn take_mailbox(
        &mut self,
        endpoint: EndpointId,
    ) -> Result<Mailbox<Msg>, DhtError> {
        if endpoint >= self.population {
            return logged_err!("invalid endpoint ID {} to take", endpoint);
        }
        match self.mailboxes[endpoint as usize].take() {
            Some(mailbox) => Ok(mailbox),
            None => logged_err!("mailbox of {} already taken", endpoint),
        }
    }
}

/// Per-endpoint messaging handle.
pub struct Mailbox<Msg: TaggedMsg> {
    /// My endpoint ID.
    me: EndpointId,

    /// Sender sides of every endpoint's recv channel, indexed by ID.
    tx_sends: Arc<Vec<mpsc::Sender<Envelope<Msg>>>>,

    /// Receiver side of my recv channel.
    rx_recv: mpsc::Receiver<Envelope<Msg>>,

    /// Messages already pulled off the channel but not consumed yet, in
    /// arrival order.
    pending: VecDeque<Envelope<Msg>>,
}

impl<Msg: TaggedMsg> Mailbox<Msg> {
    #[inline]
    pub fn me(&self) -> EndpointId {
        self.me
    }

    #[inline]
    pub fn population(&self) -> EndpointId {
        self.tx_sends.len() as EndpointId
    }

    /// Number of messages pulled off the channel but not yet consumed.
    #[inline]
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Sends a message to given endpoint.
    pub async fn send(
        &self,
        dest: EndpointId,
        msg: Msg,
    ) -> Result<(), DhtError> {
        match self.tx_sends.get(dest as usize) {
            Some(tx_send) => {
                pf_trace!("send -> {} {:?}", dest, msg);
                tx_send.send((self.me, msg)).await?;
                Ok(())
            }
            None => logged_err!("invalid destination endpoint {}", dest),
        }
    }

    /// Pulls the next message off the recv channel.
    async fn pull(&mut self) -> Result<Envelope<Msg>, DhtError> {
        match self.rx_recv.recv().await {
            Some(envelope) => Ok(envelope),
            None => logged_err!("recv channel has been closed"),
        }
    }

    /// Waits until some message is pending and returns its sender and tag
    /// without consuming it.
    pub async fn probe(&mut self) -> Result<(EndpointId, Msg::Tag), DhtError> {
        if self.pending.is_empty() {
            let envelope = self.pull().await?;
            self.pending.push_back(envelope);
        }
        let (source, msg) = &self.pending[0];
        Ok((*source, msg.tag()))
    }

    /// Receives the oldest message matching given source and tag filters,
    /// where `None` matches anything. Blocks until one arrives.
    pub async fn recv_from(
        &mut self,
        source: Option<EndpointId>,
        tag: Option<Msg::Tag>,
    ) -> Result<Envelope<Msg>, DhtError> {
        let matches = |envelope: &Envelope<Msg>| {
            source.map_or(true, |s| s == envelope.0)
                && tag.map_or(true, |t| t == envelope.1.tag())
        };

        if let Some(idx) = self.pending.iter().position(matches) {
            if let Some(envelope) = self.pending.remove(idx) {
                return Ok(envelope);
            }
        }

        loop {
            let envelope = self.pull().await?;
            if matches(&envelope) {
                return Ok(envelope);
            }
            self.pending.push_back(envelope);
        }
    }

    /// Receives the oldest message from anyone.
    #[inline]
    pub async fn recv_any(&mut self) -> Result<Envelope<Msg>, DhtError> {
        self.recv_from(None, None).await
    }
}
