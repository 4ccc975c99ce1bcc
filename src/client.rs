//! Client-side driver: issues one command at a time to the head and waits
//! for its completion.

use std::fmt;
use std::str::SplitWhitespace;

use crate::node::{
    client_endpoint, DhtMsg, EndpointId, Key, LogicalId, MsgTag, Value, HEAD,
};
use crate::transport::{Mailbox, TaggedMsg};
use crate::utils::DhtError;

/// Command a user can issue against the ring.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ClientCommand {
    Put { key: Key, value: Value },
    Get { key: Key },
    Add { endpoint: EndpointId, id: LogicalId },
    Remove { id: LogicalId },
    End,
}

impl ClientCommand {
    /// Expect to get the next segment string from parsed segs.
    #[inline]
    fn expect_next_seg<'s>(
        segs: &mut SplitWhitespace<'s>,
        what: &str,
    ) -> Result<&'s str, DhtError> {
        segs.next().ok_or_else(|| {
            DhtError::msg(format!("missing argument <{}>", what))
        })
    }

    /// Parses one command line, e.g. `put 9 100`. Returns `Ok(None)` on a
    /// blank line or a `#` comment.
    pub fn parse_line(line: &str) -> Result<Option<Self>, DhtError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut segs = line.split_whitespace();
        let cmd_type = match segs.next() {
            Some(seg) => seg.to_lowercase(),
            None => return Ok(None),
        };

        let cmd = match &cmd_type[..] {
            "put" => ClientCommand::Put {
                key: Self::expect_next_seg(&mut segs, "key")?.parse()?,
                value: Self::expect_next_seg(&mut segs, "value")?.parse()?,
            },
            "get" => ClientCommand::Get {
                key: Self::expect_next_seg(&mut segs, "key")?.parse()?,
            },
            "add" => ClientCommand::Add {
                endpoint: Self::expect_next_seg(&mut segs, "endpoint")?
                    .parse()?,
                id: Self::expect_next_seg(&mut segs, "id")?.parse()?,
            },
            "remove" => ClientCommand::Remove {
                id: Self::expect_next_seg(&mut segs, "id")?.parse()?,
            },
            "end" => ClientCommand::End,
            _ => {
                return Err(DhtError::msg(format!(
                    "unrecognized command: {}",
                    cmd_type
                )))
            }
        };

        if let Some(extra) = segs.next() {
            return Err(DhtError::msg(format!(
                "trailing argument '{}' after {:?}",
                extra, cmd
            )));
        }
        Ok(Some(cmd))
    }
}

/// Successful outcome of a command.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CommandOutcome {
    /// PUT / ADD / REMOVE acknowledged.
    Done,

    /// GET result along with the storage ID of the owner that served it.
    Value {
        value: Option<Value>,
        owner: LogicalId,
    },

    /// Shutdown broadcast issued.
    Ended,
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandOutcome::Done => write!(f, "ok"),
            // a missing key prints as -1
            CommandOutcome::Value { value, owner } => {
                write!(f, "{} {}", value.unwrap_or(-1), owner)
            }
            CommandOutcome::Ended => write!(f, "ended"),
        }
    }
}

/// Closed-loop client driver bound to the client endpoint.
pub struct ClientDriver {
    /// My mailbox.
    mailbox: Mailbox<DhtMsg>,

    /// Storage ID of the permanent tail; valid keys are `[1, max_id]`.
    max_id: LogicalId,

    /// Whether END has been issued.
    ended: bool,
}

impl ClientDriver {
    /// Creates a driver owning the client endpoint's mailbox.
    pub fn new(
        mailbox: Mailbox<DhtMsg>,
        max_id: LogicalId,
    ) -> Result<Self, DhtError> {
        let client = client_endpoint(mailbox.population());
        if mailbox.me() != client {
            return logged_err!(
                "mailbox of {} is not the client endpoint {}",
                mailbox.me(),
                client
            );
        }

        Ok(ClientDriver {
            mailbox,
            max_id,
            ended: false,
        })
    }

    #[inline]
    pub fn max_id(&self) -> LogicalId {
        self.max_id
    }

    #[inline]
    pub fn ended(&self) -> bool {
        self.ended
    }

    fn check_key(&self, key: Key) -> Result<(), DhtError> {
        if key < 1 || key > self.max_id {
            Err(DhtError::msg(format!(
                "key {} out of range [1, {}]",
                key, self.max_id
            )))
        } else {
            Ok(())
        }
    }

    /// Sends a command to the head and waits for its relayed reply. A REJECT
    /// reply is turned into an error.
    async fn issue(&mut self, msg: DhtMsg) -> Result<DhtMsg, DhtError> {
        if self.ended {
            return Err(DhtError::msg("ring has already been shut down"));
        }

        pf_debug!("issuing {:?}", msg);
        self.mailbox.send(HEAD, msg).await?;
        let (_, reply) = self.mailbox.recv_from(Some(HEAD), None).await?;
        if !reply.is_reply() {
            return logged_err!("unexpected {:?} <- head", reply);
        }
        match reply {
            DhtMsg::Reject { reason } => {
                pf_debug!("command rejected: {}", reason);
                Err(DhtError::msg(format!("rejected: {}", reason)))
            }
            _ => Ok(reply),
        }
    }

    /// Issues a command expecting a plain ACK.
    async fn issue_expect_ack(&mut self, msg: DhtMsg) -> Result<(), DhtError> {
        let reply = self.issue(msg).await?;
        if reply.tag() == MsgTag::Ack {
            Ok(())
        } else {
            logged_err!("unexpected reply {:?}, expecting Ack", reply)
        }
    }

    /// Stores `value` under `key`.
    pub async fn put(&mut self, key: Key, value: Value) -> Result<(), DhtError> {
        self.check_key(key)?;
        self.issue_expect_ack(DhtMsg::Put { key, value }).await
    }

    /// Looks up `key`, returning its value (`None` if never stored) and the
    /// storage ID of the node owning it.
    pub async fn get(
        &mut self,
        key: Key,
    ) -> Result<(Option<Value>, LogicalId), DhtError> {
        self.check_key(key)?;
        match self.issue(DhtMsg::Get { key }).await? {
            DhtMsg::RetVal { value, owner } => Ok((value, owner)),
            reply => {
                logged_err!("unexpected reply {:?}, expecting RetVal", reply)
            }
        }
    }

    /// Activates the inactive `endpoint` as a ring member with storage ID
    /// `id`.
    pub async fn add(
        &mut self,
        endpoint: EndpointId,
        id: LogicalId,
    ) -> Result<(), DhtError> {
        self.issue_expect_ack(DhtMsg::Add {
            candidate: endpoint,
            candidate_id: id,
        })
        .await
    }

    /// Removes the ring member holding storage ID `id`.
    pub async fn remove(&mut self, id: LogicalId) -> Result<(), DhtError> {
        self.issue_expect_ack(DhtMsg::Remove { target_id: id }).await
    }

    /// Shuts the whole ring down. No reply is expected.
    pub async fn end(&mut self) -> Result<(), DhtError> {
        if self.ended {
            return Err(DhtError::msg("ring has already been shut down"));
        }
        self.mailbox.send(HEAD, DhtMsg::End).await?;
        self.ended = true;
        pf_info!("shutdown issued");
        Ok(())
    }

    /// Executes a parsed command.
    pub async fn execute(
        &mut self,
        cmd: ClientCommand,
    ) -> Result<CommandOutcome, DhtError> {
        match cmd {
            ClientCommand::Put { key, value } => {
                self.put(key, value).await?;
                Ok(CommandOutcome::Done)
            }
            ClientCommand::Get { key } => {
                let (value, owner) = self.get(key).await?;
                Ok(CommandOutcome::Value { value, owner })
            }
            ClientCommand::Add { endpoint, id } => {
                self.add(endpoint, id).await?;
                Ok(CommandOutcome::Done)
            }
            ClientCommand::Remove { id } => {
                self.remove(id).await?;
                Ok(CommandOutcome::Done)
            }
            ClientCommand::End => {
                self.end().await?;
                Ok(CommandOutcome::Ended)
            }
        }
    }
}
