use crate::dispatcher::{Delivery, RequestDispatcher, WaiterId};
use crate::entry::Entry;
use crate::error::{LdapError, Result};
use crate::ldap_protocol::{LdapResult, ProtocolOp};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Forward-only sequence of entries for one search request, filled by the decode loop.
///
/// The terminal result is reported once: a non-success SearchResultDone or a lost
/// connection surfaces as an error from the `has_more`/`next_entry` call that
/// observes it, after every entry that arrived before it. Later calls report the
/// stream as finished.
pub struct SearchResultStream {
    waiter: WaiterId,
    rx: mpsc::Receiver<Delivery>,
    dispatcher: Arc<RequestDispatcher>,
    pending: Option<Entry>,
    referrals: Vec<String>,
    result: Option<LdapResult>,
    finished: bool,
    count: usize,
}

impl SearchResultStream {
    pub(crate) fn new(
        waiter: WaiterId,
        rx: mpsc::Receiver<Delivery>,
        dispatcher: Arc<RequestDispatcher>,
    ) -> Self {
        Self {
            waiter,
            rx,
            dispatcher,
            pending: None,
            referrals: Vec::new(),
            result: None,
            finished: false,
            count: 0,
        }
    }

    pub fn message_id(&self) -> i32 {
        self.waiter.message_id
    }

    /// Wait until an entry is ready (`true`) or the search has finished (`false`).
    pub async fn has_more(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        if self.finished {
            return Ok(false);
        }
        loop {
            let delivery = match self.rx.recv().await {
                Some(delivery) => delivery,
                None => {
                    self.finished = true;
                    return Err(LdapError::connection_lost("search response channel closed"));
                }
            };
            let message = match delivery {
                Ok(message) => message,
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            };
            match message.protocol_op {
                ProtocolOp::SearchResultEntry(entry) => {
                    self.pending = Some(Entry::from(entry));
                    return Ok(true);
                }
                ProtocolOp::SearchResultReference(uris) => {
                    debug!(
                        "Search {} returned {} referral URIs",
                        self.waiter.message_id,
                        uris.len()
                    );
                    self.referrals.extend(uris);
                }
                ProtocolOp::SearchResultDone(result) => {
                    self.finished = true;
                    self.result = Some(result.clone());
                    result.success()?;
                    return Ok(false);
                }
                other => {
                    self.finished = true;
                    self.dispatcher.unregister(self.waiter);
                    return Err(LdapError::protocol(format!(
                        "Unexpected {} in response to search {}",
                        other.name(),
                        self.waiter.message_id
                    )));
                }
            }
        }
    }

    /// Next entry; `StreamExhausted` once the stream has finished.
    pub async fn next_entry(&mut self) -> Result<Entry> {
        if !self.has_more().await? {
            return Err(LdapError::StreamExhausted);
        }
        let entry = self.pending.take().ok_or(LdapError::StreamExhausted)?;
        self.count += 1;
        Ok(entry)
    }

    /// Entries handed out so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Continuation references received so far. They are never followed.
    pub fn referrals(&self) -> &[String] {
        &self.referrals
    }

    /// The SearchResultDone body, once it has arrived.
    pub fn result(&self) -> Option<&LdapResult> {
        self.result.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_none()
    }

    /// Drain the remaining entries.
    pub async fn collect_entries(&mut self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        while self.has_more().await? {
            entries.push(self.next_entry().await?);
        }
        Ok(entries)
    }

    /// Tell the server to stop and retire the waiter. Frames already in flight are discarded.
    pub async fn abandon(mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.pending = None;
        self.dispatcher.unregister(self.waiter);
        self.dispatcher
            .send_oneway(ProtocolOp::AbandonRequest(self.waiter.message_id))
            .await?;
        debug!("Abandoned search {}", self.waiter.message_id);
        Ok(())
    }
}

impl Drop for SearchResultStream {
    fn drop(&mut self) {
        if !self.finished {
            self.dispatcher.unregister(self.waiter);
        }
    }
}

impl std::fmt::Debug for SearchResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchResultStream")
            .field("message_id", &self.waiter.message_id)
            .field("count", &self.count)
            .field("finished", &self.finished)
            .finish()
    }
}
