use reqwest::Url;
use tokio::sync::mpsc;

use super::sdp::LocalCandidate;
use crate::protocol::CandidateTransport;

pub(crate) type TrickleBatch = (Url, Vec<LocalCandidate>);

/// Local candidates on their way to the PATCH sender.
///
/// Candidates gathered before the offer is answered are queued in discovery
/// order and sent exactly once when the session URL becomes known. Afterwards
/// every candidate is sent straight away. Sending happens inside the buffer,
/// so whoever holds the lock around it also fixes the order batches reach
/// the sender in.
#[derive(Debug)]
pub(crate) struct TrickleBuffer {
    session_url: Option<Url>,
    queued: Vec<LocalCandidate>,
    transport: Option<CandidateTransport>,
    tx: Option<mpsc::UnboundedSender<TrickleBatch>>,
}

impl TrickleBuffer {
    pub fn new(transport: Option<CandidateTransport>) -> Self {
        Self {
            session_url: None,
            queued: Vec::new(),
            transport,
            tx: None,
        }
    }

    /// Route batches to `tx` from now on
    pub fn attach(&mut self, tx: mpsc::UnboundedSender<TrickleBatch>) {
        self.tx = Some(tx);
    }

    /// Stop sending; the sender task ends once its channel drains
    pub fn detach(&mut self) {
        self.tx = None;
    }

    /// Queue a candidate, or send it if the session URL is known.
    pub fn push(&mut self, candidate: LocalCandidate) {
        if self.transport.is_some() && candidate.protocol != self.transport {
            return;
        }
        match &self.session_url {
            Some(url) => {
                let url = url.clone();
                self.send(url, vec![candidate]);
            }
            None => self.queued.push(candidate),
        }
    }

    /// Record the session URL and send the queue as one batch.
    /// Returns the number of flushed candidates.
    pub fn set_session(&mut self, url: Url) -> usize {
        self.session_url = Some(url.clone());
        let queued = std::mem::take(&mut self.queued);
        let count = queued.len();
        if count > 0 {
            self.send(url, queued);
        }
        count
    }

    fn send(&self, url: Url, batch: Vec<LocalCandidate>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send((url, batch));
        }
    }

    pub fn session_url(&self) -> Option<&Url> {
        self.session_url.as_ref()
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }
}
