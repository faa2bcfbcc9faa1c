//! Card presence handling and pending-write lifecycle.
//!
//! [`CardSession`] sits between the reader hardware and the command
//! dispatcher. It latches one of two states: idle, or holding a pending
//! write submitted by an external caller (the control panel). Each poll
//! first expires a stale pending write, then probes the reader; a presented
//! card either consumes the pending buffer or is read and handed to the
//! session's [`CommandSink`].

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::tag::{self, CardKey, CardReader};

/// How long a submitted write waits for a card before being discarded.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// First sector used for command storage, leaving sector 0 (manufacturer
/// data) untouched.
pub const DEFAULT_START_SECTOR: u8 = 1;

/// Capacity of the read buffer handed to the codec on the read path.
pub const READ_BUFFER_LEN: usize = 255;

/// Receiver for commands read back from a card.
///
/// Implemented by the command dispatcher; test code substitutes a recording
/// sink so the session can be driven without any command side effects.
pub trait CommandSink {
    /// Called with the card's UID and the raw buffer read from it. Only
    /// invoked after an error-free read.
    async fn handle_command(&mut self, card_uid: &[u8], payload: &[u8]);
}

/// A buffer waiting for the next presented card.
struct PendingWrite {
    buffer: Vec<u8>,
    deadline: Instant,
}

/// Result of one [`CardSession::poll`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No card on the reader.
    Idle,
    /// A card was present but its chip family is not handled.
    Unsupported,
    /// The pending buffer was written to a presented card.
    Written,
    /// A card was read and its command handed to the sink.
    Dispatched,
    /// A card was present but the codec operation failed; details logged.
    Failed,
}

/// Poll-driven card session.
pub struct CardSession {
    pending: Option<PendingWrite>,
    write_timeout: Duration,
    start_sector: u8,
    read_len: usize,
    key: CardKey,
}

impl Default for CardSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CardSession {
    pub fn new() -> Self {
        Self {
            pending: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            start_sector: DEFAULT_START_SECTOR,
            read_len: READ_BUFFER_LEN,
            key: CardKey::DEFAULT,
        }
    }

    /// Change how long a pending write waits for a card.
    pub fn set_write_timeout(&mut self, timeout: Duration) {
        debug!(?timeout, "setting write timeout");
        self.write_timeout = timeout;
    }

    /// Submit a buffer to be written to the next presented card.
    ///
    /// Replaces any previous pending buffer and restarts the timeout.
    pub fn submit_write(&mut self, buffer: Vec<u8>) {
        if self.pending.is_some() {
            debug!("replacing previous pending write");
        }
        self.pending = Some(PendingWrite {
            buffer,
            deadline: Instant::now() + self.write_timeout,
        });
    }

    /// Discard any pending write immediately.
    pub fn cancel_write(&mut self) {
        if self.pending.take().is_some() {
            info!("cancelled pending write");
        }
    }

    /// Whether a write is currently waiting for a card.
    pub fn write_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Run one poll pass: expire a stale pending write, probe for a card,
    /// and drive a single codec operation against it.
    ///
    /// A pending write is attempted at most once per detected card,
    /// regardless of outcome; there is no automatic retry.
    pub async fn poll<R, S>(&mut self, reader: &mut R, sink: &mut S) -> PollOutcome
    where
        R: CardReader,
        S: CommandSink,
    {
        if let Some(pending) = &self.pending
            && Instant::now() > pending.deadline
        {
            info!("write timer expired, cancelling write to card");
            self.cancel_write();
        }

        let Some(card) = reader.detect() else {
            return PollOutcome::Idle;
        };

        info!(uid = ?card.uid, family = ?card.family, "new card detected");

        if !card.family.supported() {
            warn!(family = ?card.family, "unsupported chip family, ignoring card");
            reader.halt();
            return PollOutcome::Unsupported;
        }

        let outcome = if let Some(pending) = self.pending.take() {
            match tag::write_buffer(reader, self.start_sector, &pending.buffer, &self.key) {
                Ok(()) => {
                    info!(len = pending.buffer.len(), "wrote buffer to card");
                    PollOutcome::Written
                }
                Err(e) => {
                    warn!(error = %e, "error while writing card");
                    PollOutcome::Failed
                }
            }
        } else {
            match tag::read_buffer(reader, self.start_sector, self.read_len, &self.key) {
                Ok(data) => {
                    sink.handle_command(&card.uid, &data).await;
                    PollOutcome::Dispatched
                }
                Err(e) => {
                    warn!(error = %e, "error while reading card");
                    PollOutcome::Failed
                }
            }
        };

        reader.halt();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{ChipFamily, MemoryCard};

    #[derive(Default)]
    struct RecordingSink {
        calls: Vec<(Vec<u8>, Vec<u8>)>,
    }

    impl CommandSink for RecordingSink {
        async fn handle_command(&mut self, card_uid: &[u8], payload: &[u8]) {
            self.calls.push((card_uid.to_vec(), payload.to_vec()));
        }
    }

    #[tokio::test]
    async fn idle_poll_does_nothing() {
        let mut session = CardSession::new();
        let mut card = MemoryCard::classic_1k(&[1]);
        let mut sink = RecordingSink::default();

        assert_eq!(session.poll(&mut card, &mut sink).await, PollOutcome::Idle);
        assert!(sink.calls.is_empty());
    }

    #[tokio::test]
    async fn write_then_read_round_trips_through_card() {
        let mut session = CardSession::new();
        let mut card = MemoryCard::classic_1k(&[0xAB, 0xCD]);
        let mut sink = RecordingSink::default();

        session.submit_write(b"LOCK".to_vec());
        card.present();
        assert_eq!(
            session.poll(&mut card, &mut sink).await,
            PollOutcome::Written
        );
        assert!(!session.write_pending());

        card.present();
        assert_eq!(
            session.poll(&mut card, &mut sink).await,
            PollOutcome::Dispatched
        );

        let (uid, payload) = &sink.calls[0];
        assert_eq!(uid, &[0xAB, 0xCD]);
        assert_eq!(&payload[..4], b"LOCK");
        assert!(payload[4..].iter().all(|&b| b == 0));
        assert_eq!(payload.len(), READ_BUFFER_LEN);
    }

    #[tokio::test]
    async fn resubmission_replaces_pending_buffer() {
        let mut session = CardSession::new();
        let mut card = MemoryCard::classic_1k(&[1]);
        let mut sink = RecordingSink::default();

        session.submit_write(b"STOP".to_vec());
        session.submit_write(b"LOCK".to_vec());

        card.present();
        session.poll(&mut card, &mut sink).await;
        assert_eq!(&card.block(4)[..4], b"LOCK");
    }

    #[tokio::test]
    async fn expired_write_is_discarded_before_card_handling() {
        let mut session = CardSession::new();
        session.set_write_timeout(Duration::ZERO);
        let mut card = MemoryCard::classic_1k(&[1]);
        let mut sink = RecordingSink::default();

        session.submit_write(b"STOP".to_vec());
        std::thread::sleep(Duration::from_millis(5));

        // The stale write is dropped, so the presented card is read instead.
        card.present();
        assert_eq!(
            session.poll(&mut card, &mut sink).await,
            PollOutcome::Dispatched
        );
        assert!(!session.write_pending());
        assert_eq!(card.block(4), &[0u8; 16]);
    }

    #[tokio::test]
    async fn cancel_discards_pending_write() {
        let mut session = CardSession::new();
        session.submit_write(b"STOP".to_vec());
        session.cancel_write();
        assert!(!session.write_pending());
    }

    #[tokio::test]
    async fn unsupported_family_is_ignored() {
        let mut session = CardSession::new();
        let mut card = MemoryCard::with_family(&[9], ChipFamily::Unknown, 64);
        let mut sink = RecordingSink::default();

        session.submit_write(b"STOP".to_vec());
        card.present();
        assert_eq!(
            session.poll(&mut card, &mut sink).await,
            PollOutcome::Unsupported
        );

        // The pending write survives for a supported card.
        assert!(session.write_pending());
        assert!(sink.calls.is_empty());
    }

    #[tokio::test]
    async fn write_is_attempted_at_most_once() {
        let mut session = CardSession::new();
        let mut card = MemoryCard::classic_1k(&[1]);
        card.deny_sector(1);
        let mut sink = RecordingSink::default();

        session.submit_write(b"STOP".to_vec());
        card.present();
        assert_eq!(
            session.poll(&mut card, &mut sink).await,
            PollOutcome::Failed
        );

        // The buffer is consumed even though the write failed.
        assert!(!session.write_pending());
    }

    #[tokio::test]
    async fn failed_read_does_not_reach_the_sink() {
        let mut session = CardSession::new();
        let mut card = MemoryCard::classic_1k(&[1]);
        card.deny_sector(2);
        let mut sink = RecordingSink::default();

        card.present();
        assert_eq!(
            session.poll(&mut card, &mut sink).await,
            PollOutcome::Failed
        );
        assert!(sink.calls.is_empty());
    }
}
