//! The peer event loop: poll the chat, dispatch updates, keep going.
//!
//! Both peers run the same loop; only the handler differs. Errors never
//! escape it: a failed poll is logged and retried after a backoff, and the
//! update offset is advanced only on success, so updates lost to a failed
//! poll are replayed on the next one. The sole exit is a fatal transport
//! error (rejected credentials), which is returned so the binary can
//! surface it to the operator.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::Tuning;
use crate::transport::{MessageChannel, TransportError, Update};

/// A peer's frame dispatcher, invoked once per polled update.
///
/// Handlers never fail: protocol violations are logged and dropped, and
/// stream-level errors tear down the one stream they belong to.
pub trait UpdateHandler: Send + Sync + 'static {
    fn handle_update(&self, update: &Update) -> impl Future<Output = ()> + Send;
}

/// Runs the poll-dispatch loop until a fatal transport error.
pub async fn run_poll_loop<C, H>(
    channel: Arc<C>,
    handler: Arc<H>,
    tuning: Tuning,
) -> Result<(), TransportError>
where
    C: MessageChannel,
    H: UpdateHandler,
{
    let mut offset: Option<i64> = None;

    loop {
        tokio::time::sleep(tuning.poll_interval).await;

        let updates = match channel
            .poll_updates(offset, tuning.poll_limit, tuning.poll_timeout)
            .await
        {
            Ok(updates) => updates,
            Err(e @ TransportError::Fatal { .. }) => {
                error!(error = %e, "fatal transport error, halting polling");
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, "poll failed, backing off");
                tokio::time::sleep(tuning.error_backoff).await;
                continue;
            }
        };

        if updates.is_empty() {
            continue;
        }

        if let Some(max_id) = updates.iter().map(|u| u.update_id).max() {
            offset = Some(max_id + 1);
        }
        debug!(count = updates.len(), "dispatching updates");

        for update in &updates {
            handler.handle_update(update).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted channel: returns canned poll results and records the
    /// offsets it was asked for.
    struct ScriptedChannel {
        polls: Mutex<VecDeque<Result<Vec<Update>, TransportError>>>,
        offsets: Mutex<Vec<Option<i64>>>,
    }

    impl ScriptedChannel {
        fn new(polls: Vec<Result<Vec<Update>, TransportError>>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
                offsets: Mutex::new(Vec::new()),
            }
        }
    }

    impl MessageChannel for ScriptedChannel {
        async fn send_text(&self, _chat_id: &str, _text: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send_document(
            &self,
            _chat_id: &str,
            _caption: &str,
            _data: Bytes,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn poll_updates(
            &self,
            offset: Option<i64>,
            _limit: u32,
            _timeout: Duration,
        ) -> Result<Vec<Update>, TransportError> {
            self.offsets.lock().unwrap().push(offset);
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::fatal("script exhausted")))
        }

        async fn fetch_document(&self, _file_id: &str) -> Result<Bytes, TransportError> {
            Err(TransportError::fatal("no documents in this test"))
        }
    }

    struct CountingHandler {
        seen: Mutex<Vec<i64>>,
    }

    impl UpdateHandler for CountingHandler {
        async fn handle_update(&self, update: &Update) {
            self.seen.lock().unwrap().push(update.update_id);
        }
    }

    fn update(id: i64) -> Update {
        serde_json::from_value(serde_json::json!({ "update_id": id })).unwrap()
    }

    fn fast_tuning() -> Tuning {
        Tuning {
            poll_interval: Duration::from_millis(1),
            error_backoff: Duration::from_millis(1),
            ..Tuning::default()
        }
    }

    #[tokio::test]
    async fn offset_advances_past_the_highest_update() {
        let channel = Arc::new(ScriptedChannel::new(vec![
            Ok(vec![update(5), update(7), update(6)]),
            Ok(vec![]),
        ]));
        let handler = Arc::new(CountingHandler {
            seen: Mutex::new(Vec::new()),
        });

        let result = run_poll_loop(channel.clone(), handler.clone(), fast_tuning()).await;
        assert!(result.is_err(), "loop stops on the scripted fatal error");

        let offsets = channel.offsets.lock().unwrap().clone();
        assert_eq!(offsets[0], None);
        assert_eq!(offsets[1], Some(8));
        assert_eq!(*handler.seen.lock().unwrap(), vec![5, 7, 6]);
    }

    #[tokio::test]
    async fn failed_poll_does_not_advance_the_offset() {
        let channel = Arc::new(ScriptedChannel::new(vec![
            Ok(vec![update(3)]),
            Err(TransportError::transient("blip")),
            Ok(vec![update(4)]),
        ]));
        let handler = Arc::new(CountingHandler {
            seen: Mutex::new(Vec::new()),
        });

        let _ = run_poll_loop(channel.clone(), handler.clone(), fast_tuning()).await;

        let offsets = channel.offsets.lock().unwrap().clone();
        // The transient failure leaves the offset where it was.
        assert_eq!(offsets, vec![None, Some(4), Some(4), Some(5)]);
        assert_eq!(*handler.seen.lock().unwrap(), vec![3, 4]);
    }
}
