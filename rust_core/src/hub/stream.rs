//! Subscriber-facing token stream

use super::registry::SubscriptionId;
use crate::types::Token;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Receiving end of a hub or trigger subscription.
///
/// Ends when the subscription's cancellation token fires. Tokens still in
/// flight at that point are not yielded.
pub struct TokenStream {
    id: SubscriptionId,
    rx: mpsc::Receiver<Token>,
    cancel: CancellationToken,
}

impl TokenStream {
    pub(crate) fn new(
        id: SubscriptionId,
        rx: mpsc::Receiver<Token>,
        cancel: CancellationToken,
    ) -> Self {
        Self { id, rx, cancel }
    }

    /// Registry id of the underlying hub subscription
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Token> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            token = self.rx.recv() => token.filter(|_| !self.cancel.is_cancelled()),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for TokenStream {
    type Item = Token;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}
