//! Outbound IM event contract.
//!
//! Each messaging platform (Telegram, Feishu, ...) implements this trait for
//! the conversation a reply is addressed to, so the generation pipeline stays
//! platform-agnostic.
//!
//! No method returns an error: failures are logged at the platform boundary
//! and reported as `None` / `false`.

use futures::Stream;

use super::types::{DeliveryHandle, InlineKeyboard, MessageChain, StreamFragment};

pub trait MessageEvent: Send + Sync {
    /// Deliver a whole chain. Returns the handle of the primary message
    /// (the one carrying the text or keyboard), if any was sent.
    fn send(
        &self,
        chain: &MessageChain,
    ) -> impl std::future::Future<Output = Option<DeliveryHandle>> + Send;

    /// Replace the text of a sent message. Passing a keyboard renders the
    /// interactive form even if the message was plain before.
    fn edit(
        &self,
        handle: &DeliveryHandle,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> impl std::future::Future<Output = bool> + Send;

    /// Delete a sent message.
    fn delete(&self, handle: &DeliveryHandle) -> impl std::future::Future<Output = bool> + Send;

    /// Set a reaction; an empty token clears the reactions this bot added.
    fn react(
        &self,
        handle: &DeliveryHandle,
        token: &str,
    ) -> impl std::future::Future<Output = bool> + Send;

    /// Deliver a lazily produced sequence of fragments. With `use_fallback`
    /// the fragments are buffered and each break-delimited run is sent once.
    fn send_streaming<F>(
        &self,
        fragments: F,
        use_fallback: bool,
    ) -> impl std::future::Future<Output = ()> + Send
    where
        F: Stream<Item = StreamFragment> + Unpin + Send;
}
