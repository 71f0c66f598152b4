//! Telegram notification channel.
//!
//! Outbound delivery of finished jobs ([`channel`]), inbound command
//! handling that turns chat messages into jobs ([`inbound`]), and the
//! `getUpdates` long-poll transport that feeds it ([`poller`]). Both the
//! poller and a webhook endpoint hand updates to the same
//! [`inbound::InboundHandler`].

pub mod api;
pub mod channel;
pub mod inbound;
pub mod poller;
pub mod types;
